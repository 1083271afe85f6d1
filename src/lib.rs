//! Library entrypoint: re‑export modules

pub mod config;
pub mod errors;
pub mod excise;
pub mod metrics;
pub mod pipeline;
pub mod remote;
pub mod series;
