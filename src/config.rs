//! Type-safe configuration loader using the `config` crate, layered under
//! command-line flags parsed by `clap`.
//!
//! Precedence, lowest first: built-in defaults, optional TOML file,
//! `APP__*` environment variables, command-line flags.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::errors::PatchError;
use crate::excise::TimeWindow;

// BUILD_DATE and RUSTC_VERSION are set by build.rs.
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " built on ",
    env!("BUILD_DATE"),
    " with ",
    env!("RUSTC_VERSION")
);

/// Remove points recorded in a bad time window from VictoriaMetrics series.
#[derive(Parser, Debug)]
#[command(
    name = "vm-patch-metrics",
    version = LONG_VERSION,
    long_version = LONG_VERSION,
    disable_version_flag = true
)]
pub struct Cli {
    /// Display version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,

    /// Optional TOML settings file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// VictoriaMetrics base URL
    #[arg(long)]
    pub url: Option<String>,

    /// User to authenticate as
    #[arg(long)]
    pub user: Option<String>,

    /// Password for the user
    #[arg(long)]
    pub password: Option<String>,

    /// Start of the exported range (RFC3339)
    #[arg(long)]
    pub export_start: Option<String>,

    /// End of the exported range (RFC3339, default now)
    #[arg(long)]
    pub export_end: Option<String>,

    /// Start of the window whose points are removed (RFC3339, exclusive)
    #[arg(long)]
    pub remove_start: Option<String>,

    /// End of the window whose points are removed (RFC3339, exclusive, default now)
    #[arg(long)]
    pub remove_end: Option<String>,

    /// Series selector to export, delete and re-import
    #[arg(long = "match")]
    pub match_expr: Option<String>,

    /// File the raw export is written to
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// File the excised records are written to
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Write Prometheus text metrics here when the run ends
    #[arg(long, value_name = "FILE")]
    pub metrics_file: Option<PathBuf>,
}

/// Settings for one run. Immutable once loaded.
#[derive(Deserialize, Clone)]
pub struct Settings {
    /// VictoriaMetrics base URL
    pub url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    pub export_start: DateTime<Utc>,
    pub export_end: DateTime<Utc>,
    pub remove_start: DateTime<Utc>,
    pub remove_end: DateTime<Utc>,

    /// Series selector (`match[]`)
    #[serde(rename = "match")]
    pub match_expr: String,

    /// Raw export file
    pub file: PathBuf,

    /// Excised output file
    pub output: PathBuf,

    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("export_start", &self.export_start)
            .field("export_end", &self.export_end)
            .field("remove_start", &self.remove_start)
            .field("remove_end", &self.remove_end)
            .field("match", &self.match_expr)
            .field("file", &self.file)
            .field("output", &self.output)
            .field("metrics_file", &self.metrics_file)
            .finish()
    }
}

impl Settings {
    /// Load settings from defaults, the optional `--config` file (else
    /// `Config.toml` if present), `APP__*` environment variables and finally
    /// the command-line flags.
    pub fn new(cli: Cli) -> Result<Self, PatchError> {
        let now = Utc::now().to_rfc3339();
        let config_file = match &cli.config {
            Some(path) => File::from(path.as_path()).required(true),
            None => File::with_name("Config").required(false),
        };

        let cfg = Config::builder()
            .set_default("url", "http://localhost:8428")?
            .set_default("export_end", now.as_str())?
            .set_default("remove_end", now.as_str())?
            .set_default("file", "./metrics.jsonl")?
            .set_default("output", "./update.jsonl")?
            .add_source(config_file)
            .add_source(Environment::with_prefix("APP").prefix_separator("__").separator("__"))
            .set_override_option("url", cli.url)?
            .set_override_option("user", cli.user)?
            .set_override_option("password", cli.password)?
            .set_override_option("export_start", cli.export_start)?
            .set_override_option("export_end", cli.export_end)?
            .set_override_option("remove_start", cli.remove_start)?
            .set_override_option("remove_end", cli.remove_end)?
            .set_override_option("match", cli.match_expr)?
            .set_override_option("file", path_string(cli.file))?
            .set_override_option("output", path_string(cli.output))?
            .set_override_option("metrics_file", path_string(cli.metrics_file))?
            .build()?;

        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), PatchError> {
        if self.match_expr.trim().is_empty() {
            return Err(PatchError::Invalid("`match` must not be empty".into()));
        }
        if self.export_start > self.export_end {
            return Err(PatchError::Invalid(format!(
                "export start {} is after export end {}",
                self.export_start, self.export_end
            )));
        }
        if self.remove_start >= self.remove_end {
            return Err(PatchError::Invalid(format!(
                "remove start {} must be before remove end {}",
                self.remove_start, self.remove_end
            )));
        }
        if same_file_path(&self.file, &self.output) {
            return Err(PatchError::Invalid(format!(
                "export file and output file are both {}",
                self.file.display()
            )));
        }
        Ok(())
    }

    /// The window of points to remove.
    pub fn removal_window(&self) -> TimeWindow {
        TimeWindow::from_datetimes(self.remove_start, self.remove_end)
    }
}

/// Compare two paths after resolving their parent directories, so that
/// `update.jsonl` and `./update.jsonl` are recognised as the same file.
/// The files themselves need not exist yet.
fn same_file_path(a: &Path, b: &Path) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let parent = parent
        .canonicalize()
        .unwrap_or_else(|_| parent.to_path_buf());
    match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    }
}

fn path_string(path: Option<PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["vm-patch-metrics"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    const BASE: &[&str] = &[
        "--export-start",
        "2024-01-01T00:00:00Z",
        "--export-end",
        "2024-02-01T00:00:00Z",
        "--remove-start",
        "2024-01-10T00:00:00Z",
        "--remove-end",
        "2024-01-11T00:00:00Z",
        "--match",
        "{__name__=~\"health_.*\"}",
    ];

    #[test]
    fn flags_populate_settings() {
        let settings = Settings::new(cli(BASE)).unwrap();
        assert_eq!(settings.url, "http://localhost:8428");
        assert_eq!(settings.match_expr, "{__name__=~\"health_.*\"}");
        assert_eq!(settings.file, PathBuf::from("./metrics.jsonl"));
        assert_eq!(settings.output, PathBuf::from("./update.jsonl"));

        let window = settings.removal_window();
        assert_eq!(window.start_ms, 1_704_844_800_000);
        assert_eq!(window.end_ms, 1_704_931_200_000);
    }

    #[test]
    fn offsets_are_normalised_to_utc() {
        let mut args = BASE.to_vec();
        args[5] = "2024-01-10T02:00:00+02:00";
        let settings = Settings::new(cli(&args)).unwrap();
        assert_eq!(settings.remove_start.timestamp_millis(), 1_704_844_800_000);
    }

    #[test]
    fn malformed_time_is_rejected() {
        let mut args = BASE.to_vec();
        args[5] = "yesterday";
        assert!(matches!(Settings::new(cli(&args)), Err(PatchError::Config(_))));
    }

    #[test]
    fn missing_match_is_rejected() {
        let args = &BASE[..8];
        assert!(Settings::new(cli(args)).is_err());
    }

    #[test]
    fn inverted_removal_window_is_rejected() {
        let mut args = BASE.to_vec();
        args[5] = "2024-01-12T00:00:00Z";
        assert!(matches!(Settings::new(cli(&args)), Err(PatchError::Invalid(_))));
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let mut args = BASE.to_vec();
        args.extend_from_slice(&["--user", "admin", "--password", "hunter2"]);
        let settings = Settings::new(cli(&args)).unwrap();
        let shown = format!("{:?}", settings);
        assert!(shown.contains("admin"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn export_and_output_must_differ_after_normalisation() {
        let mut args = BASE.to_vec();
        args.extend_from_slice(&["--file", "update.jsonl", "--output", "./update.jsonl"]);
        assert!(matches!(Settings::new(cli(&args)), Err(PatchError::Invalid(_))));

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let direct = dir.path().join("metrics.jsonl");
        let roundabout = dir.path().join("sub").join("..").join("metrics.jsonl");
        assert!(same_file_path(&direct, &roundabout));
        assert!(!same_file_path(&direct, &dir.path().join("update.jsonl")));
    }

    #[test]
    fn short_version_flag_prints_build_metadata() {
        for flag in ["-v", "--version"] {
            let err = Cli::try_parse_from(["vm-patch-metrics", flag]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
            let shown = err.to_string();
            assert!(shown.contains(env!("CARGO_PKG_VERSION")));
            assert!(shown.contains(env!("BUILD_DATE")));
            assert!(shown.contains(env!("RUSTC_VERSION")));
        }
    }

    #[test]
    fn unknown_flag_is_a_parse_error() {
        assert!(Cli::try_parse_from(["vm-patch-metrics", "--bogus"]).is_err());
    }
}
