//! pipeline.rs
//!
//! Sequences the four stages against one remote store:
//!
//! `Idle → Exported → Excised → Deleted → Imported → Done`
//!
//! Any failure moves the pipeline to `Failed` and stops it. There is no
//! resume: once `Deleted` has been reached the excised file is the only copy
//! of the affected series until `Imported` succeeds.

use std::fmt;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::errors::PatchError;
use crate::excise::{excise_file, ExciseSummary};
use crate::metrics::STAGE_HISTOGRAM;
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Exported,
    Excised,
    Deleted,
    Imported,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Exported => "exported",
            Stage::Excised => "excised",
            Stage::Deleted => "deleted",
            Stage::Imported => "imported",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a full run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunReport {
    pub exported_bytes: u64,
    pub excise: ExciseSummary,
}

/// One patch run: settings, remote client and current stage.
pub struct Pipeline {
    settings: Settings,
    store: RemoteStore,
    stage: Stage,
    report: RunReport,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Result<Self, PatchError> {
        let store = RemoteStore::from_settings(&settings)?;
        Ok(Pipeline {
            settings,
            store,
            stage: Stage::Idle,
            report: RunReport::default(),
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Drive the pipeline until `Done` or the first failure.
    pub async fn run(&mut self) -> Result<RunReport, PatchError> {
        loop {
            match self.stage {
                Stage::Done => return Ok(self.report),
                Stage::Failed => return Err(PatchError::AlreadyFailed),
                _ => {
                    self.advance().await?;
                }
            }
        }
    }

    /// Run the stage that follows the current one.
    pub async fn advance(&mut self) -> Result<Stage, PatchError> {
        let from = self.stage;
        let started = Instant::now();

        let next = match from {
            Stage::Idle => self.export().await.map(|_| Stage::Exported),
            Stage::Exported => self.excise().map(|_| Stage::Excised),
            Stage::Excised => self.delete().await.map(|_| Stage::Deleted),
            Stage::Deleted => self.import().await.map(|_| Stage::Imported),
            Stage::Imported => Ok(Stage::Done),
            Stage::Done | Stage::Failed => return Ok(from),
        };

        let elapsed = started.elapsed();
        STAGE_HISTOGRAM
            .with_label_values(&[&from.to_string()])
            .observe(elapsed.as_secs_f64());

        match next {
            Ok(stage) => {
                info!(
                    from = %from,
                    to = %stage,
                    elapsed = %humantime::format_duration(elapsed),
                    "Stage complete"
                );
                self.stage = stage;
                Ok(stage)
            }
            Err(e) => {
                error!(stage = %from, error = %e, "Stage failed");
                if from == Stage::Deleted {
                    warn!(
                        file = %self.settings.output.display(),
                        "Series were deleted but not re-imported; keep this file and re-run the import"
                    );
                }
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }

    async fn export(&mut self) -> Result<(), PatchError> {
        let s = &self.settings;
        info!(
            selector = %s.match_expr,
            start = %s.export_start,
            end = %s.export_end,
            file = %s.file.display(),
            "Exporting series"
        );
        let bytes = self
            .store
            .export(&s.match_expr, s.export_start, s.export_end, &s.file)
            .await?;
        info!(bytes, "Downloaded metrics");
        self.report.exported_bytes = bytes;
        Ok(())
    }

    fn excise(&mut self) -> Result<(), PatchError> {
        let s = &self.settings;
        info!(
            from = %s.remove_start,
            to = %s.remove_end,
            output = %s.output.display(),
            "Removing bad points"
        );
        let summary = excise_file(&s.file, &s.output, s.removal_window())?;
        info!(
            series = summary.series,
            patched = summary.patched,
            points_removed = summary.points_removed,
            "Filtered points"
        );
        self.report.excise = summary;
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), PatchError> {
        self.store.delete_series(&self.settings.match_expr).await?;
        info!(selector = %self.settings.match_expr, "Dropped all matching series");
        Ok(())
    }

    async fn import(&mut self) -> Result<(), PatchError> {
        self.store.import(&self.settings.output).await?;
        info!(file = %self.settings.output.display(), "Uploaded filtered points");
        Ok(())
    }
}
