use std::sync::{Arc, Mutex, PoisonError};

use riftpatch_core::{UpdateProgress, UpdateStage};

pub type ProgressSink = dyn Fn(&UpdateProgress) + Send + Sync;

/// Forwards progress to an observer, keeping `percent` within `0..=100` and
/// never lower than anything already reported during the run.
pub struct ProgressReporter {
    sink: Arc<ProgressSink>,
    last_percent: Mutex<f64>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<ProgressSink>) -> Self {
        Self {
            sink,
            last_percent: Mutex::new(0.0),
        }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(|_: &UpdateProgress| {}))
    }

    pub fn report(
        &self,
        stage: UpdateStage,
        percent: f64,
        headline: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let percent = {
            let mut last = self
                .last_percent
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let clamped = if percent.is_finite() {
                percent.clamp(0.0, 100.0)
            } else {
                *last
            };
            *last = last.max(clamped);
            *last
        };
        (self.sink)(&UpdateProgress::new(stage, percent, headline, detail));
    }

    pub fn stage(
        &self,
        stage: UpdateStage,
        base: f64,
        span: f64,
        headline: impl Into<String>,
    ) -> StageProgress<'_> {
        StageProgress {
            reporter: self,
            stage,
            base,
            span,
            headline: headline.into(),
        }
    }
}

/// The slice `[base, base + span]` of the overall percent owned by one stage.
pub struct StageProgress<'a> {
    reporter: &'a ProgressReporter,
    stage: UpdateStage,
    base: f64,
    span: f64,
    headline: String,
}

impl StageProgress<'_> {
    pub fn report_fraction(&self, fraction: f64, detail: impl Into<String>) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.reporter.report(
            self.stage,
            self.base + self.span * fraction,
            self.headline.clone(),
            detail,
        );
    }

    pub fn start(&self, detail: impl Into<String>) {
        self.report_fraction(0.0, detail);
    }

    pub fn finish(&self, detail: impl Into<String>) {
        self.report_fraction(1.0, detail);
    }
}
