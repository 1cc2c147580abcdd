use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};

use super::pipeline::PhaseSummary;
use super::split::Phase;

/// Receives notifications from the pipeline. Must not block.
pub trait ProgressSink {
    fn phase_started(&self, _phase: Phase, _files: usize) {}
    fn file_processed(&self, _phase: Phase, _path: &Path, _patches: usize) {}
    fn file_skipped(&self, _phase: Phase, _path: &Path) {}
    fn phase_finished(&self, _summary: &PhaseSummary) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Terminal progress bar, reset at the start of every phase.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {msg:>5} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::new(0);
        bar.set_style(style);
        ProgressBarSink { bar }
    }

    pub fn hidden() -> Self {
        ProgressBarSink { bar: ProgressBar::hidden() }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn phase_started(&self, phase: Phase, files: usize) {
        self.bar.reset();
        self.bar.set_length(files as u64);
        self.bar.set_message(phase.name());
    }

    fn file_processed(&self, _phase: Phase, _path: &Path, _patches: usize) {
        self.bar.inc(1);
    }

    fn file_skipped(&self, _phase: Phase, _path: &Path) {
        self.bar.inc(1);
    }

    fn phase_finished(&self, summary: &PhaseSummary) {
        self.bar.finish_with_message(format!("{} done, {} rows", summary.phase, summary.rows));
    }
}
