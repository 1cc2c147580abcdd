use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::bounded;
use log::{debug, info, warn};

use super::config::{DatasetConfig, DecodeErrorPolicy};
use super::error::{DatasetError, DatasetResult};
use super::file_list::FileList;
use super::pair::PairSynthesizer;
use super::patches::{PatchBatch, PatchExtractor};
use super::progress::ProgressSink;
use super::split::{resolve_seed, Phase, SplitAssignment};
use crate::store::format::ContentType;
use crate::store::writer::{discard, DatasetWriter, PhaseStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running(Phase),
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub path: PathBuf,
    pub files: usize,
    pub skipped: usize,
    pub rows: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub seed: u64,
    pub phases: Vec<PhaseSummary>,
}

enum FileOutcome {
    Patches { label: PatchBatch, img: PatchBatch },
    Skipped,
}

#[derive(Default)]
struct PhaseTally {
    files: usize,
    skipped: usize,
    in_flight_peak: usize,
}

type Processed = (usize, DatasetResult<FileOutcome>);

/// Files a pool worker may have decoded ahead of the writer.
const PREFETCH_PER_WORKER: usize = 2;

/// Drives discovery, splitting, pair synthesis, patch extraction and
/// persistence. The file list and split are fixed at construction.
pub struct Pipeline {
    config: DatasetConfig,
    files: FileList,
    split: SplitAssignment,
    synthesizer: PairSynthesizer,
    extractor: PatchExtractor,
    writer: DatasetWriter,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(config: DatasetConfig) -> DatasetResult<Self> {
        let config = config.build()?;
        let files = FileList::discover(&config.source_directory, &config.filename_pattern)?;
        Self::from_parts(config, files)
    }

    /// Uses an explicit file list instead of scanning the source directory.
    pub fn with_files(config: DatasetConfig, files: FileList) -> DatasetResult<Self> {
        Self::from_parts(config.build()?, files)
    }

    fn from_parts(config: DatasetConfig, files: FileList) -> DatasetResult<Self> {
        if files.is_empty() {
            return Err(DatasetError::invalid(format!(
                "no files match '{}' in {}",
                config.filename_pattern,
                config.source_directory.display()
            )));
        }

        let seed = resolve_seed(config.seed);
        let split = SplitAssignment::partition(files.len(), config.validation_fraction, seed)?;
        info!(
            "Found {} files, split seed {}: {} train / {} val",
            files.len(),
            seed,
            split.indices(Phase::Train).len(),
            split.indices(Phase::Val).len()
        );

        Ok(Pipeline {
            synthesizer: PairSynthesizer::new(config.resize_factor, config.interpolation),
            extractor: PatchExtractor::new(config.patch_shape, config.stride, config.element_type),
            writer: DatasetWriter::new(
                config.output_directory.clone(),
                config.output_name.clone(),
                config.patch_shape,
                config.element_type,
            ),
            config,
            files,
            split,
            state: PipelineState::Idle,
        })
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn files(&self) -> &FileList {
        &self.files
    }

    pub fn split(&self) -> &SplitAssignment {
        &self.split
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn store_path(&self, phase: Phase) -> PathBuf {
        self.writer.store_path(phase)
    }

    /// Writes every phase store. The first failure aborts the run; the store
    /// being written at that point is removed.
    pub fn run(&mut self, progress: &dyn ProgressSink) -> DatasetResult<RunSummary> {
        let mut phases = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            self.state = PipelineState::Running(phase);
            let summary = self.run_phase(phase, progress)?;
            progress.phase_finished(&summary);
            phases.push(summary);
        }
        self.state = PipelineState::Closed;

        Ok(RunSummary { seed: self.split.seed(), phases })
    }

    fn run_phase(&self, phase: Phase, progress: &dyn ProgressSink) -> DatasetResult<PhaseSummary> {
        let indices = self.split.indices(phase);
        let mut store = self.writer.open(phase)?;
        info!("Phase {}: {} files -> {}", phase, indices.len(), store.path().display());
        progress.phase_started(phase, indices.len());

        let mut tally = PhaseTally::default();
        let filled = if self.config.workers > 1 {
            self.fill_pooled(phase, indices, &mut store, progress, &mut tally)
        } else {
            self.fill_sequential(phase, indices, &mut store, progress, &mut tally)
        };
        if let Err(e) = filled {
            if let Err(cleanup) = store.abort() {
                warn!("Could not remove unfinished {} store: {}", phase, cleanup);
            }
            return Err(e);
        }

        let path = store.path().to_path_buf();
        let closed = match store.close() {
            Ok(closed) => closed,
            Err(e) => {
                if let Err(cleanup) = discard(&path) {
                    warn!("Could not remove unfinished {} store: {}", phase, cleanup);
                }
                return Err(e);
            }
        };

        info!(
            "Phase {}: {} rows from {} files ({} skipped)",
            phase, closed.rows, tally.files, tally.skipped
        );
        Ok(PhaseSummary {
            phase,
            path: closed.path,
            files: tally.files,
            skipped: tally.skipped,
            rows: closed.rows,
        })
    }

    fn fill_sequential(
        &self,
        phase: Phase,
        indices: &[usize],
        store: &mut PhaseStore,
        progress: &dyn ProgressSink,
        tally: &mut PhaseTally,
    ) -> DatasetResult<()> {
        for &index in indices {
            let outcome = self.process_file(index)?;
            self.commit(phase, index, outcome, store, progress, tally)?;
        }
        Ok(())
    }

    /// Decodes and extracts on a worker pool. The store is only touched from
    /// this thread, in split order, so the output matches a sequential run.
    /// At most `PREFETCH_PER_WORKER * workers` files are in flight at once.
    fn fill_pooled(
        &self,
        phase: Phase,
        indices: &[usize],
        store: &mut PhaseStore,
        progress: &dyn ProgressSink,
        tally: &mut PhaseTally,
    ) -> DatasetResult<()> {
        let workers = self.config.workers;
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        let mut window = ReorderWindow::new(workers * PREFETCH_PER_WORKER);
        // room for every in-flight result, so workers never block on send
        let (tx, rx) = bounded::<Processed>(window.capacity());
        let cancelled = AtomicBool::new(false);
        let total = indices.len();

        let result = pool.in_place_scope(|scope| {
            let dispatch = |seq: usize| {
                let tx = tx.clone();
                let cancelled = &cancelled;
                let index = indices[seq];
                scope.spawn(move |_| {
                    if cancelled.load(Ordering::Relaxed) {
                        return;
                    }
                    // a closed channel means the writer already gave up
                    let _ = tx.send((seq, self.process_file(index)));
                });
            };

            let mut drain = || -> DatasetResult<()> {
                while let Some(seq) = window.reserve(total) {
                    dispatch(seq);
                }
                while !window.is_drained(total) {
                    let Ok((seq, outcome)) = rx.recv() else {
                        break;
                    };
                    window.complete(seq, outcome);
                    while let Some((seq, outcome)) = window.pop_ready() {
                        self.commit(phase, indices[seq], outcome?, store, progress, tally)?;
                    }
                    while let Some(seq) = window.reserve(total) {
                        dispatch(seq);
                    }
                }
                Ok(())
            };

            let drained = drain();
            if drained.is_err() {
                cancelled.store(true, Ordering::Relaxed);
            }
            drained
        });
        tally.in_flight_peak = window.peak();
        debug!(
            "{}: at most {} of {} files in flight (window {})",
            phase,
            tally.in_flight_peak,
            total,
            window.capacity()
        );
        result?;

        if !window.is_drained(total) {
            return Err(io::Error::other("worker pool stopped before every file was processed").into());
        }
        Ok(())
    }

    fn process_file(&self, index: usize) -> DatasetResult<FileOutcome> {
        let path = &self.files[index];
        let pair = match self.synthesizer.synthesize(path) {
            Ok(pair) => pair,
            Err(DatasetError::Decode { source, .. })
                if self.config.decode_errors == DecodeErrorPolicy::Skip =>
            {
                warn!("Skipping unreadable image {}: {}", path.display(), source);
                return Ok(FileOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let label = self.extractor.extract(path, &pair.clean)?;
        let img = self.extractor.extract(path, &pair.degraded)?;
        Ok(FileOutcome::Patches { label, img })
    }

    fn commit(
        &self,
        phase: Phase,
        index: usize,
        outcome: FileOutcome,
        store: &mut PhaseStore,
        progress: &dyn ProgressSink,
        tally: &mut PhaseTally,
    ) -> DatasetResult<()> {
        let path: &Path = &self.files[index];
        match outcome {
            FileOutcome::Skipped => {
                tally.skipped += 1;
                progress.file_skipped(phase, path);
            }
            FileOutcome::Patches { label, img } => {
                store.append(ContentType::Label, &label)?;
                store.append(ContentType::Img, &img)?;
                store.append_filenames(&filename_text(path), label.len())?;
                tally.files += 1;
                debug!("{}: {} patches from {}", phase, label.len(), path.display());
                progress.file_processed(phase, path, label.len());
            }
        }
        Ok(())
    }
}

/// Text stored in the `filename` array for `path`. Bytes that are not valid
/// UTF-8 become U+FFFD and the path is logged.
fn filename_text(path: &Path) -> Cow<'_, str> {
    let text = path.to_string_lossy();
    if let Cow::Owned(_) = text {
        warn!(
            "{} is not valid UTF-8; its filename rows hold a lossy copy",
            path.display()
        );
    }
    text
}

/// Sequence bookkeeping for the worker pool: hands out sequence numbers while
/// fewer than `capacity` are dispatched but uncommitted, and releases
/// finished results strictly in sequence order.
struct ReorderWindow<T> {
    capacity: usize,
    next_dispatch: usize,
    next_commit: usize,
    pending: BTreeMap<usize, T>,
    peak: usize,
}

impl<T> ReorderWindow<T> {
    fn new(capacity: usize) -> Self {
        ReorderWindow {
            capacity: capacity.max(1),
            next_dispatch: 0,
            next_commit: 0,
            pending: BTreeMap::new(),
            peak: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.next_dispatch - self.next_commit
    }

    fn peak(&self) -> usize {
        self.peak
    }

    fn reserve(&mut self, total: usize) -> Option<usize> {
        if self.next_dispatch >= total || self.in_flight() >= self.capacity {
            return None;
        }
        let seq = self.next_dispatch;
        self.next_dispatch += 1;
        self.peak = self.peak.max(self.in_flight());
        Some(seq)
    }

    fn complete(&mut self, seq: usize, item: T) {
        self.pending.insert(seq, item);
    }

    fn pop_ready(&mut self) -> Option<(usize, T)> {
        let item = self.pending.remove(&self.next_commit)?;
        let seq = self.next_commit;
        self.next_commit += 1;
        Some((seq, item))
    }

    fn is_drained(&self, total: usize) -> bool {
        self.next_commit >= total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::config::PatchShape;
    use crate::dataset::progress::NoProgress;
    use crate::store::reader::PhaseStoreReader;
    use image::{Rgb, RgbImage};
    use std::fs;

    fn write_images(dir: &Path, count: usize, size: u32) {
        for i in 0..count {
            let img = RgbImage::from_fn(size, size, |x, y| Rgb([(x + i as u32) as u8, y as u8, 128]));
            img.save(dir.join(format!("img_{i:02}.png"))).unwrap();
        }
    }

    fn config(src: &Path, out: &Path) -> DatasetConfig {
        let mut cfg = DatasetConfig::new(src, "*.png", "unit", out, PatchShape::new_3d(8, 8, 3), 8);
        cfg.seed = Some(5);
        cfg.validation_fraction = 0.25;
        cfg
    }

    #[test]
    fn state_moves_from_idle_to_closed() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_images(src.path(), 4, 16);

        let mut pipeline = Pipeline::new(config(src.path(), out.path())).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        let summary = pipeline.run(&NoProgress).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Closed);

        assert_eq!(summary.seed, 5);
        assert_eq!(summary.phases[0].rows, 3 * 4);
        assert_eq!(summary.phases[1].rows, 4);
    }

    #[test]
    fn empty_source_directory_is_invalid() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let err = Pipeline::new(config(src.path(), out.path())).err().unwrap();
        assert!(matches!(err, DatasetError::InvalidConfiguration(_)));
    }

    #[test]
    fn decode_failure_aborts_and_removes_store() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_images(src.path(), 3, 16);
        fs::write(src.path().join("img_99.png"), b"garbage").unwrap();

        let mut cfg = config(src.path(), out.path());
        cfg.validation_fraction = 0.1;
        let mut pipeline = Pipeline::new(cfg).unwrap();
        let err = pipeline.run(&NoProgress).unwrap_err();
        assert!(matches!(err, DatasetError::Decode { .. }));
        assert_eq!(pipeline.state(), PipelineState::Running(Phase::Train));
        assert!(!pipeline.store_path(Phase::Train).exists());
    }

    #[test]
    fn skip_policy_continues_past_bad_files() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_images(src.path(), 3, 16);
        fs::write(src.path().join("img_99.png"), b"garbage").unwrap();

        let mut cfg = config(src.path(), out.path());
        cfg.validation_fraction = 0.1;
        cfg.decode_errors = DecodeErrorPolicy::Skip;
        let mut pipeline = Pipeline::new(cfg).unwrap();
        let summary = pipeline.run(&NoProgress).unwrap();
        let train = &summary.phases[0];
        assert_eq!(train.files, 3);
        assert_eq!(train.skipped, 1);
        assert_eq!(train.rows, 12);

        let mut reader = PhaseStoreReader::open(&train.path).unwrap();
        assert!(reader.filenames().unwrap().iter().all(|f| !f.ends_with("img_99.png")));
    }

    #[test]
    fn grayscale_input_with_color_patches_fails() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        image::GrayImage::new(16, 16).save(src.path().join("gray.png")).unwrap();
        image::GrayImage::new(16, 16).save(src.path().join("gray2.png")).unwrap();

        let mut cfg = config(src.path(), out.path());
        cfg.validation_fraction = 0.5;
        let mut pipeline = Pipeline::new(cfg).unwrap();
        let err = pipeline.run(&NoProgress).unwrap_err();
        assert!(matches!(err, DatasetError::ShapeMismatch { expected: 3, found: 1, .. }));
    }

    #[test]
    fn reorder_window_releases_in_sequence_and_caps_dispatch() {
        let mut window = ReorderWindow::new(3);
        let total = 10;
        assert_eq!(window.reserve(total), Some(0));
        assert_eq!(window.reserve(total), Some(1));
        assert_eq!(window.reserve(total), Some(2));
        assert_eq!(window.reserve(total), None);

        window.complete(2, "c");
        window.complete(1, "b");
        assert_eq!(window.pop_ready(), None);
        assert_eq!(window.reserve(total), None);

        window.complete(0, "a");
        assert_eq!(window.pop_ready(), Some((0, "a")));
        assert_eq!(window.pop_ready(), Some((1, "b")));
        assert_eq!(window.pop_ready(), Some((2, "c")));
        assert_eq!(window.pop_ready(), None);
        assert_eq!(window.in_flight(), 0);
        assert_eq!(window.peak(), 3);
        assert!(!window.is_drained(total));
    }

    #[test]
    fn reorder_window_holds_at_most_capacity_under_reversed_completion() {
        let total = 50;
        let mut window = ReorderWindow::new(4);
        let mut committed = Vec::new();
        let mut max_pending = 0;
        while !window.is_drained(total) {
            let mut batch = Vec::new();
            while let Some(seq) = window.reserve(total) {
                batch.push(seq);
            }
            // finish the newest first, the worst order for the writer
            for seq in batch.into_iter().rev() {
                window.complete(seq, seq);
                max_pending = max_pending.max(window.pending.len());
            }
            while let Some((_, item)) = window.pop_ready() {
                committed.push(item);
            }
        }
        assert_eq!(committed, (0..total).collect::<Vec<_>>());
        assert!(max_pending <= 4, "{max_pending} results buffered");
        assert!(window.peak() <= 4);
    }

    #[test]
    fn pooled_fill_keeps_in_flight_files_within_window() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_images(src.path(), 40, 16);

        let mut cfg = config(src.path(), out.path());
        cfg.validation_fraction = 0.1;
        cfg.workers = 3;
        let pipeline = Pipeline::new(cfg).unwrap();
        let indices = pipeline.split().indices(Phase::Train);
        let mut store = pipeline.writer.open(Phase::Train).unwrap();
        let mut tally = PhaseTally::default();
        pipeline
            .fill_pooled(Phase::Train, indices, &mut store, &NoProgress, &mut tally)
            .unwrap();

        assert_eq!(tally.files, indices.len());
        assert!(tally.in_flight_peak >= 1);
        assert!(tally.in_flight_peak <= 3 * PREFETCH_PER_WORKER, "{}", tally.in_flight_peak);
        assert_eq!(store.close().unwrap().rows, indices.len() as u64 * 4);
    }

    #[test]
    fn pooled_decode_failure_aborts_and_removes_store() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_images(src.path(), 12, 16);
        fs::write(src.path().join("img_99.png"), b"garbage").unwrap();

        let mut cfg = config(src.path(), out.path());
        cfg.validation_fraction = 0.05;
        cfg.workers = 4;
        let mut pipeline = Pipeline::new(cfg).unwrap();
        let err = pipeline.run(&NoProgress).unwrap_err();
        assert!(matches!(err, DatasetError::Decode { .. }));
        assert_eq!(pipeline.state(), PipelineState::Running(Phase::Train));
        assert!(!pipeline.store_path(Phase::Train).exists());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_are_stored_lossily() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/data/img_\xff.png"));
        let text = filename_text(path);
        assert!(matches!(text, Cow::Owned(_)));
        assert_eq!(text, "/data/img_\u{FFFD}.png");

        assert!(matches!(filename_text(Path::new("/data/img_01.png")), Cow::Borrowed(_)));
    }
}
