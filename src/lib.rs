//! Builds paired training patches for image restoration models.
//!
//! Every matched source image is decoded (the `label`), degraded by a
//! downsample/upsample round trip (the `img`), cut into sliding-window patches
//! and appended to a chunked, compressed phase store per `train`/`val` split.

pub mod dataset;
pub mod store;

pub use dataset::config::{DatasetConfig, DecodeErrorPolicy, Interpolation, PatchShape};
pub use dataset::error::{DatasetError, DatasetResult};
pub use dataset::file_list::FileList;
pub use dataset::pair::{ImagePair, PairSynthesizer};
pub use dataset::patches::{patch_count, PatchBatch, PatchExtractor};
pub use dataset::pipeline::{PhaseSummary, Pipeline, PipelineState, RunSummary};
pub use dataset::progress::{NoProgress, ProgressBarSink, ProgressSink};
pub use dataset::split::{Phase, SplitAssignment};
pub use store::format::{ContentType, ElementType};
pub use store::reader::PhaseStoreReader;
pub use store::writer::{DatasetWriter, PhaseStore, StoreSummary};
