//! The media-plane fabric: metrics, sample fanout, and the shared encoder
//! pipeline. Data flows source → colour conversion → encoder → broadcaster →
//! per-session sink → peer.

pub mod broadcaster;
pub mod metrics;
pub mod pipeline;
pub mod writer;

pub use broadcaster::{Detach, SampleBroadcaster, SampleSink};
pub use pipeline::{Pipeline, PipelineConfig};
pub use writer::SampleWriter;
