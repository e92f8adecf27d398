//! Work pipelines.
//!
//! Each pipeline drains one queue of work items: replication pulls bags in
//! from peers, ingest packages local objects into new bags, and restore
//! recalls bags from cold storage for fixity checking. The sender-side
//! confirmation sweep lives here too.

pub mod confirm;
pub mod ingest;
pub mod pipeline;
pub mod replication;
pub mod restore;

pub use confirm::{ConfirmStats, FixityConfirmer};
pub use ingest::IngestPipeline;
pub use pipeline::{Flow, PipelineContext, PipelineSettings, Task};
pub use replication::ReplicationPipeline;
pub use restore::RestorePipeline;
