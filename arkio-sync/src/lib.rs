//! Cross-node registry synchronization.
//!
//! Every node periodically pulls records from each peer's registry into its
//! own. Each record has a single authority: bags come only from their admin
//! node, digests and fixity checks only from the node that produced them,
//! transfers only from the node that issued them. Conflicts resolve
//! last-writer-wins on `updated_at`, strictly newer only.

pub mod engine;
pub mod report;

pub use engine::SyncEngine;
pub use report::{NodeSyncResult, RecordType};
