//! Local staging and cold-storage boundaries.

pub mod cold;
pub mod staging;

pub use cold::{ColdStore, ColdTags, FsColdStore, ObjectColdStore, RestoreStatus};
pub use staging::StagingStore;
