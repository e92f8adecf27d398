//! Registry record types shared by every node in the network.
//!
//! All records serialize to the registry's JSON wire format; timestamps are
//! UTC and identifiers are UUIDs.

pub mod bag;
pub mod digest;
pub mod member;
pub mod node;
pub mod paging;
pub mod transfer;
pub mod work_item;

pub use bag::{Bag, Ingest};
pub use digest::{FixityCheck, MessageDigest};
pub use member::Member;
pub use node::NodeRecord;
pub use paging::PagedResponse;
pub use transfer::{ReplicationTransfer, RestoreTransfer};
pub use work_item::{WorkItem, WorkItemAction};
