use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable digest fact about a bag, scoped to the node that computed it.
///
/// Create-only: registries never update a digest, and creating one that
/// already exists is treated as success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDigest {
    pub bag: Uuid,
    pub algorithm: String,
    /// Namespace of the node that computed this digest.
    pub node: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one scheduled re-verification of stored content.
///
/// Append-only, same create-only semantics as [`MessageDigest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixityCheck {
    pub fixity_check_id: Uuid,
    pub bag: Uuid,
    pub node: String,
    pub success: bool,
    pub fixity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
