use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A depositing institution that owns bags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
