use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// A step-up verification challenge. The opaque token is the natural key.
/// Status only advances pending -> verified or pending -> expired; both are
/// terminal.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "verification_challenges")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub token: String,

    pub user_id: Uuid,
    pub user_email: String,
    /// HMAC-SHA256 of the 6-digit code keyed by the token; the plaintext
    /// code is never stored.
    pub otp_hash: String,

    /// Snapshot of the checkout context so the orchestrator can resume with
    /// the originally submitted amount and items after verification.
    pub payment_context: Json,
    pub risk_score: i32,
    pub risk_factors: Json,

    /// "pending" | "verified" | "expired"
    pub status: String,

    /// Content-derived idempotency key: user id plus amount rounded to
    /// cents. Repeated evaluations of one logical checkout land on the same
    /// key inside the dedup window.
    #[sea_orm(indexed)]
    pub dedup_key: String,

    pub expires_at: DateTime<Utc>,
    pub email_sent: bool,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Verified,
    Expired,
}

impl ChallengeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChallengeStatus::Pending)
    }
}
