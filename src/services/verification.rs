//! Step-up verification challenges: issue, dedup-merge, verify, resend, and
//! expire one-time codes gating `warn`-decision checkouts.

use crate::{
    config::VerificationConfig,
    entities::verification_challenge::{self, ChallengeStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{mask_email, CodeEmailContext, NotificationDispatcher},
    services::risk::FactorHit,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set,
};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_BYTES: usize = 32;

/// Input for issuing a challenge after a `warn` decision.
#[derive(Debug, Clone)]
pub struct CreateChallengeRequest {
    pub user_id: Uuid,
    pub email: String,
    pub user_name: Option<String>,
    pub amount: Decimal,
    /// Snapshot of the original checkout context, returned verbatim on a
    /// successful verify so the orchestrator resumes with the submitted
    /// amount and items.
    pub payment_context: serde_json::Value,
    pub risk_score: i32,
    pub risk_factors: Vec<FactorHit>,
}

#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub masked_email: String,
    /// True when an in-window challenge for the same user and amount was
    /// reused instead of minting a new token and sending another email.
    pub merged: bool,
}

/// Manages the challenge lifecycle. Status only ever advances
/// pending -> verified or pending -> expired.
#[derive(Clone)]
pub struct VerificationService {
    db: Arc<DatabaseConnection>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    event_sender: EventSender,
    config: VerificationConfig,
}

impl VerificationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        event_sender: EventSender,
        config: VerificationConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            event_sender,
            config,
        }
    }

    /// Issues a challenge, or reuses the live one for the same user and
    /// amount inside the dedup window. One logical multi-store checkout can
    /// trigger several risk evaluations; the content-derived key collapses
    /// them onto a single token and a single email.
    #[instrument(skip(self, req), fields(user_id = %req.user_id))]
    pub async fn create(&self, req: CreateChallengeRequest) -> Result<IssuedChallenge, ServiceError> {
        let now = Utc::now();
        let key = dedup_key(req.user_id, req.amount);
        let window_start = now - Duration::seconds(self.config.dedup_window_secs as i64);

        let existing = verification_challenge::Entity::find()
            .filter(verification_challenge::Column::DedupKey.eq(key.clone()))
            .filter(verification_challenge::Column::Status.eq(ChallengeStatus::Pending.to_string()))
            .filter(verification_challenge::Column::CreatedAt.gte(window_start))
            .filter(verification_challenge::Column::ExpiresAt.gt(now))
            .order_by_desc(verification_challenge::Column::CreatedAt)
            .one(&*self.db)
            .await?;

        if let Some(challenge) = existing {
            return self.merge_into_existing(challenge, req).await;
        }

        let token = generate_token();
        let code = generate_code();
        let expires_at = now + Duration::seconds(self.config.challenge_ttl_secs as i64);

        let model = verification_challenge::ActiveModel {
            token: Set(token.clone()),
            user_id: Set(req.user_id),
            user_email: Set(req.email.clone()),
            otp_hash: Set(hash_code(&token, &code)),
            payment_context: Set(req.payment_context.clone()),
            risk_score: Set(req.risk_score),
            risk_factors: Set(serde_json::to_value(&req.risk_factors)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?),
            status: Set(ChallengeStatus::Pending.to_string()),
            dedup_key: Set(key),
            expires_at: Set(expires_at),
            email_sent: Set(false),
            created_at: Set(now),
            verified_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        let email_ctx = CodeEmailContext {
            user_name: req.user_name.clone(),
            amount: Some(req.amount),
        };
        if let Err(e) = self
            .dispatcher
            .send_verification_code(&req.email, &code, &email_ctx)
            .await
        {
            // A token the user can never learn the code for must not linger;
            // the checkout is blocked and the shopper asked to retry.
            warn!(error = %e, "code email failed, discarding challenge");
            model.delete(&*self.db).await?;
            return Err(e);
        }

        let mut sent: verification_challenge::ActiveModel = model.into();
        sent.email_sent = Set(true);
        sent.update(&*self.db).await?;

        self.event_sender.send(Event::ChallengeIssued {
            user_id: req.user_id,
        });

        Ok(IssuedChallenge {
            token,
            expires_at,
            masked_email: mask_email(&req.email),
            merged: false,
        })
    }

    async fn merge_into_existing(
        &self,
        challenge: verification_challenge::Model,
        req: CreateChallengeRequest,
    ) -> Result<IssuedChallenge, ServiceError> {
        info!("reusing in-window challenge, no new email sent");

        let merged_context = merge_context(challenge.payment_context.clone(), req.payment_context);
        let token = challenge.token.clone();
        let expires_at = challenge.expires_at;

        let mut update: verification_challenge::ActiveModel = challenge.into();
        update.payment_context = Set(merged_context);
        update.risk_score = Set(req.risk_score);
        update.risk_factors = Set(serde_json::to_value(&req.risk_factors)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?);
        update.update(&*self.db).await?;

        self.event_sender.send(Event::ChallengeMerged {
            user_id: req.user_id,
        });

        Ok(IssuedChallenge {
            token,
            expires_at,
            masked_email: mask_email(&req.email),
            merged: true,
        })
    }

    /// Checks a code against a pending challenge without consuming it.
    /// Expiry is evaluated lazily here; a wrong code leaves the challenge
    /// untouched so the shopper may retry until expiry. On success returns
    /// the embedded payment context.
    ///
    /// The challenge stays pending until `consume` so a downstream failure
    /// (such as the payment provider erroring on intent creation) leaves
    /// the token redeemable instead of forcing a full checkout restart.
    #[instrument(skip(self, code))]
    pub async fn check(&self, token: &str, code: &str) -> Result<serde_json::Value, ServiceError> {
        let challenge = self.find_pending(token).await?;

        if Utc::now() > challenge.expires_at {
            self.mark_expired(challenge).await?;
            return Err(ServiceError::Expired(token.to_string()));
        }

        if !code_matches(token, code, &challenge.otp_hash) {
            return Err(ServiceError::InvalidCode);
        }

        Ok(challenge.payment_context)
    }

    /// Flips a pending challenge to verified. Called after the resumed
    /// checkout has succeeded; further lookups answer `NotFound`.
    #[instrument(skip(self))]
    pub async fn consume(&self, token: &str) -> Result<(), ServiceError> {
        let challenge = self.find_pending(token).await?;
        let user_id = challenge.user_id;

        let mut update: verification_challenge::ActiveModel = challenge.into();
        update.status = Set(ChallengeStatus::Verified.to_string());
        update.verified_at = Set(Some(Utc::now()));
        update.update(&*self.db).await?;

        self.event_sender.send(Event::ChallengeVerified { user_id });
        Ok(())
    }

    /// Regenerates the code and expiry for a live challenge and re-sends the
    /// email. Consumed or expired tokens cannot be resent.
    #[instrument(skip(self))]
    pub async fn resend(&self, token: &str) -> Result<IssuedChallenge, ServiceError> {
        let challenge = self.find_pending(token).await?;

        if Utc::now() > challenge.expires_at {
            self.mark_expired(challenge).await?;
            return Err(ServiceError::Expired(token.to_string()));
        }

        let code = generate_code();
        let expires_at = Utc::now() + Duration::seconds(self.config.challenge_ttl_secs as i64);
        let email = challenge.user_email.clone();
        let amount_hint = challenge
            .payment_context
            .get("amount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok());
        let previous_hash = challenge.otp_hash.clone();
        let previous_expiry = challenge.expires_at;

        let mut update: verification_challenge::ActiveModel = challenge.into();
        update.otp_hash = Set(hash_code(token, &code));
        update.expires_at = Set(expires_at);
        let updated = update.update(&*self.db).await?;

        let email_ctx = CodeEmailContext {
            user_name: None,
            amount: amount_hint,
        };
        if let Err(e) = self
            .dispatcher
            .send_verification_code(&email, &code, &email_ctx)
            .await
        {
            // Restore the previous code so the token is not stranded with a
            // hash nobody was ever emailed.
            warn!(error = %e, "resend email failed, restoring previous code");
            let mut rollback: verification_challenge::ActiveModel = updated.into();
            rollback.otp_hash = Set(previous_hash);
            rollback.expires_at = Set(previous_expiry);
            rollback.update(&*self.db).await?;
            return Err(e);
        }

        Ok(IssuedChallenge {
            token: token.to_string(),
            expires_at,
            masked_email: mask_email(&email),
            merged: false,
        })
    }

    /// Flips stale pending challenges to expired. Expiry is already enforced
    /// lazily on verify; this sweep only keeps the table tidy and may run
    /// from a periodic task.
    pub async fn sweep_expired(&self) -> Result<u64, ServiceError> {
        use sea_orm::sea_query::Expr;

        let result = verification_challenge::Entity::update_many()
            .col_expr(
                verification_challenge::Column::Status,
                Expr::value(ChallengeStatus::Expired.to_string()),
            )
            .filter(
                verification_challenge::Column::Status
                    .eq(ChallengeStatus::Pending.to_string()),
            )
            .filter(verification_challenge::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 0 {
            self.event_sender.send(Event::ChallengesExpired {
                count: result.rows_affected,
            });
        }
        Ok(result.rows_affected)
    }

    /// Live-challenge lookup. Unknown and already-consumed (verified) tokens
    /// are both `NotFound`; an expired token keeps answering `Expired`.
    async fn find_pending(
        &self,
        token: &str,
    ) -> Result<verification_challenge::Model, ServiceError> {
        let challenge = verification_challenge::Entity::find_by_id(token.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("verification challenge not found".into()))?;

        match challenge.status.parse::<ChallengeStatus>() {
            Ok(ChallengeStatus::Pending) => Ok(challenge),
            Ok(ChallengeStatus::Expired) => Err(ServiceError::Expired(token.to_string())),
            Ok(ChallengeStatus::Verified) => Err(ServiceError::NotFound(
                "verification challenge already consumed".into(),
            )),
            Err(_) => Err(ServiceError::InternalError(format!(
                "unparseable challenge status {:?}",
                challenge.status
            ))),
        }
    }

    async fn mark_expired(
        &self,
        challenge: verification_challenge::Model,
    ) -> Result<(), ServiceError> {
        let mut update: verification_challenge::ActiveModel = challenge.into();
        update.status = Set(ChallengeStatus::Expired.to_string());
        update.update(&*self.db).await?;
        Ok(())
    }
}

/// Content-derived idempotency key: user id plus the amount rounded to
/// cents. Replaces a recency scan over recent rows with an indexed lookup.
pub fn dedup_key(user_id: Uuid, amount: Decimal) -> String {
    let cents = (amount * Decimal::from(100)).round().to_i64().unwrap_or(0);
    format!("{}:{}", user_id, cents)
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// One-way hash of the code, keyed by the token so equal codes on different
/// challenges never produce equal digests.
fn hash_code(token: &str, code: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(code.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn code_matches(token: &str, code: &str, stored_hash: &str) -> bool {
    let Ok(expected) = hex::decode(stored_hash) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(code.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Merges the new snapshot into the stored one, new values winning on
/// conflict. Non-object snapshots are replaced wholesale.
fn merge_context(stored: serde_json::Value, new: serde_json::Value) -> serde_json::Value {
    match (stored, new) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(update)) => {
            for (key, value) in update {
                base.insert(key, value);
            }
            serde_json::Value::Object(base)
        }
        (_, new) => new,
    }
}
