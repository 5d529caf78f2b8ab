//! Weighted additive risk scoring for checkout attempts. Scoring is a pure
//! function of the transaction context; the audit record is persisted
//! best-effort and never blocks the decision.

use crate::{
    config::RiskConfig,
    entities::{risk_assessment, risk_assessment_store},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{instrument, warn};
use uuid::Uuid;

const UNUSUAL_ITEM_COUNT_THRESHOLD: i32 = 20;
const EXTREME_ITEM_COUNT_THRESHOLD: i32 = 50;
const BULK_SINGLE_ITEM_THRESHOLD: i32 = 100;
const EXTREME_BULK_SINGLE_ITEM_THRESHOLD: i32 = 300;
const MULTI_STORE_THRESHOLD: usize = 3;

const SUSPICIOUS_AGENT_MARKERS: &[&str] = &[
    "headless", "phantomjs", "selenium", "puppeteer", "bot", "crawler", "curl", "wget",
    "python-requests",
];

/// Everything the scorer knows about one checkout attempt. Optional fields
/// that are absent contribute zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskContext {
    pub amount: Decimal,
    pub currency: String,
    pub item_count: i32,
    pub max_item_quantity: i32,
    pub store_ids: Vec<Uuid>,
    pub authenticated: bool,
    pub user_agent: Option<String>,
    pub new_payment_method: bool,
    pub ip_address: Option<String>,
    pub ip_country: Option<String>,
    pub billing_country: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RiskDecision {
    Allow,
    Warn,
    Deny,
}

/// One triggered factor with its point contribution.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct FactorHit {
    pub code: String,
    pub points: i32,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct RiskOutcome {
    /// Clipped to 0..=100
    pub score: i32,
    pub decision: RiskDecision,
    /// 0..=1, how far inside its band the score landed
    pub confidence: Decimal,
    pub factors: Vec<FactorHit>,
}

/// Outcome plus the id of the audit row, when the insert succeeded.
#[derive(Debug, Clone)]
pub struct RecordedAssessment {
    pub outcome: RiskOutcome,
    pub assessment_id: Option<Uuid>,
}

struct FactorRule {
    code: &'static str,
    /// Hard factors force a deny on their own, even when the summed score
    /// stays under the deny threshold.
    hard: bool,
    description: &'static str,
    /// Point contribution when triggered, `None` otherwise. Contributions
    /// are capped per factor; tiered factors return their tier's points.
    eval: fn(&RiskContext) -> Option<i32>,
}

static FACTOR_RULES: &[FactorRule] = &[
    FactorRule {
        code: "UNUSUAL_ITEM_COUNT",
        hard: false,
        description: "Cart holds an unusually high number of items",
        eval: |ctx| (ctx.item_count > UNUSUAL_ITEM_COUNT_THRESHOLD).then_some(15),
    },
    FactorRule {
        code: "EXTREME_ITEM_COUNT",
        hard: false,
        description: "Cart item count is far outside normal range",
        eval: |ctx| (ctx.item_count > EXTREME_ITEM_COUNT_THRESHOLD).then_some(25),
    },
    FactorRule {
        code: "BULK_SINGLE_ITEM",
        hard: true,
        description: "Single line item ordered in reseller-scale quantity",
        eval: |ctx| (ctx.max_item_quantity > BULK_SINGLE_ITEM_THRESHOLD).then_some(30),
    },
    FactorRule {
        code: "EXTREME_BULK_SINGLE_ITEM",
        hard: true,
        description: "Single line item quantity indicates automated buyout",
        eval: |ctx| (ctx.max_item_quantity > EXTREME_BULK_SINGLE_ITEM_THRESHOLD).then_some(40),
    },
    FactorRule {
        code: "HIGH_AMOUNT",
        hard: false,
        description: "Transaction amount above the high-value threshold",
        eval: |ctx| {
            if ctx.amount > Decimal::from(2000) {
                Some(60)
            } else if ctx.amount > Decimal::from(1000) {
                Some(45)
            } else if ctx.amount > Decimal::from(500) {
                Some(20)
            } else {
                None
            }
        },
    },
    FactorRule {
        code: "MULTIPLE_STORES",
        hard: false,
        description: "Cart spans several independent stores",
        eval: |ctx| (ctx.store_ids.len() >= MULTI_STORE_THRESHOLD).then_some(10),
    },
    FactorRule {
        code: "ANONYMOUS_USER",
        hard: false,
        description: "Checkout attempted without an authenticated account",
        eval: |ctx| (!ctx.authenticated).then_some(15),
    },
    FactorRule {
        code: "SUSPICIOUS_USER_AGENT",
        hard: false,
        description: "Client user agent matches automation tooling",
        eval: |ctx| match &ctx.user_agent {
            Some(ua) => {
                let ua = ua.to_ascii_lowercase();
                SUSPICIOUS_AGENT_MARKERS
                    .iter()
                    .any(|m| ua.contains(m))
                    .then_some(20)
            }
            None => None,
        },
    },
    FactorRule {
        code: "NEW_PAYMENT_METHOD",
        hard: false,
        description: "Payment method first seen on this attempt",
        eval: |ctx| ctx.new_payment_method.then_some(10),
    },
    FactorRule {
        code: "GEO_MISMATCH",
        hard: false,
        description: "IP geolocation does not match the billing country",
        eval: |ctx| match (&ctx.ip_country, &ctx.billing_country) {
            (Some(ip), Some(billing)) => (!ip.eq_ignore_ascii_case(billing)).then_some(15),
            _ => None,
        },
    },
];

/// Risk scoring engine. Holds the configured thresholds; scoring itself has
/// no side effects.
#[derive(Clone)]
pub struct RiskService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    thresholds: RiskConfig,
}

impl RiskService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender, thresholds: RiskConfig) -> Self {
        Self {
            db,
            event_sender,
            thresholds,
        }
    }

    /// Scores a context. Pure and infallible: every factor that cannot be
    /// evaluated contributes zero.
    pub fn assess(&self, ctx: &RiskContext) -> RiskOutcome {
        let mut factors = Vec::new();
        let mut raw_score: i32 = 0;
        let mut hard_hit = false;

        for rule in FACTOR_RULES {
            if let Some(points) = (rule.eval)(ctx) {
                raw_score += points;
                hard_hit |= rule.hard;
                factors.push(FactorHit {
                    code: rule.code.to_string(),
                    points,
                    description: rule.description.to_string(),
                });
            }
        }

        let score = raw_score.clamp(0, 100);
        let warn = i32::from(self.thresholds.warn_threshold);
        let deny = i32::from(self.thresholds.deny_threshold);

        RiskOutcome {
            score,
            confidence: band_confidence(score, warn, deny),
            decision: self.decide(score, hard_hit),
            factors,
        }
    }

    /// Maps a clipped score to a decision band. A triggered hard factor
    /// forces a deny even when the summed score stays under the deny line.
    fn decide(&self, score: i32, hard_hit: bool) -> RiskDecision {
        if hard_hit || score >= i32::from(self.thresholds.deny_threshold) {
            RiskDecision::Deny
        } else if score >= i32::from(self.thresholds.warn_threshold) {
            RiskDecision::Warn
        } else {
            RiskDecision::Allow
        }
    }

    /// Scores and persists the audit record plus one link row per distinct
    /// store. Persistence failure is logged and the decision still returned;
    /// the audit is best-effort, the decision is not.
    #[instrument(skip(self, ctx), fields(amount = %ctx.amount))]
    pub async fn assess_and_record(&self, ctx: &RiskContext) -> RecordedAssessment {
        let outcome = self.assess(ctx);

        let assessment_id = match self.persist(ctx, &outcome).await {
            Ok(id) => {
                self.event_sender.send(Event::RiskAssessed {
                    assessment_id: id,
                    decision: outcome.decision.to_string(),
                    score: outcome.score,
                });
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "failed to persist risk assessment, decision still returned");
                None
            }
        };

        RecordedAssessment {
            outcome,
            assessment_id,
        }
    }

    async fn persist(&self, ctx: &RiskContext, outcome: &RiskOutcome) -> Result<Uuid, ServiceError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        risk_assessment::ActiveModel {
            id: Set(id),
            amount: Set(ctx.amount),
            currency: Set(ctx.currency.clone()),
            item_count: Set(ctx.item_count),
            max_item_quantity: Set(ctx.max_item_quantity),
            store_count: Set(ctx.store_ids.len() as i32),
            authenticated: Set(ctx.authenticated),
            user_agent: Set(ctx.user_agent.clone()),
            new_payment_method: Set(ctx.new_payment_method),
            ip_address: Set(ctx.ip_address.clone()),
            score: Set(outcome.score),
            decision: Set(outcome.decision.to_string()),
            confidence: Set(outcome.confidence),
            factors: Set(serde_json::to_value(&outcome.factors)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        for store_id in dedup_stores(&ctx.store_ids) {
            risk_assessment_store::ActiveModel {
                id: Set(Uuid::new_v4()),
                assessment_id: Set(id),
                store_id: Set(store_id),
            }
            .insert(&*self.db)
            .await?;
        }

        Ok(id)
    }
}

fn dedup_stores(store_ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = Vec::with_capacity(store_ids.len());
    for id in store_ids {
        if !seen.contains(id) {
            seen.push(*id);
        }
    }
    seen
}

/// Confidence grows with distance from the nearest band boundary, from 0.5
/// at the edge of a band to 1.0 at its center.
fn band_confidence(score: i32, warn: i32, deny: i32) -> Decimal {
    let (lo, hi) = if score < warn {
        (0, warn)
    } else if score < deny {
        (warn, deny)
    } else {
        (deny, 101)
    };
    let width = (hi - lo).max(1);
    let dist = (score - lo).min(hi - 1 - score).max(0);
    let half = Decimal::new(5, 1); // 0.5
    let ratio = Decimal::from(dist * 2) / Decimal::from(width);
    (half + half * ratio.min(Decimal::ONE)).round_dp(2)
}
