use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable audit record of one risk evaluation. Never updated after insert;
/// store links live in `risk_assessment_stores`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "risk_assessments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub amount: Decimal,
    pub currency: String,
    pub item_count: i32,
    pub max_item_quantity: i32,
    pub store_count: i32,
    pub authenticated: bool,
    pub user_agent: Option<String>,
    pub new_payment_method: bool,
    pub ip_address: Option<String>,

    /// Clipped to 0..=100
    pub score: i32,
    /// "allow" | "warn" | "deny"
    pub decision: String,
    pub confidence: Decimal,
    /// Ordered list of `{code, points, description}` objects
    pub factors: Json,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::risk_assessment_store::Entity")]
    StoreLinks,
}

impl Related<super::risk_assessment_store::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StoreLinks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
