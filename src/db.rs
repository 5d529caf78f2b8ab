use crate::config::AppConfig;
use crate::entities;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema,
};
use std::time::Duration;
use tracing::info;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Establishes a connection pool from the application configuration.
pub async fn establish_connection(config: &AppConfig) -> Result<DbPool, DbErr> {
    let mut opts = ConnectOptions::new(config.database_url.clone());
    opts.max_connections(10)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    let db = Database::connect(opts).await?;
    info!("database connection established");
    Ok(db)
}

/// Creates any missing tables and indexes from the entity definitions.
/// Intended for sqlite and test environments; production schemas are managed
/// out of band.
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut tables = vec![
        schema.create_table_from_entity(entities::RiskAssessment),
        schema.create_table_from_entity(entities::RiskAssessmentStore),
        schema.create_table_from_entity(entities::VerificationChallenge),
        schema.create_table_from_entity(entities::PaymentTransaction),
        schema.create_table_from_entity(entities::Order),
    ];
    for stmt in tables.iter_mut() {
        stmt.if_not_exists();
        db.execute(backend.build(stmt)).await?;
    }

    let mut indexes = Vec::new();
    indexes.extend(schema.create_index_from_entity(entities::RiskAssessmentStore));
    indexes.extend(schema.create_index_from_entity(entities::VerificationChallenge));
    indexes.extend(schema.create_index_from_entity(entities::PaymentTransaction));
    for stmt in indexes.iter_mut() {
        stmt.if_not_exists();
        db.execute(backend.build(stmt)).await?;
    }

    info!("schema bootstrap complete");
    Ok(())
}

/// Liveness probe used by the health endpoint.
pub async fn ping(db: &DatabaseConnection) -> Result<(), DbErr> {
    db.ping().await
}
