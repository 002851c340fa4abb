use std::sync::Arc;
use backend::{build_rocket, config::AppConfig, queries::PgPollStore, routes::AppState};
use shuttle_runtime::CustomError;
use sqlx::PgPool;
use tracing::info;

#[shuttle_runtime::main]
async fn rocket(
    #[shuttle_shared_db::Postgres] pool: PgPool,
    #[shuttle_runtime::Secrets] secret_store: shuttle_runtime::SecretStore,
) -> shuttle_rocket::ShuttleRocket {
    info!("🚀 Starting Quick Polls server");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(CustomError::new)?;

    info!("📋 Migrations complete");

    let config = AppConfig::load(|key| secret_store.get(key));
    let store = Arc::new(PgPollStore::new(pool));
    let state = AppState::new(store, &config);

    Ok(build_rocket(state, &config).into())
}
