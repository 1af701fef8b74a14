use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod db;
mod dispatcher;
mod error;
mod settings;
mod sweeper;
mod tasks;

use db::Database;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub access_token: String,
    pub backup_path: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting taskmon-server...");

    let db_path = std::env::var("DB_FILE_PATH").unwrap_or_else(|_| "taskmon.db".to_string());
    let backup_path =
        std::env::var("BACKUP_FILE_PATH").unwrap_or_else(|_| "taskmon-backup.db".to_string());
    let access_token = std::env::var("ACCESS_TOKEN").expect("ACCESS_TOKEN must be set");

    // Schema creation and default-settings seeding happen inside, both idempotent.
    let db_instance = Database::new(&db_path).expect("Failed to initialize database");
    let db = Arc::new(Mutex::new(db_instance));

    let state = AppState {
        db: db.clone(),
        access_token,
        backup_path,
    };

    // Settings-driven maintenance loop
    let db_for_dispatcher = db.clone();
    tokio::spawn(async move {
        dispatcher::run_dispatcher(db_for_dispatcher).await;
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/backup", get(tasks::backup))
        .route("/tasks/:id", get(tasks::get_task))
        .route("/tasks/:id/queued", post(tasks::task_queued))
        .route("/tasks/:id/started", post(tasks::task_started))
        .route("/tasks/:id/executed", post(tasks::task_executed))
        .route("/settings", get(settings::get_settings).put(settings::put_settings))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // The listener has drained; tasks still running lost their workers.
    sweeper::run_sweeper(db).await;
}

async fn health_check() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
