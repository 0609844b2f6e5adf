//! services/chat_api/src/bin/api.rs

use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use campus_chat_core::{ChangeFeed, ChatStore, MemoryChatStore};
use chat_api_lib::{
    adapters::{PgChangeFeed, PgChatStore},
    config::{Config, ConfigError},
    error::ApiError,
    web::{
        find_or_create_room_handler, list_messages_handler, list_rooms_handler, mark_read_handler,
        middleware::{USER_ID_HEADER, USER_ROLE_HEADER},
        require_identity,
        rest::ApiDoc,
        send_message_handler,
        state::AppState,
        unread_handler, ws_handler,
    },
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    let shutdown = CancellationToken::new();

    // --- 2. Connect the Store & Change Feed ---
    let (store, feed, listener_task) = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(database_url)
                .await?;
            let store = PgChatStore::new(db_pool.clone());
            info!("Running database migrations...");
            store.run_migrations().await?;
            info!("Database migrations complete.");

            let (feed, task) = PgChangeFeed::spawn(db_pool, config.backoff(), shutdown.clone());
            let store: Arc<dyn ChatStore> = Arc::new(store);
            let feed: Arc<dyn ChangeFeed> = Arc::new(feed);
            (store, feed, Some(task))
        }
        None => {
            warn!("DATABASE_URL is not set; chats are kept in memory and lost on restart.");
            let memory = Arc::new(MemoryChatStore::new());
            let store: Arc<dyn ChatStore> = memory.clone();
            let feed: Arc<dyn ChangeFeed> = memory;
            (store, feed, None)
        }
    };

    // --- 3. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(config.clone(), store, feed));

    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|_| {
        ConfigError::InvalidValue("CORS_ORIGIN".to_string(), format!("'{}' is not a valid origin", config.cors_origin))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(USER_ROLE_HEADER),
        ]);

    // --- 4. Create the Web Router ---
    let protected_routes = Router::new()
        .route("/rooms", get(list_rooms_handler).post(find_or_create_room_handler))
        .route("/rooms/{room_id}/messages", get(list_messages_handler).post(send_message_handler))
        .route("/rooms/{room_id}/read", post(mark_read_handler))
        .route("/unread", get(unread_handler))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn(require_identity));

    let api_router = Router::new()
        .merge(protected_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!("Swagger UI available at http://{}/swagger-ui", config.bind_address);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for the shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = listener_task {
        if let Err(e) = task.await {
            error!("Change-feed listener ended abnormally: {:?}", e);
        }
    }
    Ok(())
}
