//! Chatwire server entry point.

use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use chatwire_common::Config;
use chatwire_core::ConversationService;
use chatwire_realtime::{
    PresenceRoster, RealtimeHub, StaticTokenAuthenticator, middleware::AppState,
    middleware::auth_middleware, router as api_router, session_handler,
};
use chatwire_store::ConversationRepository;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatwire=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting chatwire server...");

    // Load configuration
    let config = Config::load()?;

    // Wire the conversation core into the realtime fan-out
    let hub = RealtimeHub::new(config.realtime.channel_capacity);
    let roster = PresenceRoster::new(hub.clone());
    let mut conversation_service = ConversationService::new(ConversationRepository::new());
    conversation_service.set_event_publisher(Arc::new(hub.clone()));
    conversation_service.set_presence(Arc::new(roster.clone()));

    if config.auth.static_tokens.is_empty() {
        tracing::warn!("No static tokens configured; every session will be rejected");
    }
    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Create app state
    let state = AppState {
        conversation_service,
        hub,
        roster,
        authenticator,
        config,
    };

    // Build router
    let app = Router::new()
        .route("/realtime", get(session_handler))
        .nest("/api", api_router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
