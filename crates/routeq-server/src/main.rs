//! RouteQ Server - consumer engine demo and admin API
//!
//! Runs the consumer engine over the in-memory transport with the demo
//! modules mounted, and serves a small HTTP API to publish messages and
//! inspect the engine.

mod modules;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use routeq_core::{ConsumerEngine, HandlerRegistry, Module, PublishArgs, Publisher};
use routeq_transport::MemoryTransport;
use routeq_types::{EngineConfig, Error, TransportStats};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::modules::{
    Deliveries, DeliveryRecord, NotificationsModule, OrdersModule, DELIVERY_LOG_CAPACITY,
};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: ConsumerEngine,
    transport: Arc<MemoryTransport>,
    publisher: Publisher,
    deliveries: Deliveries,
}

// ==================== Request/Response Types ====================

/// Publish message request
#[derive(Debug, Deserialize, ToSchema)]
struct PublishRequest {
    /// Concrete topic, e.g. "orders/42/created"
    topic: String,
    /// Message body content
    #[serde(default)]
    body: String,
    /// Content type (defaults to "text/plain")
    #[serde(default)]
    content_type: Option<String>,
    /// Partition or ordering key
    #[serde(default)]
    key: Option<String>,
    /// Custom message headers
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Delivery QoS requested from the broker
    #[serde(default)]
    qos: Option<u8>,
    /// Keep as the topic's retained message
    #[serde(default)]
    retain: Option<bool>,
}

/// Publish response
#[derive(Debug, Serialize, ToSchema)]
struct PublishResponse {
    /// ID assigned by the transport
    message_id: String,
    /// Transport sequence number
    sequence: Option<u64>,
}

/// Mounted route
#[derive(Debug, Serialize, ToSchema)]
struct RouteResponse {
    module: String,
    pattern: String,
    /// Subscription filter used on the transport
    filter: String,
}

/// Engine status
#[derive(Debug, Serialize, ToSchema)]
struct EngineResponse {
    /// Worker kind reported by the engine
    name: String,
    service_name: String,
    /// Handler invocations currently running
    in_flight: usize,
    routes: Vec<RouteResponse>,
    transport: TransportStats,
}

/// Delivery query parameters
#[derive(Debug, Deserialize, ToSchema)]
struct DeliveriesQuery {
    /// Maximum number of records to return (default: 20)
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

/// API Error response
#[derive(Debug, Serialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
}

// ==================== Error Handling ====================

/// Errors surfaced by the HTTP handlers
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] Error),
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Engine(err) => match err {
                Error::InvalidConfig(_) => (StatusCode::BAD_REQUEST, "INVALID_CONFIG"),
                Error::TransportClosed => (StatusCode::SERVICE_UNAVAILABLE, "TRANSPORT_CLOSED"),
                Error::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
                Error::MessageNotFound(_) => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.status();

        let body = Json(ApiErrorBody {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "RouteQ API",
        version = "0.1.0",
        description = "RouteQ - topic-routed consumer engine admin API",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(health, publish_message, engine_status, list_deliveries),
    components(
        schemas(
            HealthResponse,
            PublishRequest,
            PublishResponse,
            RouteResponse,
            EngineResponse,
            TransportStats,
            DeliveriesQuery,
            DeliveryRecord,
            ApiErrorBody,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "engine", description = "Consumer engine endpoints"),
        (name = "messages", description = "Message operations endpoints")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Publish a message to a topic
#[utoipa::path(
    post,
    path = "/api/v1/publish",
    tag = "messages",
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Message published", body = PublishResponse),
        (status = 400, description = "Invalid topic", body = ApiErrorBody),
        (status = 503, description = "Transport closed", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    validate_topic(&req.topic)?;

    let mut args = PublishArgs::new(req.topic, Bytes::from(req.body)).with_headers(req.headers);
    if let Some(content_type) = req.content_type {
        args = args.with_content_type(content_type);
    }
    if let Some(key) = req.key {
        args = args.with_key(key);
    }
    if let Some(qos) = req.qos {
        args = args.with_qos(qos);
    }
    if let Some(retain) = req.retain {
        args = args.with_retain(retain);
    }

    let receipt = state.publisher.publish_with(args).await?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            message_id: receipt.message_id.to_string(),
            sequence: receipt.sequence,
        }),
    ))
}

/// Get engine status
#[utoipa::path(
    get,
    path = "/api/v1/engine",
    tag = "engine",
    responses(
        (status = 200, description = "Engine status", body = EngineResponse)
    )
)]
async fn engine_status(State(state): State<AppState>) -> Json<EngineResponse> {
    let routes = state
        .engine
        .routes()
        .into_iter()
        .map(|route| RouteResponse {
            module: route.module,
            pattern: route.pattern,
            filter: route.filter,
        })
        .collect();

    Json(EngineResponse {
        name: state.engine.name().to_string(),
        service_name: state.engine.config().service_name.clone(),
        in_flight: state.engine.in_flight(),
        routes,
        transport: state.transport.stats(),
    })
}

/// List recently handled messages
#[utoipa::path(
    get,
    path = "/api/v1/deliveries",
    tag = "messages",
    params(
        ("limit" = Option<usize>, Query, description = "Maximum records to return")
    ),
    responses(
        (status = 200, description = "Recent deliveries, newest first", body = Vec<DeliveryRecord>)
    )
)]
async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveriesQuery>,
) -> Json<Vec<DeliveryRecord>> {
    Json(state.deliveries.recent(query.limit))
}

/// Publishing needs a concrete topic, not a filter
fn validate_topic(topic: &str) -> Result<(), AppError> {
    if topic.trim_matches('/').is_empty() {
        return Err(AppError::BadRequest("topic must not be empty".to_string()));
    }
    if topic.split('/').any(|level| level == "+" || level == "#") {
        return Err(AppError::BadRequest(format!(
            "topic '{topic}' contains wildcards"
        )));
    }
    Ok(())
}

// ==================== Router ====================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Health
        .route("/health", get(health))
        // Engine
        .route("/api/v1/engine", get(engine_status))
        // Messages
        .route("/api/v1/publish", post(publish_message))
        .route("/api/v1/deliveries", get(list_deliveries))
        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ==================== Configuration ====================

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "routeq=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("ROUTEQ_LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_engine_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("ROUTEQ_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let config = EngineConfig::from_json(&raw)?;
            info!(path = %path, "Loaded engine configuration");
            Ok(config)
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_tracing();

    let config = load_engine_config()?;
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    // Mount demo modules on the in-memory transport
    let transport = Arc::new(MemoryTransport::new());
    let deliveries = Deliveries::new(DELIVERY_LOG_CAPACITY);
    let modules: Vec<Arc<dyn Module>> = vec![
        Arc::new(OrdersModule::new(deliveries.clone())),
        Arc::new(NotificationsModule::new(deliveries.clone())),
    ];
    let registry = HandlerRegistry::from_modules(&modules)?;

    let engine = ConsumerEngine::builder(transport.clone(), registry)
        .config(config)
        .build()?;

    let serving = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.serve().await })
    };

    // Create app state
    let state = AppState {
        publisher: engine.publisher(),
        engine: engine.clone(),
        transport,
        deliveries,
    };

    // Create router
    let app = create_router(state);

    // Start server
    let addr = std::env::var("ROUTEQ_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("RouteQ server listening on {}", addr);
    info!("Swagger UI: http://{}/swagger-ui/", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = engine.shutdown(shutdown_timeout).await {
        warn!(error = %err, "Consumer engine did not drain cleanly");
    }
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "Consumer engine stopped with error"),
        Err(err) => error!(error = %err, "Consumer engine task failed"),
    }

    Ok(())
}
