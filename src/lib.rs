use std::sync::Arc;

use axum::http::HeaderName;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    decompression::RequestDecompressionLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

// --- Module Structure ---

// Request pipeline: routing, dispatch and the middleware that gate requests.
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod middleware;
pub mod resolver;
pub mod router;

// Identity: credentials, signed session cookies and the session table.
pub mod auth;
pub mod session;

// Terminal handlers and the Git bridge.
pub mod api;
pub mod git;
pub mod handlers;

// Collaborators and configuration.
pub mod config;
pub mod models;
pub mod render;
pub mod store;

// The route table, split by area.
pub mod routes;

// --- Public Re-exports ---

pub use config::AppConfig;
pub use dispatcher::{Dispatcher, Gateway, gateway};
pub use error::{AppError, StartupError};
pub use store::{MemoryStore, PostgresStore, StoreState};

use auth::TokenAuthenticator;
use git::{GitCommand, GitState, HookState, LogHook};
use middleware::StaticAssets;
use render::{HtmlRenderer, RendererState};
use session::{MemorySessionStore, SessionState};

/// ApiDoc
///
/// OpenAPI description of API v1, served at `/api-docs/openapi.json` when
/// `enable_swagger` is set.
#[derive(OpenApi)]
#[openapi(
    paths(
        api::markdown, api::markdown_raw, api::search_users, api::get_user,
        api::list_tokens, api::create_token, api::delete_token,
        api::list_my_repos, api::search_repos, api::get_repo, api::delete_repo
    ),
    components(
        schemas(
            models::MarkdownForm, models::CreateAccessTokenOption, models::ApiAccessToken,
            models::ApiUser, models::ApiPermission, models::ApiRepository, models::ApiErrorBody,
            models::Permission,
        )
    ),
    tags(
        (name = "gitward", description = "Source hosting API v1")
    )
)]
pub struct ApiDoc;

/// AppState
///
/// The collaborators every request may use, shared by all requests. Cloning is cheap:
/// every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Users, repositories, grants and access tokens.
    pub store: StoreState,
    /// Server-side browser sessions.
    pub sessions: SessionState,
    /// Runs the pack protocol for the Git bridge.
    pub git: GitState,
    /// Called after a successful push.
    pub hooks: HookState,
    /// Turns a template name and render data into a page.
    pub renderer: RendererState,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// State with the default collaborators: in-process sessions, the `git` binary from
    /// the config, logging post-receive hook and the built-in HTML renderer.
    pub fn new(config: AppConfig, store: StoreState) -> Self {
        let git = GitCommand::new(config.git_binary.clone(), config.git_timeout());
        Self {
            store,
            sessions: Arc::new(MemorySessionStore::new()),
            git: Arc::new(git),
            hooks: Arc::new(LogHook),
            renderer: Arc::new(HtmlRenderer),
            config: Arc::new(config),
        }
    }

    pub fn with_git(mut self, git: GitState) -> Self {
        self.git = git;
        self
    }

    pub fn with_hooks(mut self, hooks: HookState) -> Self {
        self.hooks = hooks;
        self
    }
}

/// build_dispatcher
///
/// The route table plus the process-wide stages, which run before routing in this
/// order: static files, then identity attachment.
pub fn build_dispatcher(config: &AppConfig) -> Dispatcher {
    Dispatcher::new(routes::build(config))
        .with_global(Arc::new(StaticAssets))
        .with_global(Arc::new(TokenAuthenticator::auto()))
}

/// create_app
///
/// Wraps the dispatcher in the axum service and the tower-http observability layers.
/// Every request that is not Swagger UI reaches the dispatcher through the fallback.
pub fn create_app(state: AppState) -> axum::Router {
    let dispatcher = Arc::new(build_dispatcher(&state.config));
    let enable_swagger = state.config.enable_swagger;
    let disable_router_log = state.config.disable_router_log;
    let enable_gzip = state.config.enable_gzip;

    let x_request_id = HeaderName::from_static("x-request-id");

    let mut base = axum::Router::new();
    if enable_swagger {
        base = base.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }
    let app = base
        .fallback(gateway)
        .with_state(Gateway { dispatcher, state });

    let app = if enable_gzip {
        app.layer(CompressionLayer::new().gzip(true))
    } else {
        app
    };

    // Tracing sits inside the request-id layer so every span carries the id.
    let app = if disable_router_log {
        app
    } else {
        app.layer(
            TraceLayer::new_for_http()
                .make_span_with(trace_span_logger)
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(tower_http::LatencyUnit::Millis),
                ),
        )
    };

    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(PropagateRequestIdLayer::new(x_request_id))
            // Git clients gzip large negotiation requests.
            .layer(RequestDecompressionLayer::new()),
    )
}

/// trace_span_logger
///
/// Span for one request: method, uri and the `x-request-id` stamped by
/// `SetRequestIdLayer`.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
