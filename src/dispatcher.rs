use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{FromRef, Request, State},
    http::StatusCode,
    response::Response,
};
use futures::{FutureExt, future::BoxFuture};

use crate::{
    AppState,
    context::{RequestContext, Surface},
    error::{AppError, ErrorScope, Halt, Outcome, api_error},
    router::Router,
};

// --- Chain Building Blocks ---

/// Middleware
///
/// One stage of the chain. A stage inspects or mutates the context and either returns
/// `Ok(())` to let the next stage run, or a [`Halt`] which ends the request with that
/// response. Nothing after a halting stage runs.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut RequestContext, state: &AppState) -> Outcome;
}

/// A shareable middleware instance, as stored in route tables and groups.
pub type Stage = Arc<dyn Middleware>;

/// Handler
///
/// The terminal step of a route. Any `async fn(RequestContext, AppState) ->
/// Result<Response, AppError>` qualifies.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext, state: AppState) -> BoxFuture<'static, Result<Response, AppError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext, AppState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, AppError>> + Send + 'static,
{
    fn call(&self, ctx: RequestContext, state: AppState) -> BoxFuture<'static, Result<Response, AppError>> {
        Box::pin(self(ctx, state))
    }
}

// --- Dispatcher ---

/// Dispatcher
///
/// Owns the route table and runs one request through it:
/// process-wide stages, route match, the route's stages (group stages first, outer to
/// inner), then the handler. Every step runs inside a recovery wrapper, so a panic
/// anywhere becomes a logged 500 and never reaches the serving loop.
pub struct Dispatcher {
    global: Vec<Stage>,
    router: Router,
    not_found: Arc<dyn Handler>,
}

impl Dispatcher {
    pub fn new(router: Router) -> Self {
        Self {
            global: Vec::new(),
            router,
            not_found: Arc::new(not_found),
        }
    }

    /// Appends a process-wide stage. These run before routing, in insertion order.
    pub fn with_global(mut self, stage: Stage) -> Self {
        self.global.push(stage);
        self
    }

    pub fn with_not_found(mut self, handler: impl Handler) -> Self {
        self.not_found = Arc::new(handler);
        self
    }

    pub async fn dispatch(&self, state: AppState, request: Request) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_owned();

        match AssertUnwindSafe(self.run(state.clone(), request))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(
                    req_id = %request_id,
                    %method,
                    %path,
                    panic = %reason,
                    "recovered from panic while handling request"
                );
                let scope = ErrorScope {
                    surface: Surface::for_path(&path),
                    request_uri: path,
                    request_id,
                };
                AppError::Internal(reason).render(&scope, &state)
            }
        }
    }

    async fn run(&self, state: AppState, request: Request) -> Response {
        let mut ctx = RequestContext::from_request(request);

        if let Err(halt) = run_stages(&self.global, &mut ctx, &state).await {
            return finish(halt, &ctx, &state);
        }

        let Some(found) = self.router.find(&ctx.method, ctx.path()) else {
            tracing::debug!(method = %ctx.method, path = %ctx.path(), "no route matched");
            return invoke(self.not_found.as_ref(), ctx, state).await;
        };
        ctx.params = found.params;
        let route = found.route;

        if let Err(halt) = run_stages(route.stages(), &mut ctx, &state).await {
            return finish(halt, &ctx, &state);
        }

        invoke(route.handler().as_ref(), ctx, state).await
    }
}

async fn run_stages(stages: &[Stage], ctx: &mut RequestContext, state: &AppState) -> Outcome {
    for stage in stages {
        stage.handle(ctx, state).await?;
    }
    Ok(())
}

fn scope_of(ctx: &RequestContext) -> ErrorScope {
    ErrorScope {
        surface: ctx.surface,
        request_uri: ctx.request_uri(),
        request_id: ctx.request_id.clone(),
    }
}

fn finish(halt: Halt, ctx: &RequestContext, state: &AppState) -> Response {
    match halt {
        Halt::Respond(response) => response,
        Halt::Error(err) => err.render(&scope_of(ctx), state),
    }
}

async fn invoke(handler: &dyn Handler, ctx: RequestContext, state: AppState) -> Response {
    let scope = scope_of(&ctx);
    match handler.call(ctx, state.clone()).await {
        Ok(response) => response,
        Err(err) => err.render(&scope, &state),
    }
}

/// Default terminal behavior for unmatched requests.
pub async fn not_found(ctx: RequestContext, _: AppState) -> Result<Response, AppError> {
    if ctx.is_api() {
        return Ok(api_error(StatusCode::NOT_FOUND, "not found"));
    }
    Err(AppError::NotFound)
}

/// Gateway
///
/// The axum state behind the single fallback route. axum only supplies the transport and
/// the outer tower layers; routing happens in the [`Dispatcher`].
#[derive(Clone)]
pub struct Gateway {
    pub dispatcher: Arc<Dispatcher>,
    pub state: AppState,
}

impl FromRef<Gateway> for Arc<Dispatcher> {
    fn from_ref(gateway: &Gateway) -> Self {
        Arc::clone(&gateway.dispatcher)
    }
}

impl FromRef<Gateway> for AppState {
    fn from_ref(gateway: &Gateway) -> Self {
        gateway.state.clone()
    }
}

/// The axum fallback: every request goes through the dispatcher.
pub async fn gateway(
    State(dispatcher): State<Arc<Dispatcher>>,
    State(state): State<AppState>,
    request: Request,
) -> Response {
    dispatcher.dispatch(state, request).await
}
