use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    AppState, config::ConfigError, context::Surface, git::GitError, models::ApiErrorBody,
    store::StoreError,
};

/// AppError
///
/// Every way a request can end other than success. The first five variants are
/// ordinary control flow produced on purpose by gates, resolvers and handlers; only
/// `Internal` is unexpected and gets logged at error level.
#[derive(Debug, Error)]
pub enum AppError {
    /// Unmatched route, or a resource the caller may not learn exists.
    #[error("not found")]
    NotFound,
    #[error("sign-in required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    /// API input that parsed but failed validation.
    #[error("unprocessable entity: {0}")]
    Unprocessable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Internal details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg) | AppError::Unprocessable(msg) => msg.clone(),
            AppError::Internal(_) => "internal server error".to_owned(),
            other => other.to_string(),
        }
    }

    /// Converts the error into the response its surface expects.
    pub fn render(self, scope: &ErrorScope, state: &AppState) -> Response {
        if let AppError::Internal(detail) = &self {
            tracing::error!(
                req_id = %scope.request_id,
                uri = %scope.request_uri,
                error = %detail,
                "request failed"
            );
        }

        match scope.surface {
            Surface::Api => api_error(self.status(), self.public_message()),
            Surface::Git => git_error(self.status(), self.public_message()),
            Surface::Web => match self {
                AppError::Unauthorized => sign_in_redirect(&scope.request_uri),
                other => web_error(other.status(), other.public_message(), state),
            },
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<GitError> for AppError {
    fn from(err: GitError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// ErrorScope
///
/// What the renderer needs to know about a request once its context has been handed to
/// the terminal handler.
#[derive(Debug, Clone)]
pub struct ErrorScope {
    pub surface: Surface,
    pub request_uri: String,
    pub request_id: String,
}

/// Halt
///
/// How a middleware stops the chain: either with an error rendered for the request's
/// surface, or with a response it built itself (redirects, served files).
#[derive(Debug)]
pub enum Halt {
    Error(AppError),
    Respond(Response),
}

impl From<AppError> for Halt {
    fn from(err: AppError) -> Self {
        Halt::Error(err)
    }
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        Halt::Error(err.into())
    }
}

/// Result of one middleware stage: `Ok(())` continues the chain.
pub type Outcome = Result<(), Halt>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiErrorBody {
        code: status.as_u16(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

/// Git clients only print plain text; a 401 must carry a Basic challenge or the client
/// never asks the user for credentials.
pub fn git_error(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = (status, format!("{}\n", message.into())).into_response();
    if status == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\".\""),
        );
    }
    response
}

pub fn sign_in_redirect(return_to: &str) -> Response {
    let query = serde_urlencoded::to_string([("redirect_to", return_to)]).unwrap_or_default();
    Redirect::to(&format!("/user/login?{query}")).into_response()
}

fn web_error(status: StatusCode, message: String, state: &AppState) -> Response {
    let mut data = Map::new();
    data.insert("Title".into(), Value::from(status.as_u16().to_string()));
    data.insert("ErrorMsg".into(), Value::from(message.clone()));
    let template = format!("status/{}", status.as_u16());
    match state.renderer.render(&template, &data) {
        Ok(html) => (status, axum::response::Html(html)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, %template, "failed to render error page");
            (status, message).into_response()
        }
    }
}

/// StartupError
///
/// Fatal conditions while bringing the process up. `main` logs them and exits non-zero.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to the database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to migrate the database: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to load TLS certificate or key: {0}")]
    Tls(std::io::Error),
    #[error("server terminated: {0}")]
    Serve(std::io::Error),
}
