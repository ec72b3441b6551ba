use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Method, Uri, header, request::Parts},
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{Permission, Repository, User},
    session::Session,
};

/// Bodies buffered by handlers (forms, markdown) are capped at this size.
pub const MAX_BUFFERED_BODY: usize = 1 << 20;

/// Surface
///
/// Which kind of client a request belongs to. It decides how errors are rendered and
/// which credentials the authenticator looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Browser pages: session cookie, HTML error pages, sign-in redirects.
    Web,
    /// `/api/...`: token or Basic credentials, JSON error bodies.
    Api,
    /// Git smart-HTTP endpoints: Basic or token credentials, plain-text errors.
    Git,
}

impl Surface {
    pub fn for_path(path: &str) -> Self {
        if path == "/api" || path.starts_with("/api/") {
            Surface::Api
        } else {
            Surface::Web
        }
    }
}

/// Credential
///
/// How an API/Git identity proved itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Basic,
    AccessToken,
}

/// Identity
///
/// The authenticated caller. Permission computation only ever looks at the user; the
/// scheme is kept for the few routes that accept a single one (token management only
/// accepts Basic credentials).
#[derive(Debug, Clone)]
pub enum Identity {
    Session(User),
    Token { user: User, credential: Credential },
}

impl Identity {
    pub fn user(&self) -> &User {
        match self {
            Identity::Session(user) => user,
            Identity::Token { user, .. } => user,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user().is_admin
    }

    pub fn is_basic_auth(&self) -> bool {
        matches!(
            self,
            Identity::Token {
                credential: Credential::Basic,
                ..
            }
        )
    }
}

/// Path parameters captured by the router, in pattern order. Names carry no leading `:`;
/// a trailing wildcard is stored under `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// RequestContext
///
/// Request-scoped state owned by the dispatcher for the lifetime of one request.
/// Middleware mutate it in chain order; the terminal handler receives it by value.
///
/// The typed fields (`identity`, `repository`, `permission`) are what the pipeline
/// decides. `data` is the loose map handed to page rendering, and `error` carries a
/// binding failure recorded by an ignore-error form binder.
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    body: Option<Body>,
    pub params: Params,
    pub surface: Surface,
    pub identity: Option<Identity>,
    pub session: Option<Session>,
    pub repository: Option<Repository>,
    pub permission: Permission,
    pub form: Option<Value>,
    pub error: Option<String>,
    pub data: Map<String, Value>,
}

impl RequestContext {
    pub fn new(parts: Parts, body: Body) -> Self {
        // SetRequestIdLayer has normally stamped the header already.
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request_id,
            surface: Surface::for_path(parts.uri.path()),
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: Some(body),
            params: Params::new(),
            identity: None,
            session: None,
            repository: None,
            permission: Permission::None,
            form: None,
            error: None,
            data: Map::new(),
        }
    }

    pub fn from_request(request: axum::extract::Request) -> Self {
        let (parts, body) = request.into_parts();
        Self::new(parts, body)
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query, as used for sign-in return addresses.
    pub fn request_uri(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| self.uri.path().to_owned())
    }

    pub fn is_api(&self) -> bool {
        self.surface == Surface::Api
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn user(&self) -> Option<&User> {
        self.identity.as_ref().map(Identity::user)
    }

    pub fn is_signed_in(&self) -> bool {
        self.identity.is_some()
    }

    /// Decodes the query string into `T`, the way axum's `Query` extractor does.
    pub fn query<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_urlencoded::from_str(self.uri.query().unwrap_or_default())
            .map_err(|e| AppError::BadRequest(format!("invalid query string: {e}")))
    }

    pub fn query_value(&self, key: &str) -> Option<String> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(self.uri.query().unwrap_or_default()).ok()?;
        pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_owned())
    }

    /// Hands the body over for streaming. Later calls get an empty body.
    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::empty)
    }

    /// Buffers the body, rejecting anything over [`MAX_BUFFERED_BODY`].
    pub async fn read_body(&mut self) -> Result<Bytes, AppError> {
        axum::body::to_bytes(self.take_body(), MAX_BUFFERED_BODY)
            .await
            .map_err(|e| AppError::BadRequest(format!("unreadable request body: {e}")))
    }

    /// Reads an `application/x-www-form-urlencoded` body.
    pub async fn read_form<T: DeserializeOwned>(&mut self) -> Result<T, AppError> {
        let bytes = self.read_body().await?;
        serde_urlencoded::from_bytes(&bytes)
            .map_err(|e| AppError::BadRequest(format!("invalid form: {e}")))
    }

    /// The value stored by a binding middleware, decoded as `T`.
    pub fn bound_form<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        let value = self
            .form
            .clone()
            .ok_or_else(|| AppError::Internal("form was not bound for this route".into()))?;
        serde_json::from_value(value).map_err(|e| AppError::Unprocessable(e.to_string()))
    }
}
