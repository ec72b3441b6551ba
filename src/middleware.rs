use std::{marker::PhantomData, path::Path};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::{
    AppState,
    context::RequestContext,
    dispatcher::Middleware,
    error::{Halt, Outcome},
};

// --- Static assets ---

/// Only plain relative paths are served: no `..`, empty segments, backslashes or NUL.
fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\0')
        && !path.contains('\\')
        && path.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Streams a regular file, or `None` if there is no such file.
pub async fn serve_file(path: &Path, head_only: bool) -> Option<Response> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    let body = if head_only {
        Body::empty()
    } else {
        let file = tokio::fs::File::open(path).await.ok()?;
        Body::from_stream(ReaderStream::new(file))
    };

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"));
    if let Ok(len) = HeaderValue::from_str(&meta.len().to_string()) {
        headers.insert(header::CONTENT_LENGTH, len);
    }
    Some(response)
}

/// StaticAssets
///
/// Process-wide stage serving files under `static_root` for GET/HEAD requests. A hit
/// ends the chain; a miss lets routing continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAssets;

#[async_trait]
impl Middleware for StaticAssets {
    async fn handle(&self, ctx: &mut RequestContext, state: &AppState) -> Outcome {
        let head_only = match ctx.method {
            Method::GET => false,
            Method::HEAD => true,
            _ => return Ok(()),
        };
        let path = {
            let relative = ctx.path().trim_start_matches('/');
            if !is_safe_relative(relative) {
                return Ok(());
            }
            state.config.static_root.join(relative)
        };

        match serve_file(&path, head_only).await {
            Some(response) => Err(Halt::Respond(response)),
            None => Ok(()),
        }
    }
}

// --- Render data ---

/// SetData
///
/// Puts a fixed value into the render data of every request it runs for, e.g. the
/// `PageIsSettings` flag a settings group shares.
#[derive(Debug, Clone)]
pub struct SetData {
    key: String,
    value: Value,
}

impl SetData {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn flag(key: impl Into<String>) -> Self {
        Self::new(key, true)
    }
}

#[async_trait]
impl Middleware for SetData {
    async fn handle(&self, ctx: &mut RequestContext, _: &AppState) -> Outcome {
        ctx.data.insert(self.key.clone(), self.value.clone());
        Ok(())
    }
}

// --- Binding ---

/// BindJson
///
/// Decodes the JSON body as `T` and stores it on the context. Decoding failures do not
/// halt: they are recorded in `ctx.error` for the handler to answer (422 on the API).
pub struct BindJson<T> {
    _form: PhantomData<fn() -> T>,
}

impl<T> BindJson<T> {
    pub fn new() -> Self {
        Self { _form: PhantomData }
    }
}

impl<T> Default for BindJson<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Middleware for BindJson<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    async fn handle(&self, ctx: &mut RequestContext, _: &AppState) -> Outcome {
        let bytes = match ctx.read_body().await {
            Ok(bytes) => bytes,
            Err(e) => {
                ctx.error = Some(e.to_string());
                return Ok(());
            }
        };
        let bound = serde_json::from_slice::<T>(&bytes).and_then(serde_json::to_value);
        match bound {
            Ok(value) => ctx.form = Some(value),
            Err(e) => ctx.error = Some(e.to_string()),
        }
        Ok(())
    }
}
