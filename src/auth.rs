use async_trait::async_trait;
use axum::http::header;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    AppState,
    context::{Credential, Identity, RequestContext, Surface},
    dispatcher::Middleware,
    error::{AppError, Outcome},
    models::User,
    store::{Store, StoreError},
};

// --- Session Cookie ---

/// Claims
///
/// Payload of the signed session cookie. It only references the server-side session;
/// the user is looked up again on every request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Session id in the session store.
    pub sid: Uuid,
    pub exp: usize,
    pub iat: usize,
}

/// Signs the cookie value for a session (HS256 with the configured secret).
pub fn sign_session(sid: Uuid, expires_at: DateTime<Utc>, secret: &str) -> Result<String, AppError> {
    let claims = Claims {
        sid,
        exp: expires_at.timestamp().max(0) as usize,
        iat: Utc::now().timestamp().max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("failed to sign session cookie: {e}")))
}

/// Verifies a cookie value and returns the session id it names. Any failure (bad
/// signature, expiry, garbage) is `None`.
pub fn verify_session(token: &str, secret: &str) -> Option<Uuid> {
    let mut validation = Validation::default();
    validation.validate_exp = true;

    match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) => Some(data.claims.sid),
        Err(e) => {
            match e.kind() {
                ErrorKind::ExpiredSignature => tracing::debug!("session cookie expired"),
                _ => tracing::debug!(error = %e, "session cookie rejected"),
            }
            None
        }
    }
}

pub fn session_cookie(name: &str, value: &str, max_age_secs: i64) -> String {
    format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}")
}

pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

// --- Secrets ---

/// Fresh random secret: 40 hex characters. Used for access tokens, CSRF tokens and
/// password salts.
pub fn generate_token() -> String {
    let mut bytes = Vec::with_capacity(20);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(&Uuid::new_v4().as_bytes()[..4]);
    hex::encode(bytes)
}

/// One-way hash under which access tokens are stored and looked up.
pub fn hash_token(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares two secrets without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// --- Credential Parsing ---

/// Decodes `Basic <base64(user:pass)>`. Anything malformed is `None`.
pub fn decode_basic(authorization: &str) -> Option<(String, String)> {
    let (scheme, encoded) = authorization.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

/// The token from `Authorization: token <t>` or `Authorization: Bearer <t>`.
pub fn scheme_token(authorization: &str) -> Option<String> {
    let (scheme, token) = authorization.trim().split_once(' ')?;
    let token = token.trim();
    let accepted = scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer");
    (accepted && !token.is_empty()).then(|| token.to_owned())
}

/// Resolves an access token secret to its owner.
pub async fn user_for_token(store: &dyn Store, secret: &str) -> Result<Option<User>, StoreError> {
    if secret.is_empty() {
        return Ok(None);
    }
    let Some(token) = store.get_access_token_by_hash(&hash_token(secret)).await? else {
        return Ok(None);
    };
    store.get_user_by_id(token.uid).await
}

// --- TokenAuthenticator ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Session cookie on web paths, credentials on API and Git paths.
    Auto,
    /// Credentials only, and only when no identity is attached yet.
    Credentials,
}

/// TokenAuthenticator
///
/// Attaches an [`Identity`] to the context when the request proves one. It never
/// rejects a request: missing, malformed or wrong credentials leave the caller
/// anonymous and the gates downstream decide. Only a failing store is an error.
#[derive(Debug, Clone, Copy)]
pub struct TokenAuthenticator {
    mode: AuthMode,
}

impl TokenAuthenticator {
    pub fn auto() -> Self {
        Self {
            mode: AuthMode::Auto,
        }
    }

    pub fn credentials() -> Self {
        Self {
            mode: AuthMode::Credentials,
        }
    }
}

#[async_trait]
impl Middleware for TokenAuthenticator {
    async fn handle(&self, ctx: &mut RequestContext, state: &AppState) -> Outcome {
        match self.mode {
            AuthMode::Auto if ctx.surface == Surface::Web => from_session(ctx, state).await?,
            AuthMode::Auto => from_credentials(ctx, state).await?,
            AuthMode::Credentials if ctx.identity.is_none() => from_credentials(ctx, state).await?,
            AuthMode::Credentials => {}
        }

        if let Some(user) = ctx.user() {
            let (name, admin) = (user.name.clone(), user.is_admin);
            ctx.data.insert("IsSigned".into(), Value::Bool(true));
            ctx.data.insert("SignedUserName".into(), Value::from(name));
            ctx.data.insert("IsAdmin".into(), Value::Bool(admin));
        }
        Ok(())
    }
}

async fn from_session(ctx: &mut RequestContext, state: &AppState) -> Result<(), StoreError> {
    let Some(cookie) = ctx.cookie(&state.config.session_cookie) else {
        return Ok(());
    };
    let Some(sid) = verify_session(&cookie, &state.config.secret_key) else {
        return Ok(());
    };
    let Some(session) = state.sessions.get(sid).await else {
        tracing::debug!(%sid, "session cookie names an unknown session");
        return Ok(());
    };
    let Some(user) = state.store.get_user_by_id(session.user_id).await? else {
        return Ok(());
    };

    ctx.session = Some(session);
    ctx.identity = Some(Identity::Session(user));
    Ok(())
}

async fn from_credentials(ctx: &mut RequestContext, state: &AppState) -> Result<(), StoreError> {
    let authorization = ctx.header(header::AUTHORIZATION).map(str::to_owned);
    let store = state.store.as_ref();

    if let Some((login, password)) = authorization.as_deref().and_then(decode_basic) {
        if let Some(user) = store.authenticate(&login, &password).await? {
            ctx.identity = Some(Identity::Token {
                user,
                credential: Credential::Basic,
            });
            return Ok(());
        }
        // Git clients can only send Basic; a token may sit in either half.
        for candidate in [&login, &password] {
            if let Some(user) = user_for_token(store, candidate).await? {
                ctx.identity = Some(Identity::Token {
                    user,
                    credential: Credential::AccessToken,
                });
                return Ok(());
            }
        }
        tracing::debug!(login = %login, "basic credentials did not match");
    }

    let token = authorization
        .as_deref()
        .and_then(scheme_token)
        .or_else(|| ctx.query_value("token"))
        .or_else(|| ctx.query_value("access_token"));
    let Some(token) = token else {
        return Ok(());
    };

    match user_for_token(store, &token).await? {
        Some(user) => {
            ctx.identity = Some(Identity::Token {
                user,
                credential: Credential::AccessToken,
            });
        }
        None => tracing::debug!("access token did not match any stored token"),
    }
    Ok(())
}

/// RequireBasicAuth
///
/// Restricts a route to callers who presented username and password. Used by token
/// management so a leaked token cannot mint more tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireBasicAuth;

#[async_trait]
impl Middleware for RequireBasicAuth {
    async fn handle(&self, ctx: &mut RequestContext, _: &AppState) -> Outcome {
        match &ctx.identity {
            Some(identity) if identity.is_basic_auth() => Ok(()),
            _ => Err(AppError::Unauthorized.into()),
        }
    }
}
