use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, html};
use serde::Deserialize;

use crate::{
    AppState,
    auth::{generate_token, hash_token},
    context::RequestContext,
    error::{AppError, api_error},
    models::{
        ApiAccessToken, ApiErrorBody, ApiRepository, ApiUser, CreateAccessTokenOption, MarkdownForm,
        Permission, SearchResults, User,
    },
    resolver::access_level,
    store::StoreError,
};

/// Search endpoints never return more than this many entries.
const MAX_SEARCH_LIMIT: i64 = 50;

/// SearchQuery
///
/// `?q=<keyword>&limit=<n>` for the search endpoints.
#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchQuery {
    /// Keyword matched against names.
    #[serde(default)]
    pub q: String,
    /// Maximum number of results (1 to 50, default 10).
    #[serde(default)]
    pub limit: Option<i64>,
}

impl SearchQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(10).clamp(1, MAX_SEARCH_LIMIT)
    }
}

fn html_response(body: String) -> Response {
    let mut response = body.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

// --- Markdown ---

/// Renders a Markdown document to HTML.
///
/// `gfm` adds tables, strikethrough and task lists. With a `link_base`, relative link
/// targets are resolved against it. Raw HTML in the input is emitted as text.
pub fn render_markdown(text: &str, gfm: bool, link_base: Option<&str>) -> String {
    let mut options = Options::empty();
    if gfm {
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
    }

    let events = Parser::new_ext(text, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: resolve_link(dest_url, link_base),
            title,
            id,
        }),
        other => other,
    });

    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, events);
    out
}

fn resolve_link<'a>(dest: CowStr<'a>, base: Option<&str>) -> CowStr<'a> {
    let Some(base) = base else {
        return dest;
    };
    let is_relative = !dest.is_empty()
        && !dest.contains("://")
        && !dest.starts_with('/')
        && !dest.starts_with('#')
        && !dest.starts_with("mailto:");
    if !is_relative {
        return dest;
    }
    CowStr::from(format!("{}/{}", base.trim_end_matches('/'), dest))
}

/// Render an arbitrary Markdown document.
#[utoipa::path(
    post,
    path = "/api/v1/markdown",
    request_body = MarkdownForm,
    responses(
        (status = 200, description = "Rendered HTML", body = String, content_type = "text/html"),
        (status = 422, description = "Malformed request body", body = ApiErrorBody)
    ),
    tag = "miscellaneous"
)]
pub async fn markdown(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    if let Some(error) = &ctx.error {
        return Ok(api_error(StatusCode::UNPROCESSABLE_ENTITY, error.clone()));
    }
    let form: MarkdownForm = ctx.bound_form()?;
    if form.text.is_empty() {
        return Ok(html_response(String::new()));
    }

    let body = match form.mode.as_str() {
        "gfm" => {
            let base = (!form.context.is_empty())
                .then(|| format!("{}{}", state.config.app_url, form.context.trim_matches('/')));
            render_markdown(&form.text, true, base.as_deref())
        }
        _ => render_markdown(&form.text, false, None),
    };
    Ok(html_response(body))
}

/// Render a Markdown document in raw mode: the request body is the document.
#[utoipa::path(
    post,
    path = "/api/v1/markdown/raw",
    request_body(content = String, content_type = "text/plain"),
    responses(
        (status = 200, description = "Rendered HTML", body = String, content_type = "text/html"),
        (status = 422, description = "Unreadable body", body = ApiErrorBody)
    ),
    tag = "miscellaneous"
)]
pub async fn markdown_raw(mut ctx: RequestContext, _: AppState) -> Result<Response, AppError> {
    let body = match ctx.read_body().await {
        Ok(body) => body,
        Err(e) => return Ok(api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    };
    let text = String::from_utf8_lossy(&body);
    Ok(html_response(render_markdown(&text, false, None)))
}

// --- Users ---

/// Search users by name.
#[utoipa::path(
    get,
    path = "/api/v1/users/search",
    params(SearchQuery),
    responses((status = 200, description = "Matching users", body = [ApiUser])),
    tag = "users"
)]
pub async fn search_users(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let query: SearchQuery = ctx.query()?;
    let show_email = ctx.is_signed_in();
    let users = state.store.search_users(query.q.trim(), query.limit()).await?;

    let data: Vec<ApiUser> = users
        .iter()
        .filter(|user| !user.is_organization)
        .map(|user| ApiUser::from_user(user, &state.config.app_url, show_email))
        .collect();
    Ok(Json(SearchResults { ok: true, data }).into_response())
}

/// Get a user's public profile.
#[utoipa::path(
    get,
    path = "/api/v1/users/{username}",
    params(("username" = String, Path, description = "User name")),
    responses(
        (status = 200, description = "User", body = ApiUser),
        (status = 404, description = "No such user", body = ApiErrorBody)
    ),
    tag = "users"
)]
pub async fn get_user(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let name = ctx.param("username").unwrap_or_default().to_owned();
    let show_email = ctx.is_signed_in();
    let user = state
        .store
        .get_user_by_name(&name)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(ApiUser::from_user(&user, &state.config.app_url, show_email)).into_response())
}

// --- Access Tokens ---

/// The caller, provided it is the user named in the path. Tokens are only managed by
/// their owner.
fn token_owner(ctx: &RequestContext) -> Result<User, AppError> {
    let user = ctx.user().ok_or(AppError::Unauthorized)?;
    let named = ctx.param("username").unwrap_or_default();
    if !user.name.eq_ignore_ascii_case(named) {
        return Err(AppError::Forbidden);
    }
    Ok(user.clone())
}

/// List the caller's access tokens.
#[utoipa::path(
    get,
    path = "/api/v1/users/{username}/tokens",
    params(("username" = String, Path, description = "Must be the authenticated user")),
    responses(
        (status = 200, description = "Tokens", body = [ApiAccessToken]),
        (status = 401, description = "Basic authentication required", body = ApiErrorBody)
    ),
    tag = "users"
)]
pub async fn list_tokens(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = token_owner(&ctx)?;
    let tokens: Vec<ApiAccessToken> = state
        .store
        .list_access_tokens(user.id)
        .await?
        .into_iter()
        .map(ApiAccessToken::from)
        .collect();
    Ok(Json(tokens).into_response())
}

/// Create an access token. The secret is returned in this response only.
#[utoipa::path(
    post,
    path = "/api/v1/users/{username}/tokens",
    params(("username" = String, Path, description = "Must be the authenticated user")),
    request_body = CreateAccessTokenOption,
    responses(
        (status = 201, description = "Created", body = ApiAccessToken),
        (status = 422, description = "Invalid name", body = ApiErrorBody)
    ),
    tag = "users"
)]
pub async fn create_token(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = token_owner(&ctx)?;
    if let Some(error) = &ctx.error {
        return Err(AppError::Unprocessable(error.clone()));
    }
    let option: CreateAccessTokenOption = ctx.bound_form()?;
    let name = option.name.trim().to_owned();
    if name.is_empty() {
        return Err(AppError::Unprocessable("name cannot be empty".into()));
    }

    let secret = generate_token();
    let token = match state
        .store
        .create_access_token(user.id, &name, &hash_token(&secret))
        .await
    {
        Ok(token) => token,
        Err(StoreError::AlreadyExists(what)) => {
            return Err(AppError::Unprocessable(format!("{what} already exists")));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(user = %user.name, token = %token.name, "access token created");

    let mut body = ApiAccessToken::from(token);
    body.token = Some(secret);
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// Delete one of the caller's access tokens.
#[utoipa::path(
    delete,
    path = "/api/v1/users/{username}/tokens/{id}",
    params(
        ("username" = String, Path, description = "Must be the authenticated user"),
        ("id" = i64, Path, description = "Token id")
    ),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "No such token", body = ApiErrorBody)
    ),
    tag = "users"
)]
pub async fn delete_token(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = token_owner(&ctx)?;
    let id: i64 = ctx
        .param("id")
        .and_then(|id| id.parse().ok())
        .ok_or(AppError::NotFound)?;
    if !state.store.delete_access_token(user.id, id).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(user = %user.name, token_id = id, "access token deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

// --- Repositories ---

/// List the repositories owned by the authenticated user.
#[utoipa::path(
    get,
    path = "/api/v1/user/repos",
    responses(
        (status = 200, description = "Repositories", body = [ApiRepository]),
        (status = 401, description = "Authentication required", body = ApiErrorBody)
    ),
    tag = "repositories"
)]
pub async fn list_my_repos(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = ctx.user().cloned().ok_or(AppError::Unauthorized)?;
    let repos: Vec<ApiRepository> = state
        .store
        .list_repositories(user.id)
        .await?
        .iter()
        .map(|repo| ApiRepository::from_repo(repo, &state.config.app_url, Permission::Owner))
        .collect();
    Ok(Json(repos).into_response())
}

/// Search public repositories by name.
#[utoipa::path(
    get,
    path = "/api/v1/repos/search",
    params(SearchQuery),
    responses((status = 200, description = "Matching repositories", body = [ApiRepository])),
    tag = "repositories"
)]
pub async fn search_repos(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let query: SearchQuery = ctx.query()?;
    let viewer = ctx.user().cloned();
    let repos = state
        .store
        .search_repositories(query.q.trim(), query.limit())
        .await?;

    let mut data = Vec::with_capacity(repos.len());
    for repo in &repos {
        let permission = access_level(state.store.as_ref(), viewer.as_ref(), repo).await?;
        data.push(ApiRepository::from_repo(repo, &state.config.app_url, permission));
    }
    Ok(Json(SearchResults { ok: true, data }).into_response())
}

/// Get a repository the caller can read.
#[utoipa::path(
    get,
    path = "/api/v1/repos/{username}/{reponame}",
    params(
        ("username" = String, Path, description = "Owner name"),
        ("reponame" = String, Path, description = "Repository name")
    ),
    responses(
        (status = 200, description = "Repository", body = ApiRepository),
        (status = 404, description = "No such repository, or not readable", body = ApiErrorBody)
    ),
    tag = "repositories"
)]
pub async fn get_repo(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let repo = ctx.repository.as_ref().ok_or(AppError::NotFound)?;
    Ok(Json(ApiRepository::from_repo(repo, &state.config.app_url, ctx.permission)).into_response())
}

/// Delete a repository. Owners only.
#[utoipa::path(
    delete,
    path = "/api/v1/repos/{username}/{reponame}",
    params(
        ("username" = String, Path, description = "Owner name"),
        ("reponame" = String, Path, description = "Repository name")
    ),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Not the owner", body = ApiErrorBody)
    ),
    tag = "repositories"
)]
pub async fn delete_repo(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let repo = ctx.repository.clone().ok_or(AppError::NotFound)?;
    if !state.store.delete_repository(repo.id).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(repo = %repo.full_name(), "repository deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Unknown paths below `/api/v1`.
pub async fn api_not_found(_: RequestContext, _: AppState) -> Result<Response, AppError> {
    Ok(api_error(StatusCode::NOT_FOUND, "not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gfm_enables_tables_and_strikethrough() {
        let text = "| a | b |\n|---|---|\n| 1 | 2 |\n\n~~gone~~";
        let gfm = render_markdown(text, true, None);
        assert!(gfm.contains("<table>"));
        assert!(gfm.contains("<del>gone</del>"));

        let plain = render_markdown(text, false, None);
        assert!(!plain.contains("<table>"));
        assert!(!plain.contains("<del>"));
    }

    #[test]
    fn raw_html_is_escaped() {
        let out = render_markdown("<script>alert(1)</script>", false, None);
        assert!(!out.contains("<script>"));
        assert!(out.contains("&lt;script&gt;"));
    }

    #[test]
    fn relative_links_resolve_against_context() {
        let out = render_markdown(
            "[doc](docs/README.md) [abs](https://x.org) [top](/y)",
            true,
            Some("http://localhost:3000/alice/repo"),
        );
        assert!(out.contains("href=\"http://localhost:3000/alice/repo/docs/README.md\""));
        assert!(out.contains("href=\"https://x.org\""));
        assert!(out.contains("href=\"/y\""));
    }

    #[test]
    fn search_limit_is_clamped() {
        let query = SearchQuery {
            q: String::new(),
            limit: Some(500),
        };
        assert_eq!(query.limit(), MAX_SEARCH_LIMIT);
        assert_eq!(SearchQuery::default().limit(), 10);
    }
}
