use axum::{
    http::{HeaderValue, Method, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::{
    AppState,
    auth::{expired_cookie, generate_token, hash_token, session_cookie, sign_session},
    context::RequestContext,
    error::AppError,
    middleware::serve_file,
    models::{
        DeleteAccessTokenForm, NewAccessTokenForm, Repository, RepoSettingsForm, SignInForm, User,
        avatar_hash,
    },
    store::StoreError,
};

// --- Rendering Helpers ---

/// Renders `template` with the request's data, plus the CSRF token of the session so
/// forms can post back.
fn page(ctx: &RequestContext, state: &AppState, template: &str) -> Result<Response, AppError> {
    page_with_status(ctx, state, template, StatusCode::OK)
}

fn page_with_status(
    ctx: &RequestContext,
    state: &AppState,
    template: &str,
    status: StatusCode,
) -> Result<Response, AppError> {
    let mut data = ctx.data.clone();
    if let Some(session) = &ctx.session {
        data.insert("CsrfToken".into(), Value::from(session.csrf_token.clone()));
    }
    data.insert("AppUrl".into(), Value::from(state.config.app_url.clone()));
    let html = state
        .renderer
        .render(template, &data)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok((status, Html(html)).into_response())
}

fn repo_names(repos: &[Repository]) -> Value {
    repos.iter().map(|repo| Value::from(repo.full_name())).collect()
}

fn user_names(users: &[User]) -> Value {
    users.iter().map(|user| Value::from(user.name.clone())).collect()
}

/// The resolved repository, which every repository route has behind a `RepoResolver`.
fn repository(ctx: &RequestContext) -> Result<Repository, AppError> {
    ctx.repository
        .clone()
        .ok_or_else(|| AppError::Internal("repository route without a resolved repository".into()))
}

fn signed_user(ctx: &RequestContext) -> Result<User, AppError> {
    ctx.user()
        .cloned()
        .ok_or_else(|| AppError::Internal("signed-in route without an identity".into()))
}

/// Only same-site paths are followed after sign-in. `//host` and absolute URLs fall
/// back to the home page.
fn local_redirect(target: Option<&str>) -> &str {
    match target {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => path,
        _ => "/",
    }
}

// --- General ---

/// `GET /`: the dashboard for signed-in users, the landing page otherwise.
pub async fn home(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user_id = ctx.user().map(|user| user.id);
    let Some(user_id) = user_id else {
        ctx.data.insert("PageIsHome".into(), Value::Bool(true));
        return page(&ctx, &state, "home");
    };

    let repos = state.store.list_repositories(user_id).await?;
    ctx.data.insert("PageIsDashboard".into(), Value::Bool(true));
    ctx.data.insert("Repositories".into(), repo_names(&repos));
    page(&ctx, &state, "user/dashboard")
}

#[derive(Debug, Default, Deserialize)]
struct ExploreQuery {
    #[serde(default)]
    q: String,
}

/// `GET /explore`: public repositories, optionally filtered by keyword.
pub async fn explore(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let query: ExploreQuery = ctx.query()?;
    let repos = state.store.search_repositories(query.q.trim(), 50).await?;

    ctx.data.insert("PageIsExplore".into(), Value::Bool(true));
    ctx.data.insert("Keyword".into(), Value::from(query.q));
    ctx.data.insert("Repositories".into(), repo_names(&repos));
    page(&ctx, &state, "explore/repos")
}

/// `GET /robots.txt`
pub async fn robots_txt(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let Some(path) = &state.config.robots_txt else {
        return Err(AppError::NotFound);
    };
    serve_file(path, ctx.method == Method::HEAD)
        .await
        .ok_or(AppError::NotFound)
}

/// `GET /avatar/:hash`: avatars are stored under `static_root/avatars/<hash>`.
pub async fn avatar(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let hash = ctx.param("hash").unwrap_or_default().to_owned();
    let path = state.config.static_root.join("avatars").join(hash);
    serve_file(&path, ctx.method == Method::HEAD)
        .await
        .ok_or(AppError::NotFound)
}

/// `GET /healthcheck`: reports whether the store answers.
pub async fn healthcheck(_: RequestContext, state: AppState) -> Result<Response, AppError> {
    match state.store.ping().await {
        Ok(()) => Ok((StatusCode::OK, "* Database connection: OK\n").into_response()),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                "* Database connection: FAILED\n",
            )
                .into_response())
        }
    }
}

// --- Sign In / Out ---

/// `GET /user/login`
pub async fn sign_in(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let redirect_to = ctx.query_value("redirect_to").unwrap_or_default();
    ctx.data.insert("Title".into(), Value::from("Sign In"));
    ctx.data.insert("RedirectTo".into(), Value::from(redirect_to));
    page(&ctx, &state, "user/auth/signin")
}

/// `POST /user/login`
///
/// On success a server-side session is created and its signed id set as the session
/// cookie. Wrong credentials re-render the form with 200, the way browsers expect.
pub async fn sign_in_post(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let form: SignInForm = ctx.read_form().await?;
    ctx.data.insert("Title".into(), Value::from("Sign In"));
    ctx.data.insert("UserName".into(), Value::from(form.user_name.clone()));

    let Some(user) = state.store.authenticate(&form.user_name, &form.password).await? else {
        tracing::debug!(login = %form.user_name, "sign-in rejected");
        ctx.data.insert("Err_UserName".into(), Value::Bool(true));
        ctx.data.insert("ErrorMsg".into(), Value::from("username or password is not correct"));
        return page(&ctx, &state, "user/auth/signin");
    };

    let session = state.sessions.create(user.id, state.config.session_ttl()).await;
    let token = sign_session(session.id, session.expires_at, &state.config.secret_key)?;
    let cookie = session_cookie(&state.config.session_cookie, &token, state.config.session_ttl_secs);
    tracing::info!(user = %user.name, "user signed in");

    let target = local_redirect(form.redirect_to.as_deref()).to_owned();
    Ok(with_cookie(Redirect::to(&target).into_response(), &cookie))
}

/// `GET /user/sign_up`: the registration page. Creating accounts belongs to the user
/// management service.
pub async fn sign_up(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    ctx.data.insert("Title".into(), Value::from("Sign Up"));
    page(&ctx, &state, "user/auth/signup")
}

/// `GET /user/logout`
pub async fn sign_out(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let session_id = ctx.session.as_ref().map(|session| session.id);
    if let Some(id) = session_id {
        state.sessions.destroy(id).await;
    }
    let cookie = expired_cookie(&state.config.session_cookie);
    Ok(with_cookie(Redirect::to("/").into_response(), &cookie))
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

// --- User Settings ---

/// `GET /user/settings`
pub async fn user_settings(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = signed_user(&ctx)?;
    ctx.data.insert("Title".into(), Value::from("Settings"));
    ctx.data.insert("FullName".into(), Value::from(user.full_name));
    ctx.data.insert("Email".into(), Value::from(user.email));
    page(&ctx, &state, "user/settings/profile")
}

async fn render_applications(
    mut ctx: RequestContext,
    state: &AppState,
    user_id: i64,
) -> Result<Response, AppError> {
    let tokens = state.store.list_access_tokens(user_id).await?;
    let tokens: Value = tokens
        .iter()
        .map(|token| json!({ "id": token.id, "name": token.name }))
        .collect();
    ctx.data.insert("Title".into(), Value::from("Applications"));
    ctx.data.insert("Tokens".into(), tokens);
    page(&ctx, state, "user/settings/applications")
}

/// `GET /user/settings/applications`
pub async fn applications(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = signed_user(&ctx)?;
    render_applications(ctx, &state, user.id).await
}

/// `POST /user/settings/applications`
///
/// Creates a token. Its secret is part of this one response and never retrievable
/// again.
pub async fn applications_post(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = signed_user(&ctx)?;
    let form: NewAccessTokenForm = ctx.read_form().await?;
    let name = form.name.trim();
    if name.is_empty() {
        ctx.data.insert("ErrorMsg".into(), Value::from("token name cannot be empty"));
        return render_applications(ctx, &state, user.id).await;
    }

    let secret = generate_token();
    match state
        .store
        .create_access_token(user.id, name, &hash_token(&secret))
        .await
    {
        Ok(token) => {
            tracing::info!(user = %user.name, token = %token.name, "access token created");
            ctx.data.insert("AccessToken".into(), Value::from(secret));
        }
        Err(StoreError::AlreadyExists(what)) => {
            ctx.data.insert("ErrorMsg".into(), Value::from(format!("{what} already exists")));
        }
        Err(e) => return Err(e.into()),
    }
    render_applications(ctx, &state, user.id).await
}

/// `POST /user/settings/applications/delete`
pub async fn applications_delete(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let user = signed_user(&ctx)?;
    let form: DeleteAccessTokenForm = ctx.read_form().await?;
    if !state.store.delete_access_token(user.id, form.id).await? {
        return Err(AppError::NotFound);
    }
    tracing::info!(user = %user.name, token_id = form.id, "access token deleted");
    Ok(Redirect::to("/user/settings/applications").into_response())
}

// --- Admin ---

/// `GET /admin`
pub async fn admin_dashboard(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let users = state.store.list_users().await?;
    let repos = state.store.list_all_repositories().await?;
    ctx.data.insert("Title".into(), Value::from("Site Administration"));
    ctx.data.insert("PageIsAdminDashboard".into(), Value::Bool(true));
    ctx.data.insert("NumUsers".into(), Value::from(users.len()));
    ctx.data.insert("NumRepos".into(), Value::from(repos.len()));
    page(&ctx, &state, "admin/dashboard")
}

/// `GET /admin/users`
pub async fn admin_users(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let users = state.store.list_users().await?;
    ctx.data.insert("PageIsAdminUsers".into(), Value::Bool(true));
    ctx.data.insert("Users".into(), user_names(&users));
    page(&ctx, &state, "admin/user/list")
}

/// `GET /admin/repos`
pub async fn admin_repos(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let repos = state.store.list_all_repositories().await?;
    ctx.data.insert("PageIsAdminRepositories".into(), Value::Bool(true));
    ctx.data.insert("Repositories".into(), repo_names(&repos));
    page(&ctx, &state, "admin/repo/list")
}

// --- Profiles ---

/// `GET /:username`
///
/// Private repositories are listed only for their owner and site administrators.
pub async fn profile(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let name = ctx.param("username").unwrap_or_default().to_owned();
    let Some(owner) = state.store.get_user_by_name(&name).await? else {
        return Err(AppError::NotFound);
    };
    let sees_private = ctx
        .user()
        .is_some_and(|viewer| viewer.is_admin || viewer.id == owner.id);

    let repos: Vec<Repository> = state
        .store
        .list_repositories(owner.id)
        .await?
        .into_iter()
        .filter(|repo| sees_private || !repo.is_private)
        .collect();

    let mut profile = Map::new();
    profile.insert("Name".into(), Value::from(owner.name.clone()));
    profile.insert("FullName".into(), Value::from(owner.full_name.clone()));
    profile.insert("AvatarHash".into(), Value::from(avatar_hash(&owner.email)));
    profile.insert("IsOrganization".into(), Value::Bool(owner.is_organization));

    ctx.data.insert("Title".into(), Value::from(owner.name));
    ctx.data.insert("Owner".into(), Value::Object(profile));
    ctx.data.insert("Repositories".into(), repo_names(&repos));
    page(&ctx, &state, "user/profile")
}

// --- Repository Settings ---

/// `GET /:username/:reponame/settings`
pub async fn repo_settings(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let repo = repository(&ctx)?;
    ctx.data.insert("Title".into(), Value::from("Settings"));
    ctx.data.insert("Description".into(), Value::from(repo.description));
    ctx.data.insert("IsPrivate".into(), Value::Bool(repo.is_private));
    page(&ctx, &state, "repo/settings/options")
}

/// `POST /:username/:reponame/settings`: updates description and visibility.
pub async fn repo_settings_post(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let repo = repository(&ctx)?;
    let form: RepoSettingsForm = ctx.read_form().await?;
    let is_private = form
        .private
        .as_deref()
        .is_some_and(|value| matches!(value, "on" | "true" | "1"));

    state
        .store
        .update_repository_settings(repo.id, form.description.trim(), is_private)
        .await?;
    tracing::info!(repo = %repo.full_name(), is_private, "repository settings updated");
    Ok(Redirect::to(&format!("/{}/settings", repo.full_name())).into_response())
}

// --- Repository Browsing ---

fn tree_path(ctx: &RequestContext) -> String {
    ctx.param("*").unwrap_or_default().trim_matches('/').to_owned()
}

/// `GET /:username/:reponame`
pub async fn repo_home(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let repo = repository(&ctx)?;
    let clone_link = format!("{}{}.git", state.config.app_url, repo.full_name());
    ctx.data.insert("Title".into(), Value::from(repo.full_name()));
    ctx.data.insert("PageIsViewCode".into(), Value::Bool(true));
    ctx.data.insert("Description".into(), Value::from(repo.description));
    ctx.data.insert("DefaultBranch".into(), Value::from(repo.default_branch));
    ctx.data.insert("CloneLink".into(), Value::from(clone_link));
    page(&ctx, &state, "repo/home")
}

/// `GET /:username/:reponame/src/*`
pub async fn repo_src(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let path = tree_path(&ctx);
    ctx.data.insert("PageIsViewCode".into(), Value::Bool(true));
    ctx.data.insert("TreePath".into(), Value::from(path));
    page(&ctx, &state, "repo/home")
}

/// `GET /:username/:reponame/raw/*`
pub async fn repo_raw(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let path = tree_path(&ctx);
    if path.is_empty() {
        return Err(AppError::NotFound);
    }
    ctx.data.insert("TreePath".into(), Value::from(path));
    ctx.data.insert("IsRaw".into(), Value::Bool(true));
    page(&ctx, &state, "repo/view_file")
}

/// `GET /:username/:reponame/commits/*`
pub async fn repo_commits(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let path = tree_path(&ctx);
    ctx.data.insert("PageIsCommits".into(), Value::Bool(true));
    ctx.data.insert("RefName".into(), Value::from(path));
    page(&ctx, &state, "repo/commits")
}

/// `GET /:username/:reponame/issues` and `.../pulls`
pub async fn repo_issues(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let is_pulls = ctx.param("type") == Some("pulls");
    let flag = if is_pulls { "PageIsPullList" } else { "PageIsIssueList" };
    ctx.data.insert(flag.into(), Value::Bool(true));
    ctx.data.insert("IsPullList".into(), Value::Bool(is_pulls));
    page(&ctx, &state, "repo/issue/list")
}

/// `GET /:username/:reponame/wiki/?:page`: no page means the wiki home.
pub async fn repo_wiki(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let name = ctx
        .param("page")
        .filter(|page| !page.is_empty())
        .unwrap_or("Home")
        .to_owned();
    ctx.data.insert("PageIsWiki".into(), Value::Bool(true));
    ctx.data.insert("PageName".into(), Value::from(name));
    page(&ctx, &state, "repo/wiki/view")
}

/// `GET /:username/:reponame/wiki/_new`
pub async fn repo_wiki_new(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    ctx.data.insert("PageIsWiki".into(), Value::Bool(true));
    ctx.data.insert("PageIsWikiNew".into(), Value::Bool(true));
    page(&ctx, &state, "repo/wiki/new")
}

/// `GET /:username/:reponame/compare/<before>...<after>`
pub async fn repo_compare(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let before = ctx.param("before").unwrap_or_default().to_owned();
    let after = ctx.param("after").unwrap_or_default().to_owned();
    ctx.data.insert("BeforeCommitID".into(), Value::from(before));
    ctx.data.insert("AfterCommitID".into(), Value::from(after));
    page(&ctx, &state, "repo/compare")
}
