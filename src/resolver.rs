use async_trait::async_trait;
use serde_json::Value;

use crate::{
    AppState,
    context::RequestContext,
    dispatcher::Middleware,
    error::{AppError, Halt, Outcome},
    models::{Permission, Repository, User},
    store::{Store, StoreError},
};

/// Folds the access sources of one caller on one repository into a single level.
///
/// Owners and site administrators hold `Owner`. Everyone else gets the best of: `Read`
/// on a public repository, the collaborator grant (capped at `Admin`) and the team
/// grant.
pub fn combine(
    is_private: bool,
    is_owner: bool,
    is_site_admin: bool,
    collaborator: Permission,
    team: Permission,
) -> Permission {
    if is_owner || is_site_admin {
        return Permission::Owner;
    }
    let public = if is_private {
        Permission::None
    } else {
        Permission::Read
    };
    public.max(collaborator.min(Permission::Admin)).max(team)
}

/// Computes `user`'s permission on `repo` from the store. Never cached.
pub async fn access_level(
    store: &dyn Store,
    user: Option<&User>,
    repo: &Repository,
) -> Result<Permission, StoreError> {
    let Some(user) = user else {
        return Ok(combine(repo.is_private, false, false, Permission::None, Permission::None));
    };
    if user.is_admin || user.id == repo.owner_id {
        return Ok(Permission::Owner);
    }
    let collaborator = store.collaborator_mode(repo.id, user.id).await?;
    let team = store.team_mode(repo.id, user.id).await?;
    Ok(combine(repo.is_private, false, false, collaborator, team))
}

/// RepoResolver
///
/// Resolves the `username`/`reponame` path parameters into the repository and the
/// caller's permission on it, and attaches both to the context.
///
/// A repository that does not exist and one the caller may not read produce the same
/// 404, so private repositories cannot be discovered. The Git variant answers anonymous
/// callers with 401 instead (still identical for both cases) so clients ask for
/// credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepoResolver {
    challenge_anonymous: bool,
}

impl RepoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_git() -> Self {
        Self {
            challenge_anonymous: true,
        }
    }

    fn hidden(&self, anonymous: bool) -> Halt {
        if self.challenge_anonymous && anonymous {
            AppError::Unauthorized.into()
        } else {
            AppError::NotFound.into()
        }
    }
}

#[async_trait]
impl Middleware for RepoResolver {
    async fn handle(&self, ctx: &mut RequestContext, state: &AppState) -> Outcome {
        let (Some(owner), Some(name)) = (ctx.param("username"), ctx.param("reponame")) else {
            return Err(AppError::NotFound.into());
        };
        let owner = owner.to_owned();
        let name = name.strip_suffix(".git").unwrap_or(name).to_owned();
        let user = ctx.user().cloned();

        let Some(repo) = state.store.get_repository(&owner, &name).await? else {
            tracing::debug!(%owner, %name, "repository not found");
            return Err(self.hidden(user.is_none()));
        };

        let permission = access_level(state.store.as_ref(), user.as_ref(), &repo).await?;
        if !permission.can_read() {
            tracing::debug!(repo = %repo.full_name(), "caller cannot read repository");
            return Err(self.hidden(user.is_none()));
        }

        ctx.data.insert("Repository".into(), Value::from(repo.full_name()));
        ctx.data.insert("IsRepositoryOwner".into(), Value::Bool(permission >= Permission::Owner));
        ctx.data.insert("IsRepositoryAdmin".into(), Value::Bool(permission.is_admin()));
        ctx.data.insert("IsRepositoryWriter".into(), Value::Bool(permission.can_write()));
        ctx.repository = Some(repo);
        ctx.permission = permission;
        Ok(())
    }
}

/// RequireRepoPermission
///
/// Threshold check on the permission a [`RepoResolver`] attached. Callers below it get
/// 403 when signed in; anonymous callers get 404 on a private repository and 401 on a
/// public one.
#[derive(Debug, Clone, Copy)]
pub struct RequireRepoPermission {
    min: Permission,
}

impl RequireRepoPermission {
    pub fn new(min: Permission) -> Self {
        Self { min }
    }
}

pub fn require_repo_admin() -> RequireRepoPermission {
    RequireRepoPermission::new(Permission::Admin)
}

pub fn require_repo_pusher() -> RequireRepoPermission {
    RequireRepoPermission::new(Permission::Write)
}

pub fn require_repo_owner() -> RequireRepoPermission {
    RequireRepoPermission::new(Permission::Owner)
}

/// The rejection for a caller whose permission is below what an operation needs.
pub fn denial(signed_in: bool, repo_is_private: bool) -> AppError {
    match (signed_in, repo_is_private) {
        (true, _) => AppError::Forbidden,
        (false, true) => AppError::NotFound,
        (false, false) => AppError::Unauthorized,
    }
}

#[async_trait]
impl Middleware for RequireRepoPermission {
    async fn handle(&self, ctx: &mut RequestContext, _: &AppState) -> Outcome {
        if ctx.permission >= self.min {
            return Ok(());
        }
        let Some(repo) = &ctx.repository else {
            return Err(AppError::NotFound.into());
        };
        tracing::debug!(
            repo = %repo.full_name(),
            have = ?ctx.permission,
            need = ?self.min,
            "repository permission below threshold"
        );
        Err(denial(ctx.is_signed_in(), repo.is_private).into())
    }
}
