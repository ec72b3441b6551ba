use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::{Path, PathBuf};
use ts_rs::TS;
use utoipa::ToSchema;

// --- Core Records (handed to the core by the persistence layer) ---

/// User
///
/// An account as the persistence layer returns it. Organizations are users with
/// `is_organization` set; they own repositories but never sign in.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub email: String,
    // Salted SHA-256 of the password, hex encoded. Never serialized.
    #[serde(skip_serializing, default)]
    pub passwd_hash: String,
    #[serde(skip_serializing, default)]
    pub salt: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub is_organization: bool,
    pub created_at: DateTime<Utc>,
}

/// Repository
///
/// A hosted repository together with its owner's name (loaded through a join), which
/// is what the `{owner}/{repo}` path segments resolve against.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct Repository {
    pub id: i64,
    pub owner_id: i64,
    pub owner_name: String,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner_name, self.name)
    }

    /// Location of the bare repository on disk: `<root>/<owner>/<name>.git`, lowercased.
    pub fn disk_path(&self, root: &Path) -> PathBuf {
        root.join(self.owner_name.to_lowercase())
            .join(format!("{}.git", self.name.to_lowercase()))
    }
}

/// AccessToken
///
/// A personal API credential. Only the SHA-256 of the secret is stored; the secret
/// itself is shown to the owner once at creation. Tokens are never mutated and carry
/// the full privileges of their owner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct AccessToken {
    pub id: i64,
    pub uid: i64,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Permission
///
/// The ordered access level a caller holds on one repository. Computed fresh for every
/// request and never persisted; the derive order is the ordering used for threshold
/// checks (`None < Read < Write < Admin < Owner`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
    TS, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Permission {
    #[default]
    None,
    Read,
    Write,
    Admin,
    Owner,
}

impl Permission {
    /// Maps the numeric grant stored for collaborators and teams.
    pub fn from_mode(mode: i16) -> Self {
        match mode {
            i16::MIN..=0 => Permission::None,
            1 => Permission::Read,
            2 => Permission::Write,
            3 => Permission::Admin,
            _ => Permission::Owner,
        }
    }

    pub fn mode(self) -> i16 {
        match self {
            Permission::None => 0,
            Permission::Read => 1,
            Permission::Write => 2,
            Permission::Admin => 3,
            Permission::Owner => 4,
        }
    }

    pub fn can_read(self) -> bool {
        self >= Permission::Read
    }

    pub fn can_write(self) -> bool {
        self >= Permission::Write
    }

    pub fn is_admin(self) -> bool {
        self >= Permission::Admin
    }
}

// --- Form Payloads (bound from request bodies) ---

/// SignInForm
///
/// The browser sign-in form (POST /user/login, url-encoded).
#[derive(Debug, Clone, Deserialize)]
pub struct SignInForm {
    pub user_name: String,
    pub password: String,
    #[serde(default)]
    pub redirect_to: Option<String>,
}

/// NewAccessTokenForm
///
/// Creates a token from the browser settings page.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAccessTokenForm {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteAccessTokenForm {
    pub id: i64,
}

/// RepoSettingsForm
///
/// Updates the mutable repository options from the settings page.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoSettingsForm {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub private: Option<String>,
}

// --- API v1 Schemas ---

/// MarkdownForm
///
/// Input for POST /api/v1/markdown. `mode` is either `gfm` or anything else for plain
/// CommonMark; `context` is the repository the document belongs to, when any.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct MarkdownForm {
    pub text: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub context: String,
}

/// CreateAccessTokenOption
///
/// Input for POST /api/v1/users/{username}/tokens.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct CreateAccessTokenOption {
    pub name: String,
}

/// ApiAccessToken
///
/// A token as the API lists it. `token` is only populated in the creation response.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ApiAccessToken {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

impl From<AccessToken> for ApiAccessToken {
    fn from(token: AccessToken) -> Self {
        Self {
            id: token.id,
            name: token.name,
            token: None,
            created_at: token.created_at,
        }
    }
}

/// ApiUser
///
/// Public view of an account. The email is only filled in for signed-in callers.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ApiUser {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub avatar_url: String,
}

impl ApiUser {
    pub fn from_user(user: &User, app_url: &str, show_email: bool) -> Self {
        Self {
            id: user.id,
            username: user.name.clone(),
            full_name: user.full_name.clone(),
            email: show_email.then(|| user.email.clone()),
            avatar_url: format!("{}avatar/{}", app_url, avatar_hash(&user.email)),
        }
    }
}

/// ApiPermission
///
/// The caller's effective rights on a repository, flattened for API clients.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct ApiPermission {
    pub admin: bool,
    pub push: bool,
    pub pull: bool,
}

impl From<Permission> for ApiPermission {
    fn from(permission: Permission) -> Self {
        Self {
            admin: permission.is_admin(),
            push: permission.can_write(),
            pull: permission.can_read(),
        }
    }
}

/// ApiRepository
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ApiRepository {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub description: String,
    pub private: bool,
    pub html_url: String,
    pub clone_url: String,
    pub permissions: ApiPermission,
}

impl ApiRepository {
    pub fn from_repo(repo: &Repository, app_url: &str, permission: Permission) -> Self {
        let html_url = format!("{}{}", app_url, repo.full_name());
        Self {
            id: repo.id,
            owner: repo.owner_name.clone(),
            name: repo.name.clone(),
            full_name: repo.full_name(),
            description: repo.description.clone(),
            private: repo.is_private,
            clone_url: format!("{html_url}.git"),
            html_url,
            permissions: permission.into(),
        }
    }
}

/// SearchResults
///
/// Envelope used by the search endpoints: `{"ok": true, "data": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults<T> {
    pub ok: bool,
    pub data: Vec<T>,
}

/// ApiErrorBody
///
/// The JSON body every API error carries.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ApiErrorBody {
    pub code: u16,
    pub message: String,
}

/// Gravatar-style avatar key: hex SHA-256 of the trimmed, lowercased email.
pub fn avatar_hash(email: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(email.trim().to_lowercase().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_ordering_matches_access_levels() {
        assert!(Permission::None < Permission::Read);
        assert!(Permission::Read < Permission::Write);
        assert!(Permission::Write < Permission::Admin);
        assert!(Permission::Admin < Permission::Owner);
        assert_eq!(Permission::default(), Permission::None);
    }

    #[test]
    fn permission_modes_map_both_ways() {
        for permission in [
            Permission::None,
            Permission::Read,
            Permission::Write,
            Permission::Admin,
            Permission::Owner,
        ] {
            assert_eq!(Permission::from_mode(permission.mode()), permission);
        }
        assert_eq!(Permission::from_mode(-3), Permission::None);
        assert_eq!(Permission::from_mode(9), Permission::Owner);
    }

    #[test]
    fn api_permission_flattens_levels() {
        let read = ApiPermission::from(Permission::Read);
        assert!(read.pull && !read.push && !read.admin);
        let admin = ApiPermission::from(Permission::Admin);
        assert!(admin.pull && admin.push && admin.admin);
    }

    #[test]
    fn disk_path_is_lowercased_bare_repo() {
        let repo = Repository {
            owner_name: "Alice".into(),
            name: "MyRepo".into(),
            ..Default::default()
        };
        assert_eq!(
            repo.disk_path(Path::new("/data/repos")),
            PathBuf::from("/data/repos/alice/myrepo.git")
        );
    }
}
