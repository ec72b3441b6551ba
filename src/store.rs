use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, postgres::PgPoolOptions, query_builder::QueryBuilder};
use thiserror::Error;

use crate::{
    auth::{constant_time_eq, generate_token, hash_password, hash_token},
    models::{AccessToken, Permission, Repository, User},
};

/// StoreError
///
/// Failures of the persistence collaborator. Callers in the request path turn these
/// into an internal error; "not found" is expressed as `Ok(None)`, never as an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} already exists")]
    AlreadyExists(String),
}

/// Store Trait
///
/// The persistence operations the request pipeline and its handlers need. Lookups by
/// name are case-insensitive. Implementations must be safe for concurrent use behind
/// `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Round trip to the backing database, for the health check.
    async fn ping(&self) -> Result<(), StoreError>;

    // --- Users ---
    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
    async fn get_user_by_name(&self, name: &str) -> Result<Option<User>, StoreError>;
    /// Checks a login (user name or email) and password. Organizations never match.
    async fn authenticate(&self, login: &str, password: &str) -> Result<Option<User>, StoreError>;
    async fn search_users(&self, keyword: &str, limit: i64) -> Result<Vec<User>, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    // --- Repositories ---
    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>, StoreError>;
    async fn list_repositories(&self, owner_id: i64) -> Result<Vec<Repository>, StoreError>;
    async fn list_all_repositories(&self) -> Result<Vec<Repository>, StoreError>;
    /// Keyword search over public repositories only.
    async fn search_repositories(&self, keyword: &str, limit: i64) -> Result<Vec<Repository>, StoreError>;
    async fn update_repository_settings(
        &self,
        id: i64,
        description: &str,
        is_private: bool,
    ) -> Result<(), StoreError>;
    async fn delete_repository(&self, id: i64) -> Result<bool, StoreError>;

    // --- Access grants ---
    /// Explicit collaborator grant of `user_id` on `repo_id`.
    async fn collaborator_mode(&self, repo_id: i64, user_id: i64) -> Result<Permission, StoreError>;
    /// Highest grant `user_id` receives through team membership.
    async fn team_mode(&self, repo_id: i64, user_id: i64) -> Result<Permission, StoreError>;

    // --- Access tokens ---
    async fn get_access_token_by_hash(&self, hash: &str) -> Result<Option<AccessToken>, StoreError>;
    async fn list_access_tokens(&self, uid: i64) -> Result<Vec<AccessToken>, StoreError>;
    async fn create_access_token(&self, uid: i64, name: &str, hash: &str) -> Result<AccessToken, StoreError>;
    /// Deletes one of `uid`'s tokens. Returns false if no such token belongs to `uid`.
    async fn delete_access_token(&self, uid: i64, id: i64) -> Result<bool, StoreError>;
}

/// StoreState
///
/// The shared handle to the persistence layer held in `AppState`.
pub type StoreState = Arc<dyn Store>;

fn password_matches(user: &User, password: &str) -> bool {
    !user.passwd_hash.is_empty()
        && constant_time_eq(
            hash_password(&user.salt, password).as_bytes(),
            user.passwd_hash.as_bytes(),
        )
}

// --- PostgreSQL ---

const USER_COLUMNS: &str = "id, name, full_name, email, passwd_hash, salt, is_admin, is_active, \
                            is_organization, created_at";

const REPO_SELECT: &str = "SELECT r.id, r.owner_id, u.name AS owner_name, r.name, r.description, \
                           r.is_private, r.default_branch, r.created_at \
                           FROM repositories r JOIN users u ON u.id = r.owner_id";

/// PostgresStore
///
/// `Store` backed by PostgreSQL through a `PgPool`. The schema lives in `migrations/`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

/// `%keyword%` for ILIKE, with the pattern characters in `keyword` matched literally.
fn like_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl Store for PostgresStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_user_by_name(&self, name: &str) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(name) = LOWER($1)");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<Option<User>, StoreError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE (LOWER(name) = LOWER($1) OR LOWER(email) = LOWER($1)) AND NOT is_organization"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user.filter(|u| password_matches(u, password)))
    }

    /// Uses QueryBuilder so the keyword is always bound, never interpolated.
    async fn search_users(&self, keyword: &str, limit: i64) -> Result<Vec<User>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {USER_COLUMNS} FROM users WHERE NOT is_organization"));
        if !keyword.is_empty() {
            let pattern = like_pattern(keyword);
            builder.push(" AND (name ILIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" ESCAPE '\\' OR full_name ILIKE ");
            builder.push_bind(pattern);
            builder.push(" ESCAPE '\\')");
        }
        builder.push(" ORDER BY name LIMIT ");
        builder.push_bind(limit);

        Ok(builder.build_query_as::<User>().fetch_all(&self.pool).await?)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY id");
        Ok(sqlx::query_as::<_, User>(&sql).fetch_all(&self.pool).await?)
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>, StoreError> {
        let sql = format!("{REPO_SELECT} WHERE LOWER(u.name) = LOWER($1) AND LOWER(r.name) = LOWER($2)");
        Ok(sqlx::query_as::<_, Repository>(&sql)
            .bind(owner)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_repositories(&self, owner_id: i64) -> Result<Vec<Repository>, StoreError> {
        let sql = format!("{REPO_SELECT} WHERE r.owner_id = $1 ORDER BY r.name");
        Ok(sqlx::query_as::<_, Repository>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_all_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let sql = format!("{REPO_SELECT} ORDER BY r.id");
        Ok(sqlx::query_as::<_, Repository>(&sql).fetch_all(&self.pool).await?)
    }

    async fn search_repositories(&self, keyword: &str, limit: i64) -> Result<Vec<Repository>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("{REPO_SELECT} WHERE NOT r.is_private"));
        if !keyword.is_empty() {
            builder.push(" AND r.name ILIKE ");
            builder.push_bind(like_pattern(keyword));
            builder.push(" ESCAPE '\\'");
        }
        builder.push(" ORDER BY r.name LIMIT ");
        builder.push_bind(limit);

        Ok(builder
            .build_query_as::<Repository>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_repository_settings(
        &self,
        id: i64,
        description: &str,
        is_private: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE repositories SET description = $1, is_private = $2 WHERE id = $3")
            .bind(description)
            .bind(is_private)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_repository(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn collaborator_mode(&self, repo_id: i64, user_id: i64) -> Result<Permission, StoreError> {
        let mode: Option<i16> =
            sqlx::query_scalar("SELECT mode FROM collaborations WHERE repo_id = $1 AND user_id = $2")
                .bind(repo_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(mode.map_or(Permission::None, Permission::from_mode))
    }

    async fn team_mode(&self, repo_id: i64, user_id: i64) -> Result<Permission, StoreError> {
        let mode: Option<i16> = sqlx::query_scalar(
            "SELECT MAX(t.authorize) FROM teams t \
             JOIN team_users tu ON tu.team_id = t.id \
             JOIN team_repos tr ON tr.team_id = t.id \
             WHERE tr.repo_id = $1 AND tu.user_id = $2",
        )
        .bind(repo_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(mode.map_or(Permission::None, Permission::from_mode))
    }

    async fn get_access_token_by_hash(&self, hash: &str) -> Result<Option<AccessToken>, StoreError> {
        Ok(sqlx::query_as::<_, AccessToken>(
            "SELECT id, uid, name, token_hash, created_at FROM access_tokens WHERE token_hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list_access_tokens(&self, uid: i64) -> Result<Vec<AccessToken>, StoreError> {
        Ok(sqlx::query_as::<_, AccessToken>(
            "SELECT id, uid, name, token_hash, created_at FROM access_tokens WHERE uid = $1 ORDER BY id",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_access_token(&self, uid: i64, name: &str, hash: &str) -> Result<AccessToken, StoreError> {
        let inserted = sqlx::query_as::<_, AccessToken>(
            "INSERT INTO access_tokens (uid, name, token_hash) VALUES ($1, $2, $3) \
             RETURNING id, uid, name, token_hash, created_at",
        )
        .bind(uid)
        .bind(name)
        .bind(hash)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(token) => Ok(token),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(format!("access token \"{name}\"")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_access_token(&self, uid: i64, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM access_tokens WHERE id = $1 AND uid = $2")
            .bind(id)
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// --- In-memory ---

#[derive(Default)]
struct MemoryData {
    users: Vec<User>,
    repositories: Vec<Repository>,
    collaborators: HashMap<(i64, i64), Permission>,
    team_grants: HashMap<(i64, i64), Permission>,
    tokens: Vec<AccessToken>,
    next_id: i64,
}

impl MemoryData {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// MemoryStore
///
/// `Store` kept in process memory. Used when no database is configured in local mode
/// and as the fixture store in tests; the `add_*` methods seed it.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, name: &str, email: &str, password: &str, is_admin: bool) -> User {
        let mut data = self.write();
        let salt = generate_token();
        let user = User {
            id: data.next_id(),
            name: name.to_owned(),
            full_name: String::new(),
            email: email.to_owned(),
            passwd_hash: hash_password(&salt, password),
            salt,
            is_admin,
            is_active: true,
            is_organization: false,
            created_at: Utc::now(),
        };
        data.users.push(user.clone());
        user
    }

    pub fn set_active(&self, user_id: i64, active: bool) {
        let mut data = self.write();
        if let Some(user) = data.users.iter_mut().find(|u| u.id == user_id) {
            user.is_active = active;
        }
    }

    pub fn add_repository(&self, owner: &User, name: &str, is_private: bool) -> Repository {
        let mut data = self.write();
        let repo = Repository {
            id: data.next_id(),
            owner_id: owner.id,
            owner_name: owner.name.clone(),
            name: name.to_owned(),
            description: String::new(),
            is_private,
            default_branch: "master".to_owned(),
            created_at: Utc::now(),
        };
        data.repositories.push(repo.clone());
        repo
    }

    pub fn add_collaborator(&self, repo_id: i64, user_id: i64, permission: Permission) {
        self.write().collaborators.insert((repo_id, user_id), permission);
    }

    pub fn add_team_grant(&self, repo_id: i64, user_id: i64, permission: Permission) {
        let mut data = self.write();
        let grant = data.team_grants.entry((repo_id, user_id)).or_default();
        *grant = (*grant).max(permission);
    }

    /// Stores a token for `uid` whose plaintext secret is `secret`.
    pub fn add_access_token(&self, uid: i64, name: &str, secret: &str) -> AccessToken {
        let mut data = self.write();
        let token = AccessToken {
            id: data.next_id(),
            uid,
            name: name.to_owned(),
            token_hash: hash_token(secret),
            created_at: Utc::now(),
        };
        data.tokens.push(token.clone());
        token
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn limit_of(limit: i64) -> usize {
    usize::try_from(limit).unwrap_or(0)
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.read().users.iter().find(|u| u.id == id).cloned())
    }

    async fn get_user_by_name(&self, name: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .read()
            .users
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .read()
            .users
            .iter()
            .find(|u| {
                !u.is_organization
                    && (u.name.eq_ignore_ascii_case(login) || u.email.eq_ignore_ascii_case(login))
            })
            .filter(|u| password_matches(u, password))
            .cloned())
    }

    async fn search_users(&self, keyword: &str, limit: i64) -> Result<Vec<User>, StoreError> {
        let mut found: Vec<User> = self
            .read()
            .users
            .iter()
            .filter(|u| !u.is_organization)
            .filter(|u| contains_ignore_case(&u.name, keyword) || contains_ignore_case(&u.full_name, keyword))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found.truncate(limit_of(limit));
        Ok(found)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.read().users.clone())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>, StoreError> {
        Ok(self
            .read()
            .repositories
            .iter()
            .find(|r| r.owner_name.eq_ignore_ascii_case(owner) && r.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list_repositories(&self, owner_id: i64) -> Result<Vec<Repository>, StoreError> {
        let mut repos: Vec<Repository> = self
            .read()
            .repositories
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    async fn list_all_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        Ok(self.read().repositories.clone())
    }

    async fn search_repositories(&self, keyword: &str, limit: i64) -> Result<Vec<Repository>, StoreError> {
        let mut repos: Vec<Repository> = self
            .read()
            .repositories
            .iter()
            .filter(|r| !r.is_private && contains_ignore_case(&r.name, keyword))
            .cloned()
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos.truncate(limit_of(limit));
        Ok(repos)
    }

    async fn update_repository_settings(
        &self,
        id: i64,
        description: &str,
        is_private: bool,
    ) -> Result<(), StoreError> {
        let mut data = self.write();
        if let Some(repo) = data.repositories.iter_mut().find(|r| r.id == id) {
            repo.description = description.to_owned();
            repo.is_private = is_private;
        }
        Ok(())
    }

    async fn delete_repository(&self, id: i64) -> Result<bool, StoreError> {
        let mut data = self.write();
        let before = data.repositories.len();
        data.repositories.retain(|r| r.id != id);
        data.collaborators.retain(|(repo_id, _), _| *repo_id != id);
        data.team_grants.retain(|(repo_id, _), _| *repo_id != id);
        Ok(data.repositories.len() < before)
    }

    async fn collaborator_mode(&self, repo_id: i64, user_id: i64) -> Result<Permission, StoreError> {
        Ok(self
            .read()
            .collaborators
            .get(&(repo_id, user_id))
            .copied()
            .unwrap_or_default())
    }

    async fn team_mode(&self, repo_id: i64, user_id: i64) -> Result<Permission, StoreError> {
        Ok(self
            .read()
            .team_grants
            .get(&(repo_id, user_id))
            .copied()
            .unwrap_or_default())
    }

    async fn get_access_token_by_hash(&self, hash: &str) -> Result<Option<AccessToken>, StoreError> {
        Ok(self
            .read()
            .tokens
            .iter()
            .find(|t| constant_time_eq(t.token_hash.as_bytes(), hash.as_bytes()))
            .cloned())
    }

    async fn list_access_tokens(&self, uid: i64) -> Result<Vec<AccessToken>, StoreError> {
        Ok(self
            .read()
            .tokens
            .iter()
            .filter(|t| t.uid == uid)
            .cloned()
            .collect())
    }

    async fn create_access_token(&self, uid: i64, name: &str, hash: &str) -> Result<AccessToken, StoreError> {
        let mut data = self.write();
        if data.tokens.iter().any(|t| t.uid == uid && t.name == name) {
            return Err(StoreError::AlreadyExists(format!("access token \"{name}\"")));
        }
        let token = AccessToken {
            id: data.next_id(),
            uid,
            name: name.to_owned(),
            token_hash: hash.to_owned(),
            created_at: Utc::now(),
        };
        data.tokens.push(token.clone());
        Ok(token)
    }

    async fn delete_access_token(&self, uid: i64, id: i64) -> Result<bool, StoreError> {
        let mut data = self.write();
        let before = data.tokens.len();
        data.tokens.retain(|t| !(t.id == id && t.uid == uid));
        Ok(data.tokens.len() < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authenticate_checks_salted_password() {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", "alice@example.com", "wonderland", false);

        let by_name = store.authenticate("Alice", "wonderland").await.unwrap();
        assert_eq!(by_name.map(|u| u.id), Some(alice.id));
        let by_email = store.authenticate("alice@example.com", "wonderland").await.unwrap();
        assert!(by_email.is_some());
        assert!(store.authenticate("alice", "wrong").await.unwrap().is_none());
        assert!(store.authenticate("nobody", "wonderland").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repository_lookup_ignores_case() {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", "a@example.com", "pw", false);
        store.add_repository(&alice, "MyRepo", false);

        let found = store.get_repository("ALICE", "myrepo").await.unwrap();
        assert_eq!(found.map(|r| r.name), Some("MyRepo".to_owned()));
    }

    #[tokio::test]
    async fn search_hides_private_repositories() {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", "a@example.com", "pw", false);
        store.add_repository(&alice, "public-one", false);
        store.add_repository(&alice, "private-one", true);

        let found = store.search_repositories("one", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "public-one");
    }

    #[test]
    fn like_pattern_matches_wildcards_literally() {
        assert_eq!(like_pattern("repo"), "%repo%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("c:\\x"), "%c:\\\\x%");
    }

    #[tokio::test]
    async fn memory_search_treats_wildcards_as_text() {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", "a@example.com", "pw", false);
        store.add_repository(&alice, "a_b", false);
        store.add_repository(&alice, "axb", false);

        let found = store.search_repositories("a_b", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a_b");
    }

    #[tokio::test]
    async fn tokens_are_scoped_to_their_owner() {
        let store = MemoryStore::new();
        let alice = store.add_user("alice", "a@example.com", "pw", false);
        let bob = store.add_user("bob", "b@example.com", "pw", false);

        let token = store
            .create_access_token(alice.id, "ci", &hash_token("s3cret"))
            .await
            .unwrap();
        assert!(matches!(
            store.create_access_token(alice.id, "ci", "other").await,
            Err(StoreError::AlreadyExists(_))
        ));

        let found = store.get_access_token_by_hash(&hash_token("s3cret")).await.unwrap();
        assert_eq!(found.map(|t| t.uid), Some(alice.id));

        assert!(!store.delete_access_token(bob.id, token.id).await.unwrap());
        assert!(store.delete_access_token(alice.id, token.id).await.unwrap());
        assert!(store.list_access_tokens(alice.id).await.unwrap().is_empty());
    }
}
