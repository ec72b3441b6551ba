#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use gitward::{
    AppConfig, AppState, MemoryStore,
    git::{GitBackend, GitError, GitOutput, GitService, GitState, PostReceiveHook},
    models::{Permission, Repository, User},
    store::StoreState,
};
use tokio::sync::oneshot;
use tower::ServiceExt;

pub const PASSWORD: &str = "correct-horse";

// --- Collaborator doubles ---

/// GitBackend double: counts spawns and answers with canned output.
#[derive(Default)]
pub struct MockGit {
    spawns: AtomicUsize,
    pub last_input: Mutex<Vec<u8>>,
    pub last_path: Mutex<Option<PathBuf>>,
}

impl MockGit {
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn finished(&self, path: &Path, body: &'static str) -> GitOutput {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        *self.last_path.lock().unwrap() = Some(path.to_path_buf());
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        GitOutput {
            body: Body::from(body),
            done: rx,
        }
    }
}

#[async_trait]
impl GitBackend for MockGit {
    async fn advertise_refs(&self, repo_path: &Path, _: GitService) -> Result<GitOutput, GitError> {
        Ok(self.finished(repo_path, "003fabc refs/heads/master\n0000"))
    }

    async fn stateless_rpc(
        &self,
        repo_path: &Path,
        _: GitService,
        input: Body,
    ) -> Result<GitOutput, GitError> {
        let bytes = axum::body::to_bytes(input, usize::MAX)
            .await
            .map_err(|e| GitError::Io(std::io::Error::other(e.to_string())))?;
        *self.last_input.lock().unwrap() = bytes.to_vec();
        Ok(self.finished(repo_path, "PACK-RESULT"))
    }
}

/// Post-receive hook double recording `owner/repo:pusher`.
#[derive(Default)]
pub struct RecordingHook {
    pub pushes: Mutex<Vec<String>>,
}

#[async_trait]
impl PostReceiveHook for RecordingHook {
    async fn post_receive(&self, repo: &Repository, pusher: Option<&User>) {
        let pusher = pusher.map(|u| u.name.clone()).unwrap_or_default();
        self.pushes
            .lock()
            .unwrap()
            .push(format!("{}:{}", repo.full_name(), pusher));
    }
}

// --- Fixture ---

/// The assembled app over an in-memory store seeded with:
/// - `alice` owning `alice/public-repo` and `alice/private-repo`
/// - `bob`, a read collaborator on `alice/public-repo`
/// - `carol`, a write collaborator on `alice/private-repo` through a team
/// - `root`, a site administrator
pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub git: Arc<MockGit>,
    pub hooks: Arc<RecordingHook>,
    pub alice: User,
    pub bob: User,
    pub carol: User,
    pub root: User,
    pub public_repo: Repository,
    pub private_repo: Repository,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig {
            disable_router_log: true,
            static_root: PathBuf::from("target/gitward-test-no-static"),
            ..AppConfig::default()
        };
        configure(&mut config);

        let store = Arc::new(MemoryStore::new());
        let alice = store.add_user("alice", "alice@example.com", PASSWORD, false);
        let bob = store.add_user("bob", "bob@example.com", PASSWORD, false);
        let carol = store.add_user("carol", "carol@example.com", PASSWORD, false);
        let root = store.add_user("root", "root@example.com", PASSWORD, true);
        let public_repo = store.add_repository(&alice, "public-repo", false);
        let private_repo = store.add_repository(&alice, "private-repo", true);
        store.add_collaborator(public_repo.id, bob.id, Permission::Read);
        store.add_team_grant(private_repo.id, carol.id, Permission::Write);

        let git = Arc::new(MockGit::default());
        let hooks = Arc::new(RecordingHook::default());
        let state = AppState::new(config, store.clone() as StoreState)
            .with_git(git.clone())
            .with_hooks(hooks.clone());
        let app = gitward::create_app(state.clone());

        Self {
            app,
            state,
            store,
            git,
            hooks,
            alice,
            bob,
            carol,
            root,
            public_repo,
            private_repo,
        }
    }

    /// Swaps the git backend, e.g. for a `GitCommand` running a script.
    pub fn with_git_backend(mut self, git: GitState) -> Self {
        self.state = self.state.clone().with_git(git);
        self.app = gitward::create_app(self.state.clone());
        self
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    /// Signs in through the login form and returns the `Cookie` header value.
    pub async fn sign_in(&self, user: &User) -> String {
        let form = format!("user_name={}&password={}", user.name, PASSWORD);
        let response = self
            .send(
                Request::post("/user/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(form))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), 303, "sign-in failed for {}", user.name);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("session cookie")
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_owned()
    }

    /// The CSRF token of the session behind `cookie`, as the pages expose it.
    pub async fn csrf_token(&self, cookie: &str) -> String {
        let response = self
            .send(
                Request::get("/user/settings")
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        let html = body_string(response).await;
        data_value(&html, "CsrfToken").expect("csrf token on page")
    }

    /// Waits for the post-receive hook, which runs after the response was sent.
    pub async fn wait_for_push(&self) -> Vec<String> {
        for _ in 0..100 {
            let pushes = self.hooks.pushes.lock().unwrap().clone();
            if !pushes.is_empty() {
                return pushes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }
}

// --- Request/Response helpers ---

pub fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// A value the HTML renderer printed for `key`.
pub fn data_value(html: &str, key: &str) -> Option<String> {
    let marker = format!("<dt>{key}</dt><dd>");
    let start = html.find(&marker)? + marker.len();
    let end = html[start..].find("</dd>")? + start;
    Some(html[start..end].to_owned())
}

pub fn template_of(html: &str) -> Option<&str> {
    let marker = "data-template=\"";
    let start = html.find(marker)? + marker.len();
    let end = html[start..].find('"')? + start;
    Some(&html[start..end])
}

pub fn location(response: &Response<Body>) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}
