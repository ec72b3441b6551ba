use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::{ExitStatus, Stdio},
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::{Body, BodyDataStream, Bytes},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt, stream};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::oneshot,
    task::JoinHandle,
    time::Sleep,
};
use tokio_util::io::ReaderStream;

use crate::{
    AppState,
    context::{RequestContext, Surface},
    dispatcher::Middleware,
    error::{AppError, Outcome, git_error},
    models::{Permission, Repository, User},
};

/// Stderr kept from a failing git process for the log line.
const STDERR_LIMIT: usize = 8 * 1024;

// --- Services ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    /// Serves objects to a fetching client.
    UploadPack,
    /// Accepts objects pushed by a client.
    ReceivePack,
}

impl GitService {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(GitService::UploadPack),
            "git-receive-pack" => Some(GitService::ReceivePack),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::ReceivePack => "git-receive-pack",
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::ReceivePack => "receive-pack",
        }
    }

    /// Fetching needs Read, pushing needs Write.
    pub fn required_permission(self) -> Permission {
        match self {
            GitService::UploadPack => Permission::Read,
            GitService::ReceivePack => Permission::Write,
        }
    }
}

/// Frames one pkt-line: four hex digits of total length, then the payload.
pub fn pkt_line(payload: &str) -> String {
    format!("{:04x}{payload}", payload.len() + 4)
}

/// The smart-HTTP preamble in front of a ref advertisement.
pub fn advertisement_preamble(service: GitService) -> String {
    format!("{}0000", pkt_line(&format!("# service={}\n", service.name())))
}

// --- Backend ---

/// GitError
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git {service}: {source}")]
    Spawn {
        service: &'static str,
        source: io::Error,
    },
    #[error("git {service} exited with {status}: {stderr}")]
    Exit {
        service: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("git {service} did not finish within {secs}s")]
    Timeout { service: &'static str, secs: u64 },
    #[error("client went away before git {0} finished")]
    Cancelled(&'static str),
    #[error("i/o error talking to git: {0}")]
    Io(#[from] io::Error),
}

/// GitOutput
///
/// A running git operation: the stdout stream to send back and a channel resolved once
/// the process has exited (or was killed).
pub struct GitOutput {
    pub body: Body,
    pub done: oneshot::Receiver<Result<(), GitError>>,
}

/// GitBackend
///
/// Executes the pack protocol for one repository on disk. The response body owns the
/// process: dropping it must terminate the process.
#[async_trait]
pub trait GitBackend: Send + Sync {
    async fn advertise_refs(&self, repo_path: &Path, service: GitService) -> Result<GitOutput, GitError>;
    async fn stateless_rpc(
        &self,
        repo_path: &Path,
        service: GitService,
        input: Body,
    ) -> Result<GitOutput, GitError>;
}

pub type GitState = Arc<dyn GitBackend>;

/// GitCommand
///
/// `GitBackend` running the `git` binary in `--stateless-rpc` mode.
#[derive(Debug, Clone)]
pub struct GitCommand {
    binary: PathBuf,
    timeout: Duration,
}

impl GitCommand {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn spawn(&self, repo_path: &Path, service: GitService, advertise: bool) -> Result<Child, GitError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(service.subcommand()).arg("--stateless-rpc");
        if advertise {
            cmd.arg("--advertise-refs");
        }
        cmd.arg(repo_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if advertise { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(service = service.name(), repo = %repo_path.display(), advertise, "spawning git");
        cmd.spawn().map_err(|source| GitError::Spawn {
            service: service.name(),
            source,
        })
    }

    fn stream(&self, mut child: Child, service: GitService) -> Result<GitOutput, GitError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GitError::Io(io::Error::other("git stdout was not captured")))?;
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(collect_stderr(pipe)));
        let (done_tx, done_rx) = oneshot::channel();

        let stream = ChildStream {
            stdout: ReaderStream::new(stdout),
            child: Some(child),
            stderr,
            deadline: Box::pin(tokio::time::sleep(self.timeout)),
            timeout: self.timeout,
            done: Some(done_tx),
            service,
        };
        Ok(GitOutput {
            body: Body::from_stream(stream),
            done: done_rx,
        })
    }
}

#[async_trait]
impl GitBackend for GitCommand {
    async fn advertise_refs(&self, repo_path: &Path, service: GitService) -> Result<GitOutput, GitError> {
        let child = self.spawn(repo_path, service, true)?;
        self.stream(child, service)
    }

    async fn stateless_rpc(
        &self,
        repo_path: &Path,
        service: GitService,
        input: Body,
    ) -> Result<GitOutput, GitError> {
        let mut child = self.spawn(repo_path, service, false)?;
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed_stdin(stdin, input));
        }
        self.stream(child, service)
    }
}

/// Copies the request body into the process as it arrives. Ends quietly when either
/// side goes away; the exit status tells the real story.
async fn feed_stdin(mut stdin: ChildStdin, input: Body) {
    let mut chunks = input.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "request body ended early");
                return;
            }
        };
        if let Err(e) = stdin.write_all(&chunk).await {
            tracing::debug!(error = %e, "git closed stdin");
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn collect_stderr(pipe: impl AsyncRead + Unpin) -> String {
    let mut kept = Vec::new();
    let _ = pipe.take(STDERR_LIMIT as u64).read_to_end(&mut kept).await;
    String::from_utf8_lossy(&kept).trim().to_owned()
}

/// ChildStream
///
/// The process's stdout as a response body stream. It owns the child: when stdout ends
/// the exit status is collected in the background; when the deadline passes or the
/// stream is dropped early, the child is killed and reaped.
struct ChildStream {
    stdout: ReaderStream<tokio::process::ChildStdout>,
    child: Option<Child>,
    stderr: Option<JoinHandle<String>>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    done: Option<oneshot::Sender<Result<(), GitError>>>,
    service: GitService,
}

impl ChildStream {
    fn finish(&mut self) {
        let (Some(mut child), Some(done)) = (self.child.take(), self.done.take()) else {
            return;
        };
        let stderr = self.stderr.take();
        let service = self.service.name();

        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => {
                    let stderr = match stderr {
                        Some(handle) => handle.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    Err(GitError::Exit {
                        service,
                        status,
                        stderr,
                    })
                }
                Err(e) => Err(GitError::Io(e)),
            };
            if let Err(e) = &result {
                tracing::warn!(error = %e, "git process failed");
            }
            let _ = done.send(result);
        });
    }

    fn abort(&mut self, reason: GitError) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = child.wait().await;
                });
            }
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
        if let Some(done) = self.done.take() {
            tracing::warn!(error = %reason, "git process terminated");
            let _ = done.send(Err(reason));
        }
    }
}

impl Stream for ChildStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.child.is_none() {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            let service = this.service.name();
            let secs = this.timeout.as_secs();
            this.abort(GitError::Timeout { service, secs });
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("git {service} timed out"),
            ))));
        }

        match Pin::new(&mut this.stdout).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Err(e))) => {
                let copy = io::Error::new(e.kind(), e.to_string());
                this.abort(GitError::Io(e));
                Poll::Ready(Some(Err(copy)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.abort(GitError::Cancelled(self.service.name()));
        }
    }
}

// --- Post-receive ---

/// PostReceiveHook
///
/// Side effects of a successful push (feeds, webhooks, caches). Runs after the pack has
/// been accepted and never affects the push response.
#[async_trait]
pub trait PostReceiveHook: Send + Sync {
    async fn post_receive(&self, repo: &Repository, pusher: Option<&User>);
}

pub type HookState = Arc<dyn PostReceiveHook>;

/// Default hook: records the push in the log.
#[derive(Debug, Default)]
pub struct LogHook;

#[async_trait]
impl PostReceiveHook for LogHook {
    async fn post_receive(&self, repo: &Repository, pusher: Option<&User>) {
        tracing::info!(
            repo = %repo.full_name(),
            pusher = pusher.map(|u| u.name.as_str()).unwrap_or("anonymous"),
            "push received"
        );
    }
}

// --- Handlers ---

/// Marks requests of the Git group so errors are rendered for git clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitRequest;

#[async_trait]
impl Middleware for GitRequest {
    async fn handle(&self, ctx: &mut RequestContext, _: &AppState) -> Outcome {
        ctx.surface = Surface::Git;
        Ok(())
    }
}

/// Permission check done before anything is spawned.
fn authorize(ctx: &RequestContext, service: GitService) -> Result<Repository, AppError> {
    let repo = ctx
        .repository
        .clone()
        .ok_or_else(|| AppError::Internal("git route without a resolved repository".into()))?;
    if ctx.permission >= service.required_permission() {
        return Ok(repo);
    }
    tracing::debug!(
        repo = %repo.full_name(),
        service = service.name(),
        have = ?ctx.permission,
        "git operation denied"
    );
    Err(if ctx.is_signed_in() {
        AppError::Forbidden
    } else {
        AppError::Unauthorized
    })
}

fn pack_response(content_type: String, body: Body) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::EXPIRES, HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    response
}

/// Waits for the completion channel of a finished or killed process.
async fn exit_result(done: oneshot::Receiver<Result<(), GitError>>) -> Result<(), GitError> {
    done.await
        .unwrap_or_else(|_| Err(GitError::Io(io::Error::other("git exited without reporting a status"))))
}

fn body_error(e: axum::Error) -> GitError {
    GitError::Io(io::Error::other(e.to_string()))
}

/// How a pack exchange began: with output to stream, or with the process already done.
enum Started {
    Streaming {
        first: Bytes,
        rest: BodyDataStream,
        done: oneshot::Receiver<Result<(), GitError>>,
    },
    Finished,
}

/// Holds the status line until git has either written something or exited, so a
/// process that dies before producing output is answered with 500.
async fn start(output: GitOutput) -> Result<Started, GitError> {
    let GitOutput { body, done } = output;
    let mut rest = body.into_data_stream();
    match rest.next().await {
        Some(Ok(first)) => Ok(Started::Streaming { first, rest, done }),
        Some(Err(e)) => Err(body_error(e)),
        None => exit_result(done).await.map(|()| Started::Finished),
    }
}

/// `GET /:username/:reponame/info/refs?service=...`
pub async fn info_refs(ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let Some(service) = ctx.query_value("service").as_deref().and_then(GitService::from_name) else {
        return Ok(git_error(
            StatusCode::BAD_REQUEST,
            "unsupported service: only the smart protocol is served",
        ));
    };
    let repo = authorize(&ctx, service)?;
    let path = repo.disk_path(&state.config.repository_root);

    // The advertisement is small; buffering it lets a failed git become a 500.
    let output = state.git.advertise_refs(&path, service).await?;
    let refs = axum::body::to_bytes(output.body, usize::MAX)
        .await
        .map_err(body_error)?;
    if let Err(e) = exit_result(output.done).await {
        tracing::error!(repo = %repo.full_name(), error = %e, "ref advertisement failed");
        return Err(e.into());
    }

    let mut body = advertisement_preamble(service).into_bytes();
    body.extend_from_slice(&refs);
    Ok(pack_response(
        format!("application/x-{}-advertisement", service.name()),
        Body::from(body),
    ))
}

/// `POST /:username/:reponame/git-upload-pack` and `.../git-receive-pack`
pub async fn service_rpc(mut ctx: RequestContext, state: AppState) -> Result<Response, AppError> {
    let service = ctx
        .param("service")
        .and_then(GitService::from_name)
        .ok_or(AppError::NotFound)?;
    let repo = authorize(&ctx, service)?;

    let expected = format!("application/x-{}-request", service.name());
    if ctx.header(header::CONTENT_TYPE) != Some(expected.as_str()) {
        return Ok(git_error(
            StatusCode::BAD_REQUEST,
            format!("expected content type {expected}"),
        ));
    }

    let path = repo.disk_path(&state.config.repository_root);
    let pusher = ctx.user().cloned();
    let input = ctx.take_body();
    let output = state.git.stateless_rpc(&path, service, input).await?;
    let content_type = format!("application/x-{}-result", service.name());
    let hooks = Arc::clone(&state.hooks);

    let (first, rest, done) = match start(output).await {
        Ok(Started::Streaming { first, rest, done }) => (first, rest, done),
        Ok(Started::Finished) => {
            if service == GitService::ReceivePack {
                tokio::spawn(async move { hooks.post_receive(&repo, pusher.as_ref()).await });
            }
            return Ok(pack_response(content_type, Body::empty()));
        }
        Err(e) => {
            tracing::error!(repo = %repo.full_name(), error = %e, "git {} failed", service.name());
            return Err(e.into());
        }
    };

    tokio::spawn(async move {
        match exit_result(done).await {
            Ok(()) if service == GitService::ReceivePack => {
                hooks.post_receive(&repo, pusher.as_ref()).await;
            }
            Ok(()) => {}
            Err(GitError::Cancelled(_)) => {}
            Err(e) => {
                tracing::error!(repo = %repo.full_name(), error = %e, "git {} failed", service.name());
            }
        }
    });

    let body = stream::once(async move { Ok::<_, axum::Error>(first) }).chain(rest);
    Ok(pack_response(content_type, Body::from_stream(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_line_prefixes_length() {
        assert_eq!(pkt_line("# service=git-upload-pack\n"), "001e# service=git-upload-pack\n");
        assert_eq!(
            advertisement_preamble(GitService::ReceivePack),
            "001f# service=git-receive-pack\n0000"
        );
    }

    #[test]
    fn services_parse_and_map_permissions() {
        assert_eq!(GitService::from_name("git-upload-pack"), Some(GitService::UploadPack));
        assert_eq!(GitService::from_name("git-receive-pack"), Some(GitService::ReceivePack));
        assert_eq!(GitService::from_name("git-archive"), None);
        assert_eq!(GitService::UploadPack.required_permission(), Permission::Read);
        assert_eq!(GitService::ReceivePack.required_permission(), Permission::Write);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let git = GitCommand::new("/nonexistent/git-binary", Duration::from_secs(5));
        let result = git
            .advertise_refs(Path::new("/tmp/none.git"), GitService::UploadPack)
            .await;
        assert!(matches!(result, Err(GitError::Spawn { .. })));
    }
}
