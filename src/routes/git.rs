use crate::{
    auth::TokenAuthenticator,
    config::AppConfig,
    gate::AuthGate,
    git::{GitRequest, info_refs, service_rpc},
    resolver::RepoResolver,
    router::Router,
};

use super::stage;

/// Registers the smart-HTTP endpoints.
///
/// Git clients only speak Basic auth and never carry a CSRF token, so the group
/// authenticates from credentials, skips CSRF and challenges anonymous callers. When
/// the site requires sign-in to view, every anonymous git request is challenged.
/// The per-service permission check happens in the handlers, before any process is
/// spawned.
pub fn register(r: &mut Router, config: &AppConfig) {
    r.group(
        "/:username/:reponame",
        vec![
            stage(GitRequest),
            stage(TokenAuthenticator::credentials()),
            stage(AuthGate::ignore_sign_in(config).without_csrf()),
            stage(RepoResolver::for_git()),
        ],
        |r| {
            r.get("/info/refs", vec![], info_refs);
            r.post("/:service(git-upload-pack|git-receive-pack)", vec![], service_rpc);
        },
    );
}
