use crate::{
    config::AppConfig,
    gate::AuthGate,
    handlers,
    middleware::SetData,
    resolver::{RepoResolver, require_repo_admin, require_repo_pusher},
    router::Router,
};

use super::stage;

/// Registers the repository pages. Every group resolves the repository first, so a
/// repository the caller cannot read is a 404 before any handler runs.
pub fn register(r: &mut Router, config: &AppConfig) {
    let req_sign_in = stage(AuthGate::sign_in());
    let resolve = stage(RepoResolver::new());

    r.group(
        "/:username/:reponame/settings",
        vec![
            req_sign_in.clone(),
            resolve.clone(),
            stage(require_repo_admin()),
            stage(SetData::flag("PageIsSettings")),
        ],
        |r| {
            r.combo("", vec![])
                .get(handlers::repo_settings)
                .post(handlers::repo_settings_post);
        },
    );

    r.group(
        "/:username/:reponame",
        vec![stage(AuthGate::ignore_sign_in(config)), resolve],
        |r| {
            r.get("", vec![], handlers::repo_home);
            r.get("/src/*", vec![], handlers::repo_src);
            r.get("/raw/*", vec![], handlers::repo_raw);
            r.get("/commits/*", vec![], handlers::repo_commits);
            r.get(
                "/^:type(issues|pulls)$",
                vec![stage(SetData::flag("PageIsList"))],
                handlers::repo_issues,
            );

            r.group("/wiki", vec![], |r| {
                r.get("/?:page", vec![], handlers::repo_wiki);
                r.get(
                    "/_new",
                    vec![req_sign_in, stage(require_repo_pusher())],
                    handlers::repo_wiki_new,
                );
            });

            r.get(
                "/compare/:before([a-z0-9]{40})...:after([a-z0-9]{40})",
                vec![],
                handlers::repo_compare,
            );
        },
    );
}
