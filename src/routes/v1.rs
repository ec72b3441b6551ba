use crate::{
    api,
    auth::RequireBasicAuth,
    config::AppConfig,
    gate::AuthGate,
    middleware::BindJson,
    models::{CreateAccessTokenOption, MarkdownForm},
    resolver::{RepoResolver, require_repo_owner},
    router::Router,
};

use super::stage;

/// Registers API v1. Errors on this surface are JSON; anything unmatched below
/// `/api/v1` is answered by the catch-all with a JSON 404.
pub fn register(r: &mut Router, config: &AppConfig) {
    r.group("/api/v1", vec![stage(AuthGate::ignore_sign_in(config))], |r| {
        r.post("/markdown", vec![stage(BindJson::<MarkdownForm>::new())], api::markdown);
        r.post("/markdown/raw", vec![], api::markdown_raw);

        r.group("/users", vec![], |r| {
            r.get("/search", vec![], api::search_users);
            r.get("/:username", vec![], api::get_user);

            r.group("/:username/tokens", vec![stage(RequireBasicAuth)], |r| {
                r.get("", vec![], api::list_tokens);
                r.post(
                    "",
                    vec![stage(BindJson::<CreateAccessTokenOption>::new())],
                    api::create_token,
                );
                r.delete("/:id:int", vec![], api::delete_token);
            });
        });

        r.get("/user/repos", vec![stage(AuthGate::sign_in())], api::list_my_repos);

        r.group("/repos", vec![], |r| {
            r.get("/search", vec![], api::search_repos);
            r.group("/:username/:reponame", vec![stage(RepoResolver::new())], |r| {
                r.get("", vec![], api::get_repo);
                r.delete("", vec![stage(require_repo_owner())], api::delete_repo);
            });
        });

        r.any("/*", vec![], api::api_not_found);
    });
}
