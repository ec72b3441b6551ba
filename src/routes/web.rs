use crate::{
    config::AppConfig,
    gate::AuthGate,
    handlers,
    middleware::SetData,
    router::Router,
};

use super::stage;

/// Registers the browser pages that are not tied to a repository.
///
/// `/:username` is registered last but loses to every literal first segment anyway,
/// so `/explore` or `/admin` can never be read as a user name.
pub fn register(r: &mut Router, config: &AppConfig) {
    let ign_sign_in = stage(AuthGate::ignore_sign_in(config));
    let req_sign_in = stage(AuthGate::sign_in());
    let req_sign_out = stage(AuthGate::sign_out());

    r.get("/", vec![ign_sign_in.clone()], handlers::home);
    r.get("/explore", vec![ign_sign_in.clone()], handlers::explore);
    r.get("/robots.txt", vec![], handlers::robots_txt);
    r.get("/healthcheck", vec![], handlers::healthcheck);
    r.get("/avatar/:hash([0-9a-f]{64})", vec![], handlers::avatar);

    r.group("/user", vec![], |r| {
        r.combo("/login", vec![req_sign_out.clone()])
            .get(handlers::sign_in)
            .post(handlers::sign_in_post);
        r.get("/sign_up", vec![req_sign_out.clone()], handlers::sign_up);
        r.get("/logout", vec![], handlers::sign_out);
    });

    r.group(
        "/user/settings",
        vec![req_sign_in.clone(), stage(SetData::flag("PageIsUserSettings"))],
        |r| {
            r.get("", vec![], handlers::user_settings);
            r.combo("/applications", vec![])
                .get(handlers::applications)
                .post(handlers::applications_post);
            r.post("/applications/delete", vec![], handlers::applications_delete);
        },
    );

    r.group("/admin", vec![stage(AuthGate::admin())], |r| {
        r.get("", vec![], handlers::admin_dashboard);
        r.get("/users", vec![], handlers::admin_users);
        r.get("/repos", vec![], handlers::admin_repos);
    });

    r.get("/:username", vec![ign_sign_in], handlers::profile);
}
