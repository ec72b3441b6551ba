mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use std::{sync::Arc, time::Duration};

use common::{TestApp, body_string, data_value, location, template_of};
use gitward::{AppConfig, AppState, PostgresStore, models::Permission};
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

#[tokio::test]
async fn unmatched_path_is_a_router_404() {
    let app = TestApp::new();
    let response = app.get("/this/does/not/exist").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let html = body_string(response).await;
    assert_eq!(template_of(&html), Some("status/404"));
}

#[tokio::test]
async fn private_repository_is_indistinguishable_from_a_missing_one() {
    let app = TestApp::new();

    let missing = app.get("/alice/no-such-repo").await;
    let private = app.get("/alice/private-repo").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(private.status(), StatusCode::NOT_FOUND);
    let missing_body = body_string(missing).await;
    assert_eq!(body_string(private).await, missing_body);

    // A signed-in user without any grant sees exactly the same.
    let cookie = app.sign_in(&app.bob).await;
    let response = app
        .send(
            Request::get("/alice/private-repo")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(response).await, missing_body);
}

#[tokio::test]
async fn public_repository_is_readable_anonymously() {
    let app = TestApp::new();
    let response = app.get("/alice/public-repo").await;

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert_eq!(template_of(&html), Some("repo/home"));
    assert_eq!(data_value(&html, "IsRepositoryWriter").as_deref(), Some("false"));
    assert_eq!(
        data_value(&html, "CloneLink").as_deref(),
        Some("http://localhost:3000/alice/public-repo.git")
    );
}

#[tokio::test]
async fn git_suffix_and_case_resolve_the_same_repository() {
    let app = TestApp::new();
    let response = app.get("/Alice/Public-Repo.git").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn team_grant_opens_private_repository() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.carol).await;
    let response = app
        .send(
            Request::get("/alice/private-repo/src/master/README.md")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert_eq!(data_value(&html, "TreePath").as_deref(), Some("master/README.md"));
    assert_eq!(data_value(&html, "IsRepositoryWriter").as_deref(), Some("true"));
    assert_eq!(data_value(&html, "IsRepositoryAdmin").as_deref(), Some("false"));
}

#[tokio::test]
async fn sign_in_required_redirects_with_return_address() {
    let app = TestApp::new();
    let response = app.get("/user/settings").await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/user/login?redirect_to=%2Fuser%2Fsettings");
}

#[tokio::test]
async fn sign_in_follows_local_redirects_only() {
    let app = TestApp::new();
    let post = |redirect: &str| {
        Request::post("/user/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!(
                "user_name=alice&password={}&redirect_to={}",
                common::PASSWORD,
                redirect
            )))
            .unwrap()
    };

    let response = app.send(post("%2Falice%2Fpublic-repo")).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/alice/public-repo");

    let response = app.send(post("https%3A%2F%2Fevil.example.com")).await;
    assert_eq!(location(&response), "/");
}

#[tokio::test]
async fn wrong_password_rerenders_the_form() {
    let app = TestApp::new();
    let response = app
        .send(
            Request::post("/user/login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("user_name=alice&password=nope"))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    let html = body_string(response).await;
    assert_eq!(template_of(&html), Some("user/auth/signin"));
    assert_eq!(data_value(&html, "Err_UserName").as_deref(), Some("true"));
}

#[tokio::test]
async fn signed_in_user_is_redirected_away_from_login() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.alice).await;

    for uri in ["/user/login", "/user/sign_up"] {
        let response = app
            .send(
                Request::get(uri)
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{uri}");
        assert_eq!(location(&response), "/");
    }
}

#[tokio::test]
async fn sign_out_ends_the_session() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.alice).await;

    let response = app
        .send(
            Request::get("/user/logout")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let cleared = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cleared.contains("Max-Age=0"));

    // The old cookie no longer names a session.
    let response = app
        .send(
            Request::get("/user/settings")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(location(&response).starts_with("/user/login"));
}

#[tokio::test]
async fn tampered_session_cookie_is_anonymous() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.alice).await;
    let tampered = format!("{cookie}x");

    let response = app
        .send(
            Request::get("/user/settings")
                .header(header::COOKIE, tampered)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn state_changing_browser_requests_need_the_csrf_token() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.alice).await;
    let token = app.csrf_token(&cookie).await;

    let without = app
        .send(
            Request::post("/user/settings/applications")
                .header(header::COOKIE, &cookie)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("name=laptop"))
                .unwrap(),
        )
        .await;
    assert_eq!(without.status(), StatusCode::FORBIDDEN);

    let with_header = app
        .send(
            Request::post("/user/settings/applications")
                .header(header::COOKIE, &cookie)
                .header("x-csrf-token", &token)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("name=laptop"))
                .unwrap(),
        )
        .await;
    assert_eq!(with_header.status(), StatusCode::OK);
    let html = body_string(with_header).await;
    let secret = data_value(&html, "AccessToken").expect("secret shown once");
    assert_eq!(secret.len(), 40);

    let with_query = app
        .send(
            Request::post(format!("/user/settings/applications?_csrf={token}"))
                .header(header::COOKIE, &cookie)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("name=desktop"))
                .unwrap(),
        )
        .await;
    assert_eq!(with_query.status(), StatusCode::OK);

    // The listing never shows a secret again.
    let listing = app
        .send(
            Request::get("/user/settings/applications")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let html = body_string(listing).await;
    assert!(data_value(&html, "AccessToken").is_none());
    assert!(html.contains("laptop") && html.contains("desktop"));
}

#[tokio::test]
async fn admin_pages_need_the_site_admin_flag() {
    let app = TestApp::new();

    let alice = app.sign_in(&app.alice).await;
    let response = app
        .send(
            Request::get("/admin/users")
                .header(header::COOKIE, &alice)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let root = app.sign_in(&app.root).await;
    let response = app
        .send(
            Request::get("/admin")
                .header(header::COOKIE, &root)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert_eq!(data_value(&html, "NumUsers").as_deref(), Some("4"));
    assert_eq!(data_value(&html, "NumRepos").as_deref(), Some("2"));
}

#[tokio::test]
async fn inactive_account_cannot_use_sign_in_pages() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.bob).await;
    app.store.set_active(app.bob.id, false);

    let response = app
        .send(
            Request::get("/user/settings")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn repository_settings_require_admin_permission() {
    let app = TestApp::new();

    // Anonymous callers are sent to sign in before the repository is even resolved.
    let response = app.get("/alice/public-repo/settings").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let bob = app.sign_in(&app.bob).await;
    let response = app
        .send(
            Request::get("/alice/public-repo/settings")
                .header(header::COOKIE, &bob)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.store
        .add_collaborator(app.public_repo.id, app.bob.id, Permission::Admin);
    let response = app
        .send(
            Request::get("/alice/public-repo/settings")
                .header(header::COOKIE, &bob)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert_eq!(data_value(&html, "PageIsSettings").as_deref(), Some("true"));
}

#[tokio::test]
async fn repository_settings_post_updates_visibility() {
    let app = TestApp::new();
    let cookie = app.sign_in(&app.alice).await;
    let token = app.csrf_token(&cookie).await;

    let response = app
        .send(
            Request::post("/alice/public-repo/settings")
                .header(header::COOKIE, &cookie)
                .header("x-csrf-token", &token)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("description=now+hidden&private=on"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/alice/public-repo/settings");

    let response = app.get("/alice/public-repo").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wiki_editing_needs_push_permission() {
    let app = TestApp::new();

    let response = app.get("/alice/public-repo/wiki").await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert_eq!(data_value(&html, "PageName").as_deref(), Some("Home"));

    let bob = app.sign_in(&app.bob).await;
    let response = app
        .send(
            Request::get("/alice/public-repo/wiki/_new")
                .header(header::COOKIE, &bob)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn issue_and_compare_routes_capture_their_parameters() {
    let app = TestApp::new();

    let response = app.get("/alice/public-repo/pulls").await;
    let html = body_string(response).await;
    assert_eq!(data_value(&html, "PageIsPullList").as_deref(), Some("true"));
    assert_eq!(data_value(&html, "PageIsList").as_deref(), Some("true"));

    let before = "0".repeat(40);
    let after = "f".repeat(40);
    let response = app
        .get(&format!("/alice/public-repo/compare/{before}...{after}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert_eq!(data_value(&html, "BeforeCommitID"), Some(before));
    assert_eq!(data_value(&html, "AfterCommitID"), Some(after));
}

#[tokio::test]
async fn profile_hides_private_repositories_from_others() {
    let app = TestApp::new();

    let html = body_string(app.get("/alice").await).await;
    assert!(html.contains("alice/public-repo"));
    assert!(!html.contains("alice/private-repo"));

    let cookie = app.sign_in(&app.alice).await;
    let response = app
        .send(
            Request::get("/alice")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let html = body_string(response).await;
    assert!(html.contains("alice/private-repo"));
}

#[tokio::test]
async fn require_sign_in_view_closes_browsing() {
    let app = TestApp::with_config(|config| config.require_sign_in_view = true);

    let response = app.get("/alice/public-repo").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let response = app.get("/explore").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn static_files_short_circuit_routing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("css")).unwrap();
    std::fs::write(dir.path().join("css/app.css"), "body{}").unwrap();
    std::fs::write(dir.path().join("robots.txt"), "User-agent: *\n").unwrap();
    let root = dir.path().to_path_buf();
    let app = TestApp::with_config(move |config| {
        config.robots_txt = Some(root.join("robots.txt"));
        config.static_root = root;
    });

    let response = app.get("/css/app.css").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "body{}");

    let response = app.get("/robots.txt").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.get("/css/../../etc/passwd").await;
    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn robots_txt_is_404_when_not_configured() {
    let app = TestApp::new();
    let response = app.get("/robots.txt").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let app = TestApp::new();
    let response = app.get("/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn static_files_carry_their_mime_type() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("js")).unwrap();
    std::fs::write(dir.path().join("js/app.js"), "console.log(1)").unwrap();
    let root = dir.path().to_path_buf();
    let app = TestApp::with_config(move |config| config.static_root = root);

    let response = app.get("/js/app.js").await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
    assert!(content_type.to_str().unwrap().ends_with("javascript"));
}

#[tokio::test]
async fn health_check_reports_the_database() {
    let app = TestApp::new();
    let response = app.get("/healthcheck").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "* Database connection: OK\n");
}

#[tokio::test]
async fn health_check_fails_when_the_database_is_unreachable() {
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(500))
        .connect_lazy("postgres://gitward@127.0.0.1:1/gitward")
        .unwrap();
    let config = AppConfig {
        disable_router_log: true,
        ..AppConfig::default()
    };
    let state = AppState::new(config, Arc::new(PostgresStore::new(pool)));
    let response = gitward::create_app(state)
        .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_string(response).await,
        "* Database connection: FAILED\n"
    );
}

#[tokio::test]
async fn responses_are_gzipped_only_when_enabled_and_accepted() {
    let app = TestApp::with_config(|config| config.enable_gzip = true);

    let response = app
        .send(
            Request::get("/explore")
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");

    let response = app.get("/explore").await;
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

    let app = TestApp::new();
    let response = app
        .send(
            Request::get("/explore")
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
}
