//! Route table assembly.
//!
//! The table is built once at startup by [`build`] and handed to the dispatcher.
//! Each submodule registers one area of the site with the middleware its groups need,
//! in the order they run: group stages outer to inner, then route stages.

use std::sync::Arc;

use crate::{
    config::AppConfig,
    dispatcher::{Middleware, Stage},
    router::Router,
};

/// Browser pages: home, sign-in, user settings, admin, profiles.
pub mod web;

/// Repository pages behind `RepoResolver`.
pub mod repo;

/// Git smart-HTTP endpoints.
pub mod git;

/// JSON API under `/api/v1`.
pub mod v1;

pub(crate) fn stage(middleware: impl Middleware) -> Stage {
    Arc::new(middleware)
}

pub fn build(config: &AppConfig) -> Router {
    let mut router = Router::new();
    web::register(&mut router, config);
    repo::register(&mut router, config);
    git::register(&mut router, config);
    v1::register(&mut router, config);
    tracing::debug!(routes = router.len(), "route table built");
    router
}
