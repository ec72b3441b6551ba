use std::sync::Arc;

use axum::http::Method;
use regex::Regex;

use crate::{
    context::Params,
    dispatcher::{Handler, Stage},
};

/// How well a segment kind pins down the text it matched. Higher is more specific;
/// the best route for a path is the one with the lexicographically largest ranks.
/// A trailing optional or wildcard that matched nothing adds no rank and loses to a
/// route that ends exactly where the path does.
const RANK_LITERAL: u8 = 4;
const RANK_CONSTRAINED: u8 = 3;
const RANK_PARAM: u8 = 2;
const RANK_OPTIONAL: u8 = 1;
const RANK_WILDCARD: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Any,
    Int,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param { name: String, kind: ParamKind },
    /// `?:name`, last segment only; matches the segment or its absence.
    Optional(String),
    /// One path segment matched against an anchored regex, e.g.
    /// `:before([a-z0-9]{40})...:after([a-z0-9]{40})`.
    Pattern { regex: Regex, names: Vec<String> },
    /// `*`, last segment only; captures the remainder (possibly empty) under `*`.
    Wildcard,
}

impl Segment {
    fn parse(raw: &str, is_last: bool, pattern: &str) -> Self {
        if raw == "*" {
            assert!(is_last, "wildcard must be the last segment in `{pattern}`");
            return Segment::Wildcard;
        }
        if let Some(name) = raw.strip_prefix("?:") {
            assert!(is_last, "optional parameter must be the last segment in `{pattern}`");
            assert!(valid_name(name), "invalid parameter name in `{pattern}`");
            return Segment::Optional(name.to_owned());
        }
        if raw.contains('(') {
            return parse_regex_segment(raw, pattern);
        }
        if let Some(rest) = raw.strip_prefix(':') {
            let (name, kind) = match rest.split_once(':') {
                Some((name, "int")) => (name, ParamKind::Int),
                Some((_, other)) => panic!("unknown parameter type `{other}` in `{pattern}`"),
                None => (rest, ParamKind::Any),
            };
            assert!(valid_name(name), "invalid parameter name in `{pattern}`");
            return Segment::Param {
                name: name.to_owned(),
                kind,
            };
        }
        Segment::Literal(raw.to_owned())
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Compiles a segment mixing literal text with `:name(regex)` captures. `^` and `$`
/// markers are accepted and ignored since the segment is always matched whole.
fn parse_regex_segment(raw: &str, pattern: &str) -> Segment {
    let body = raw.trim_start_matches('^').trim_end_matches('$');
    let mut source = String::from("^");
    let mut names = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ':' {
            source.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next == '(' {
                break;
            }
            name.push(next);
            chars.next();
        }
        assert!(valid_name(&name), "invalid parameter name in `{pattern}`");
        assert_eq!(chars.next(), Some('('), "missing constraint in `{pattern}`");

        let mut depth = 1;
        let mut constraint = String::new();
        for next in chars.by_ref() {
            match next {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            constraint.push(next);
        }
        assert_eq!(depth, 0, "unbalanced parentheses in `{pattern}`");

        source.push_str(&format!("(?P<{name}>{constraint})"));
        names.push(name);
    }
    source.push('$');

    let regex = Regex::new(&source)
        .unwrap_or_else(|e| panic!("invalid constraint in route `{pattern}`: {e}"));
    Segment::Pattern { regex, names }
}

/// Route
///
/// One registered entry: the method set (empty means any method), the parsed pattern,
/// the full middleware list (group stages first) and the terminal handler.
pub struct Route {
    methods: Vec<Method>,
    pattern: String,
    segments: Vec<Segment>,
    stages: Vec<Stage>,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self.methods.contains(method)
            || (method == Method::HEAD && self.methods.contains(&Method::GET))
    }

    /// Matches the split path, returning the specificity of the match and the captures.
    fn capture(&self, parts: &[&str]) -> Option<(Specificity, Params)> {
        let mut ranks = Vec::with_capacity(self.segments.len());
        let mut params = Params::new();

        for (i, segment) in self.segments.iter().enumerate() {
            let part = parts.get(i).copied();
            match segment {
                Segment::Literal(literal) => {
                    if part != Some(literal.as_str()) {
                        return None;
                    }
                    ranks.push(RANK_LITERAL);
                }
                Segment::Param { name, kind } => {
                    let value = part.filter(|p| !p.is_empty())?;
                    if *kind == ParamKind::Int && value.parse::<i64>().is_err() {
                        return None;
                    }
                    params.push(name.as_str(), value);
                    ranks.push(match kind {
                        ParamKind::Int => RANK_CONSTRAINED,
                        ParamKind::Any => RANK_PARAM,
                    });
                }
                Segment::Optional(name) => {
                    params.push(name.as_str(), part.unwrap_or_default());
                    match part {
                        Some(_) => ranks.push(RANK_OPTIONAL),
                        None => return Some((Specificity::empty_tail(ranks), params)),
                    }
                }
                Segment::Pattern { regex, names } => {
                    let captures = regex.captures(part?)?;
                    for name in names {
                        let value = captures.name(name).map_or("", |m| m.as_str());
                        params.push(name.as_str(), value);
                    }
                    ranks.push(RANK_CONSTRAINED);
                }
                Segment::Wildcard => {
                    let rest = parts.get(i..).unwrap_or_default();
                    params.push("*", rest.join("/"));
                    if rest.is_empty() {
                        return Some((Specificity::empty_tail(ranks), params));
                    }
                    ranks.push(RANK_WILDCARD);
                    return Some((Specificity::exact(ranks), params));
                }
            }
        }

        (parts.len() == self.segments.len()).then_some((Specificity::exact(ranks), params))
    }
}

/// Ordering key for candidate routes: ranks position by position, then whether the
/// route ended with the path rather than on an empty optional or wildcard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Specificity {
    ranks: Vec<u8>,
    exact: bool,
}

impl Specificity {
    fn exact(ranks: Vec<u8>) -> Self {
        Self { ranks, exact: true }
    }

    fn empty_tail(ranks: Vec<u8>) -> Self {
        Self {
            ranks,
            exact: false,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("methods", &self.methods)
            .field("pattern", &self.pattern)
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// The route chosen for a request plus the parameters it captured.
pub struct RouteMatch<'r> {
    pub route: &'r Route,
    pub params: Params,
}

struct Scope {
    prefix: String,
    stages: Vec<Stage>,
}

/// Router
///
/// The route table. Built once at startup with `route`/`group`/`combo`, then owned
/// (read-only) by the dispatcher.
///
/// Matching picks, among the routes whose method set and pattern both match, the one
/// whose segments are most specific position by position: a literal beats a typed or
/// regex-constrained parameter, which beats a plain parameter, which beats an optional
/// parameter, which beats a wildcard. Equally specific routes resolve to the one
/// registered first.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    scopes: Vec<Scope>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route inside the current group scope.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is malformed (bad parameter name, unknown type, invalid regex,
    /// or a wildcard/optional segment that is not last).
    pub fn route(
        &mut self,
        methods: &[Method],
        pattern: &str,
        stages: Vec<Stage>,
        handler: impl Handler,
    ) -> &mut Self {
        let mut full = String::new();
        let mut chain: Vec<Stage> = Vec::new();
        for scope in &self.scopes {
            full.push_str(&scope.prefix);
            chain.extend(scope.stages.iter().cloned());
        }
        full.push_str(pattern);
        chain.extend(stages);
        while full.len() > 1 && full.ends_with('/') {
            full.pop();
        }
        if full.is_empty() {
            full.push('/');
        }
        assert!(full.starts_with('/'), "route `{full}` must start with `/`");

        let raw: Vec<&str> = full.trim_start_matches('/').split('/').collect();
        let segments = if full == "/" {
            Vec::new()
        } else {
            raw.iter()
                .enumerate()
                .map(|(i, part)| Segment::parse(part, i + 1 == raw.len(), &full))
                .collect()
        };

        tracing::trace!(pattern = %full, ?methods, "registered route");
        self.routes.push(Route {
            methods: methods.to_vec(),
            pattern: full,
            segments,
            stages: chain,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn get(&mut self, pattern: &str, stages: Vec<Stage>, handler: impl Handler) -> &mut Self {
        self.route(&[Method::GET], pattern, stages, handler)
    }

    pub fn post(&mut self, pattern: &str, stages: Vec<Stage>, handler: impl Handler) -> &mut Self {
        self.route(&[Method::POST], pattern, stages, handler)
    }

    pub fn delete(&mut self, pattern: &str, stages: Vec<Stage>, handler: impl Handler) -> &mut Self {
        self.route(&[Method::DELETE], pattern, stages, handler)
    }

    pub fn any(&mut self, pattern: &str, stages: Vec<Stage>, handler: impl Handler) -> &mut Self {
        self.route(&[], pattern, stages, handler)
    }

    /// Registers everything `build` adds under `prefix`, with `stages` running before
    /// each route's own middleware. Groups nest.
    pub fn group(&mut self, prefix: &str, stages: Vec<Stage>, build: impl FnOnce(&mut Router)) {
        self.scopes.push(Scope {
            prefix: prefix.trim_end_matches('/').to_owned(),
            stages,
        });
        build(self);
        self.scopes.pop();
    }

    /// One pattern shared by several methods, each with its own handler.
    pub fn combo(&mut self, pattern: &str, stages: Vec<Stage>) -> Combo<'_> {
        Combo {
            router: self,
            pattern: pattern.to_owned(),
            stages,
        }
    }

    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let trimmed = match path.strip_suffix('/') {
            Some(rest) if !rest.is_empty() => rest,
            _ => path,
        };
        let parts: Vec<&str> = match trimmed.trim_start_matches('/') {
            "" => Vec::new(),
            rest => rest.split('/').collect(),
        };

        let mut best: Option<(Specificity, &Route, Params)> = None;
        for route in self.routes.iter().filter(|r| r.allows(method)) {
            let Some((ranks, params)) = route.capture(&parts) else {
                continue;
            };
            if best.as_ref().is_none_or(|(top, _, _)| ranks > *top) {
                best = Some((ranks, route, params));
            }
        }

        best.map(|(_, route, params)| RouteMatch { route, params })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builder returned by [`Router::combo`].
pub struct Combo<'r> {
    router: &'r mut Router,
    pattern: String,
    stages: Vec<Stage>,
}

impl Combo<'_> {
    fn add(self, method: Method, handler: impl Handler) -> Self {
        self.router
            .route(&[method], &self.pattern, self.stages.clone(), handler);
        self
    }

    pub fn get(self, handler: impl Handler) -> Self {
        self.add(Method::GET, handler)
    }

    pub fn post(self, handler: impl Handler) -> Self {
        self.add(Method::POST, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppState, context::RequestContext, error::AppError};
    use axum::response::{IntoResponse, Response};

    async fn noop(_: RequestContext, _: AppState) -> Result<Response, AppError> {
        Ok(().into_response())
    }

    fn matched<'r>(router: &'r Router, method: Method, path: &str) -> Option<&'r str> {
        router.find(&method, path).map(|m| m.route.pattern())
    }

    #[test]
    fn literal_beats_parameter_regardless_of_order() {
        let mut router = Router::new();
        router.get("/:username", vec![], noop);
        router.get("/explore", vec![], noop);

        assert_eq!(matched(&router, Method::GET, "/explore"), Some("/explore"));
        assert_eq!(matched(&router, Method::GET, "/alice"), Some("/:username"));
    }

    #[test]
    fn first_registered_wins_between_equal_routes() {
        let mut router = Router::new();
        router.get("/:a/:b", vec![], noop);
        router.get("/:x/:y", vec![], noop);

        let found = router.find(&Method::GET, "/one/two").unwrap();
        assert_eq!(found.route.pattern(), "/:a/:b");
        assert_eq!(found.params.get("a"), Some("one"));
        assert_eq!(found.params.get("b"), Some("two"));
    }

    #[test]
    fn int_parameter_requires_integer() {
        let mut router = Router::new();
        router.delete("/tokens/:id:int", vec![], noop);

        let found = router.find(&Method::DELETE, "/tokens/42").unwrap();
        assert_eq!(found.params.get("id"), Some("42"));
        assert!(router.find(&Method::DELETE, "/tokens/abc").is_none());
    }

    #[test]
    fn regex_segments_capture_every_name() {
        let mut router = Router::new();
        router.get("/:u/:r/^:type(issues|pulls)$", vec![], noop);
        router.get(
            "/:u/:r/compare/:before([a-z0-9]{40})...:after([a-z0-9]{40})",
            vec![],
            noop,
        );

        let found = router.find(&Method::GET, "/alice/repo/pulls").unwrap();
        assert_eq!(found.params.get("type"), Some("pulls"));
        assert!(router.find(&Method::GET, "/alice/repo/wiki").is_none());

        let before = "a".repeat(40);
        let after = "b".repeat(40);
        let path = format!("/alice/repo/compare/{before}...{after}");
        let found = router.find(&Method::GET, &path).unwrap();
        assert_eq!(found.params.get("before"), Some(before.as_str()));
        assert_eq!(found.params.get("after"), Some(after.as_str()));
        assert!(
            router
                .find(&Method::GET, "/alice/repo/compare/abc...def")
                .is_none()
        );
    }

    #[test]
    fn optional_and_wildcard_segments() {
        let mut router = Router::new();
        router.get("/:u/:r/wiki/?:page", vec![], noop);
        router.get("/:u/:r/src/*", vec![], noop);

        let found = router.find(&Method::GET, "/alice/repo/wiki").unwrap();
        assert_eq!(found.params.get("page"), Some(""));
        let found = router.find(&Method::GET, "/alice/repo/wiki/Home").unwrap();
        assert_eq!(found.params.get("page"), Some("Home"));

        let found = router
            .find(&Method::GET, "/alice/repo/src/main/lib/mod.rs")
            .unwrap();
        assert_eq!(found.params.get("*"), Some("main/lib/mod.rs"));
        let found = router.find(&Method::GET, "/alice/repo/src").unwrap();
        assert_eq!(found.params.get("*"), Some(""));
    }

    #[test]
    fn exact_route_beats_empty_wildcard_registered_later() {
        let mut router = Router::new();
        router.get("/:u/:r", vec![], noop);
        router.get("/:u/:r/*", vec![], noop);

        assert_eq!(matched(&router, Method::GET, "/alice/repo"), Some("/:u/:r"));
        assert_eq!(
            matched(&router, Method::GET, "/alice/repo/src"),
            Some("/:u/:r/*")
        );
    }

    #[test]
    fn exact_route_beats_empty_optional_in_either_order() {
        let mut router = Router::new();
        router.get("/:a/:b/wiki", vec![], noop);
        router.get("/:a/:b/wiki/?:page", vec![], noop);
        assert_eq!(
            matched(&router, Method::GET, "/alice/repo/wiki"),
            Some("/:a/:b/wiki")
        );
        assert_eq!(
            matched(&router, Method::GET, "/alice/repo/wiki/Home"),
            Some("/:a/:b/wiki/?:page")
        );

        let mut router = Router::new();
        router.get("/:a/:b/wiki/?:page", vec![], noop);
        router.get("/:a/:b/wiki", vec![], noop);
        assert_eq!(
            matched(&router, Method::GET, "/alice/repo/wiki"),
            Some("/:a/:b/wiki")
        );
    }

    #[test]
    fn literal_prefix_still_beats_exact_parameters() {
        let mut router = Router::new();
        router.get("/:username/:reponame", vec![], noop);
        router.any("/api/v1/*", vec![], noop);

        assert_eq!(matched(&router, Method::GET, "/api/v1"), Some("/api/v1/*"));
    }

    #[test]
    fn groups_concatenate_prefixes_and_stages() {
        use crate::dispatcher::Middleware;
        use crate::error::Outcome;

        struct Tag;
        #[async_trait::async_trait]
        impl Middleware for Tag {
            async fn handle(&self, _: &mut RequestContext, _: &AppState) -> Outcome {
                Ok(())
            }
        }

        let tag: Stage = Arc::new(Tag);
        let mut router = Router::new();
        router.group("/:username/:reponame", vec![tag.clone()], |r| {
            r.group("/settings", vec![tag.clone()], |r| {
                r.combo("", vec![tag.clone()]).get(noop).post(noop);
            });
        });

        assert_eq!(router.len(), 2);
        let found = router.find(&Method::POST, "/alice/repo/settings").unwrap();
        assert_eq!(found.route.pattern(), "/:username/:reponame/settings");
        assert_eq!(found.route.stages().len(), 3);
    }

    #[test]
    fn methods_and_trailing_slash() {
        let mut router = Router::new();
        router.get("/user/login", vec![], noop);
        router.any("/api/v1/*", vec![], noop);

        assert!(router.find(&Method::HEAD, "/user/login/").is_some());
        assert!(router.find(&Method::DELETE, "/user/login").is_none());
        assert!(router.find(&Method::PATCH, "/api/v1/nothing/here").is_some());
        assert!(router.find(&Method::GET, "/this/does/not/exist").is_none());
    }

    #[test]
    fn root_route_matches_only_root() {
        let mut router = Router::new();
        router.get("/", vec![], noop);
        assert!(router.find(&Method::GET, "/").is_some());
        assert!(router.find(&Method::GET, "/x").is_none());
    }

    #[test]
    #[should_panic(expected = "wildcard must be the last segment")]
    fn wildcard_in_middle_panics() {
        Router::new().get("/a/*/b", vec![], noop);
    }
}
