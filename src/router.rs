//! Request routing: `(method, path)` to handler.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::Method;
use tracing::warn;

use crate::error::{Error, Result, User};
use crate::request::Request;
use crate::response::{Response, ResponseWriter};

/// Number of routable methods; bit positions mirror [`method_idx`].
pub(crate) const NB_METHODS: usize = 9;

/// Ordinal for the method bitmask: GET, HEAD, POST, PUT, DELETE, CONNECT,
/// OPTIONS, TRACE, PATCH.
pub(crate) fn method_idx(method: &Method) -> Option<usize> {
    Some(match *method {
        Method::GET => 0,
        Method::HEAD => 1,
        Method::POST => 2,
        Method::PUT => 3,
        Method::DELETE => 4,
        Method::CONNECT => 5,
        Method::OPTIONS => 6,
        Method::TRACE => 7,
        Method::PATCH => 8,
        _ => return None,
    })
}

const METHOD_NAMES: [&str; NB_METHODS] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// A set of HTTP methods, stored as a bitmask over the method ordinals.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodSet(u16);

impl MethodSet {
    pub const GET: MethodSet = MethodSet(1 << 0);
    pub const HEAD: MethodSet = MethodSet(1 << 1);
    pub const POST: MethodSet = MethodSet(1 << 2);
    pub const PUT: MethodSet = MethodSet(1 << 3);
    pub const DELETE: MethodSet = MethodSet(1 << 4);
    pub const CONNECT: MethodSet = MethodSet(1 << 5);
    pub const OPTIONS: MethodSet = MethodSet(1 << 6);
    pub const TRACE: MethodSet = MethodSet(1 << 7);
    pub const PATCH: MethodSet = MethodSet(1 << 8);

    pub const fn empty() -> MethodSet {
        MethodSet(0)
    }

    pub fn all() -> MethodSet {
        MethodSet((1 << NB_METHODS) - 1)
    }

    pub fn contains(self, method: &Method) -> bool {
        method_idx(method).is_some_and(|idx| self.0 & (1 << idx) != 0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn contains_idx(self, idx: usize) -> bool {
        self.0 & (1 << idx) != 0
    }

    fn iter_indices(self) -> impl Iterator<Item = usize> {
        (0..NB_METHODS).filter(move |&idx| self.contains_idx(idx))
    }

    /// Comma-joined method list, for `Allow:` headers.
    pub fn to_allow_header(self) -> String {
        let mut out = String::new();
        for idx in self.iter_indices() {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(METHOD_NAMES[idx]);
        }
        out
    }
}

impl std::ops::BitOr for MethodSet {
    type Output = MethodSet;
    fn bitor(self, rhs: MethodSet) -> MethodSet {
        MethodSet(self.0 | rhs.0)
    }
}

impl From<Method> for MethodSet {
    fn from(method: Method) -> MethodSet {
        method_idx(&method).map_or(MethodSet::empty(), |idx| MethodSet(1 << idx))
    }
}

impl fmt::Debug for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodSet({})", self.to_allow_header())
    }
}

/// Synchronous handler: runs to completion on the reactor thread.
pub type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Streaming handler: emits the response incrementally through a writer.
pub type StreamingHandler =
    Arc<dyn Fn(&Request, &mut ResponseWriter) -> Result<()> + Send + Sync>;

/// Async handler: returns a task the reactor polls to completion. The future
/// does not need `Send`; it is polled on the reactor that created it.
pub type AsyncHandler =
    Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response>>> + Send + Sync>;

/// A handler in any of its three flavors.
#[derive(Clone)]
pub enum RouteHandler {
    Sync(Handler),
    Streaming(StreamingHandler),
    Async(AsyncHandler),
}

impl RouteHandler {
    pub fn sync<F>(handler: F) -> RouteHandler
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        RouteHandler::Sync(Arc::new(handler))
    }

    pub fn streaming<F>(handler: F) -> RouteHandler
    where
        F: Fn(&Request, &mut ResponseWriter) -> Result<()> + Send + Sync + 'static,
    {
        RouteHandler::Streaming(Arc::new(handler))
    }

    pub fn asynchronous<F, Fut>(handler: F) -> RouteHandler
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + 'static,
    {
        RouteHandler::Async(Arc::new(move |req| Box::pin(handler(req))))
    }

    fn is_streaming(&self) -> bool {
        matches!(self, RouteHandler::Streaming(_))
    }
}

impl fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteHandler::Sync(_) => "RouteHandler::Sync",
            RouteHandler::Streaming(_) => "RouteHandler::Streaming",
            RouteHandler::Async(_) => "RouteHandler::Async",
        })
    }
}

/// Trailing-slash handling for registrations and lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailingSlashPolicy {
    /// `/a` and `/a/` are distinct paths.
    Strict,
    /// `/a` and `/a/` share one canonical entry.
    #[default]
    Normalize,
    /// 301 to whichever form was registered.
    Redirect,
}

#[derive(Default)]
struct PathEntry {
    method_mask: MethodSet,
    handlers: [Option<RouteHandler>; NB_METHODS],
    /// Registered form carried a trailing slash that was stripped.
    is_normalized: bool,
}

impl PathEntry {
    fn register(&mut self, path: &str, methods: MethodSet, handler: &RouteHandler) -> Result<()> {
        for idx in methods.iter_indices() {
            if let Some(existing) = &self.handlers[idx] {
                if existing.is_streaming() != handler.is_streaming() {
                    return Err(Error::new_user(User::HandlerConflict).with(path.to_owned()));
                }
                warn!(path, method = METHOD_NAMES[idx], "overwriting existing path handler");
            }
            self.handlers[idx] = Some(handler.clone());
        }
        self.method_mask = self.method_mask | methods;
        Ok(())
    }

    fn lookup(&self, method: &Method) -> Lookup<'_> {
        let Some(mut idx) = method_idx(method) else {
            return Lookup::NotAllowed;
        };
        let mut head_fallback = false;
        // HEAD is identical to GET without a body; fall back when only a
        // GET handler exists (RFC 7231 §4.3.2).
        if *method == Method::HEAD && self.handlers[idx].is_none() {
            let get_idx = 0;
            if self.handlers[get_idx].is_some() {
                idx = get_idx;
                head_fallback = true;
            }
        }
        match self.handlers[idx] {
            Some(ref handler) => Lookup::Found {
                handler,
                head_fallback,
            },
            None => Lookup::NotAllowed,
        }
    }
}

enum Lookup<'r> {
    Found {
        handler: &'r RouteHandler,
        head_fallback: bool,
    },
    NotAllowed,
}

/// One segment of a registered pattern path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{name}`: matches one non-empty segment and captures it.
    Param(String),
}

struct PatternRoute {
    segments: Vec<Segment>,
    entry: PathEntry,
    is_normalized: bool,
}

/// Outcome of matching `(method, path)` against the routing table.
#[derive(Debug)]
pub enum RoutingResult<'r> {
    /// A handler matched; `path_params` holds `{name}` captures.
    Handler {
        handler: &'r RouteHandler,
        path_params: Vec<(String, String)>,
        /// HEAD was served by the GET handler; suppress the body.
        head_fallback: bool,
    },
    /// The path exists but not for this method.
    MethodNotAllowed { allowed: MethodSet },
    /// 301 to the slashed form of the path.
    RedirectAddSlash,
    /// 301 to the slashless form of the path.
    RedirectRemoveSlash,
    /// Nothing registered for this path, and no default handler.
    NotFound,
}

/// Maps `(method, path)` to registered handlers.
pub struct Router {
    policy: TrailingSlashPolicy,
    paths: HashMap<String, PathEntry>,
    patterns: Vec<PatternRoute>,
    default_handler: Option<RouteHandler>,
}

impl Router {
    pub fn new() -> Router {
        Router::with_policy(TrailingSlashPolicy::default())
    }

    pub fn with_policy(policy: TrailingSlashPolicy) -> Router {
        Router {
            policy,
            paths: HashMap::new(),
            patterns: Vec::new(),
            default_handler: None,
        }
    }

    /// Fallback for unmatched paths.
    pub fn set_default(&mut self, handler: RouteHandler) {
        if self.default_handler.is_some() {
            warn!("overwriting existing default handler");
        }
        self.default_handler = Some(handler);
    }

    /// Registers `handler` for every method in `methods` at `path`.
    ///
    /// Segments of the form `{name}` match any single non-empty segment and
    /// capture it. Mixing sync and streaming handlers on one
    /// `(path, method)` is an error.
    pub fn set_path(
        &mut self,
        path: &str,
        methods: impl Into<MethodSet>,
        handler: RouteHandler,
    ) -> Result<()> {
        let methods = methods.into();
        let normalize =
            self.policy != TrailingSlashPolicy::Strict && path.len() > 1 && path.ends_with('/');
        let canonical = if normalize {
            &path[..path.len() - 1]
        } else {
            path
        };

        if canonical.split('/').any(|seg| is_param_segment(seg)) {
            let segments = canonical
                .split('/')
                .skip(1)
                .map(|seg| match param_name(seg) {
                    Some(name) => Segment::Param(name.to_owned()),
                    None => Segment::Literal(seg.to_owned()),
                })
                .collect::<Vec<_>>();
            if let Some(route) = self
                .patterns
                .iter_mut()
                .find(|route| route.segments == segments)
            {
                route.entry.register(path, methods, &handler)?;
                route.is_normalized = normalize;
                return Ok(());
            }
            let mut entry = PathEntry::default();
            entry.register(path, methods, &handler)?;
            self.patterns.push(PatternRoute {
                segments,
                entry,
                is_normalized: normalize,
            });
            return Ok(());
        }

        let entry = self.paths.entry(canonical.to_owned()).or_default();
        entry.register(path, methods, &handler)?;
        entry.is_normalized = normalize;
        Ok(())
    }

    /// All methods registered for `path`, for `Allow:` lists. When only the
    /// default handler exists it is treated as allowing every method.
    pub fn allowed_methods(&self, path: &str) -> MethodSet {
        let lookup_path = self.normalized(path);
        if let Some(entry) = self.paths.get(lookup_path) {
            return entry.method_mask;
        }
        if let Some((route, _)) = self.match_pattern(lookup_path) {
            return route.entry.method_mask;
        }
        if self.default_handler.is_some() {
            return MethodSet::all();
        }
        MethodSet::empty()
    }

    /// Resolves a request to a handler or a routing verdict.
    pub fn match_route(&self, method: &Method, path: &str) -> RoutingResult<'_> {
        let lookup_path = self.normalized(path);
        let had_slash = lookup_path.len() != path.len();

        if let Some(entry) = self.paths.get(lookup_path) {
            if let Some(redirect) = self.slash_redirect(entry.is_normalized, had_slash) {
                return redirect;
            }
            return self.finish_lookup(entry, method, Vec::new());
        }

        if let Some((route, params)) = self.match_pattern(lookup_path) {
            if let Some(redirect) = self.slash_redirect(route.is_normalized, had_slash) {
                return redirect;
            }
            return self.finish_lookup(&route.entry, method, params);
        }

        match self.default_handler {
            Some(ref handler) => RoutingResult::Handler {
                handler,
                path_params: Vec::new(),
                head_fallback: false,
            },
            None => RoutingResult::NotFound,
        }
    }

    fn finish_lookup<'r>(
        &'r self,
        entry: &'r PathEntry,
        method: &Method,
        path_params: Vec<(String, String)>,
    ) -> RoutingResult<'r> {
        match entry.lookup(method) {
            Lookup::Found {
                handler,
                head_fallback,
            } => RoutingResult::Handler {
                handler,
                path_params,
                head_fallback,
            },
            Lookup::NotAllowed => RoutingResult::MethodNotAllowed {
                allowed: entry.method_mask,
            },
        }
    }

    fn normalized<'p>(&self, path: &'p str) -> &'p str {
        if self.policy != TrailingSlashPolicy::Strict && path.len() > 1 && path.ends_with('/') {
            &path[..path.len() - 1]
        } else {
            path
        }
    }

    fn slash_redirect(&self, registered_with_slash: bool, request_had_slash: bool) -> Option<RoutingResult<'_>> {
        if self.policy != TrailingSlashPolicy::Redirect {
            return None;
        }
        match (registered_with_slash, request_had_slash) {
            (true, false) => Some(RoutingResult::RedirectAddSlash),
            (false, true) => Some(RoutingResult::RedirectRemoveSlash),
            _ => None,
        }
    }

    /// Finds the best pattern for `path`: literal segments beat `{name}`
    /// captures position by position; remaining ties go to the earliest
    /// registration.
    fn match_pattern(&self, path: &str) -> Option<(&PatternRoute, Vec<(String, String)>)> {
        if !path.starts_with('/') {
            return None;
        }
        let request_segments: Vec<&str> = path.split('/').skip(1).collect();

        let mut best: Option<&PatternRoute> = None;
        for route in &self.patterns {
            if !segments_match(&route.segments, &request_segments) {
                continue;
            }
            best = Some(match best {
                None => route,
                Some(current) if pattern_beats(&route.segments, &current.segments) => route,
                Some(current) => current,
            });
        }

        best.map(|route| {
            let params = route
                .segments
                .iter()
                .zip(&request_segments)
                .filter_map(|(segment, &value)| match segment {
                    Segment::Param(name) => Some((name.clone(), value.to_owned())),
                    Segment::Literal(_) => None,
                })
                .collect();
            (route, params)
        })
    }
}

impl Default for Router {
    fn default() -> Router {
        Router::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("policy", &self.policy)
            .field("paths", &self.paths.len())
            .field("patterns", &self.patterns.len())
            .field("has_default", &self.default_handler.is_some())
            .finish()
    }
}

fn is_param_segment(segment: &str) -> bool {
    param_name(segment).is_some()
}

fn param_name(segment: &str) -> Option<&str> {
    segment
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

fn segments_match(pattern: &[Segment], request: &[&str]) -> bool {
    pattern.len() == request.len()
        && pattern.iter().zip(request).all(|(segment, &value)| match segment {
            Segment::Literal(literal) => literal == value,
            Segment::Param(_) => !value.is_empty(),
        })
}

/// True when `a` wins over `b`: its first differing position is a literal.
fn pattern_beats(a: &[Segment], b: &[Segment]) -> bool {
    for (left, right) in a.iter().zip(b) {
        match (left, right) {
            (Segment::Literal(_), Segment::Param(_)) => return true,
            (Segment::Param(_), Segment::Literal(_)) => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn ok_handler(tag: &'static str) -> RouteHandler {
        RouteHandler::sync(move |_req| Response::text(StatusCode::OK, tag))
    }

    fn matched_tag(router: &Router, method: Method, path: &str) -> Option<&'static str> {
        match router.match_route(&method, path) {
            RoutingResult::Handler { handler, .. } => match handler {
                RouteHandler::Sync(_) => Some("sync"),
                RouteHandler::Streaming(_) => Some("streaming"),
                RouteHandler::Async(_) => Some("async"),
            },
            _ => None,
        }
    }

    #[test]
    fn exact_match_and_method_mask() {
        let mut router = Router::new();
        router
            .set_path("/a", MethodSet::GET | MethodSet::POST, ok_handler("a"))
            .unwrap();
        assert!(matched_tag(&router, Method::GET, "/a").is_some());
        assert!(matched_tag(&router, Method::POST, "/a").is_some());
        match router.match_route(&Method::DELETE, "/a") {
            RoutingResult::MethodNotAllowed { allowed } => {
                assert_eq!(allowed.to_allow_header(), "GET, POST");
            }
            _ => panic!("expected MethodNotAllowed"),
        }
    }

    #[test]
    fn not_found_without_default() {
        let router = Router::new();
        assert!(matches!(
            router.match_route(&Method::GET, "/missing"),
            RoutingResult::NotFound
        ));
    }

    #[test]
    fn default_handler_catches_unmatched() {
        let mut router = Router::new();
        router.set_default(ok_handler("default"));
        assert!(matched_tag(&router, Method::GET, "/anything").is_some());
        assert_eq!(router.allowed_methods("/anything"), MethodSet::all());
    }

    #[test]
    fn head_falls_back_to_get() {
        let mut router = Router::new();
        router.set_path("/a", MethodSet::GET, ok_handler("a")).unwrap();
        match router.match_route(&Method::HEAD, "/a") {
            RoutingResult::Handler { head_fallback, .. } => assert!(head_fallback),
            _ => panic!("expected fallback handler"),
        }
    }

    #[test]
    fn explicit_head_wins_over_fallback() {
        let mut router = Router::new();
        router.set_path("/a", MethodSet::GET, ok_handler("get")).unwrap();
        router.set_path("/a", MethodSet::HEAD, ok_handler("head")).unwrap();
        match router.match_route(&Method::HEAD, "/a") {
            RoutingResult::Handler { head_fallback, .. } => assert!(!head_fallback),
            _ => panic!("expected handler"),
        }
    }

    #[test]
    fn sync_streaming_conflict() {
        let mut router = Router::new();
        router.set_path("/a", MethodSet::GET, ok_handler("a")).unwrap();
        let err = router
            .set_path(
                "/a",
                MethodSet::GET,
                RouteHandler::streaming(|_req, writer| {
                    writer.end();
                    Ok(())
                }),
            )
            .unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn normalize_policy_shares_canonical_entry() {
        let mut router = Router::with_policy(TrailingSlashPolicy::Normalize);
        router.set_path("/a/", MethodSet::GET, ok_handler("a")).unwrap();
        assert!(matched_tag(&router, Method::GET, "/a").is_some());
        assert!(matched_tag(&router, Method::GET, "/a/").is_some());
    }

    #[test]
    fn strict_policy_distinguishes() {
        let mut router = Router::with_policy(TrailingSlashPolicy::Strict);
        router.set_path("/a", MethodSet::GET, ok_handler("a")).unwrap();
        assert!(matched_tag(&router, Method::GET, "/a").is_some());
        assert!(matched_tag(&router, Method::GET, "/a/").is_none());
    }

    #[test]
    fn redirect_policy_both_directions() {
        let mut router = Router::with_policy(TrailingSlashPolicy::Redirect);
        router.set_path("/slashed/", MethodSet::GET, ok_handler("s")).unwrap();
        router.set_path("/bare", MethodSet::GET, ok_handler("b")).unwrap();
        assert!(matches!(
            router.match_route(&Method::GET, "/slashed"),
            RoutingResult::RedirectAddSlash
        ));
        assert!(matches!(
            router.match_route(&Method::GET, "/slashed/"),
            RoutingResult::Handler { .. }
        ));
        assert!(matches!(
            router.match_route(&Method::GET, "/bare/"),
            RoutingResult::RedirectRemoveSlash
        ));
        assert!(matches!(
            router.match_route(&Method::GET, "/bare"),
            RoutingResult::Handler { .. }
        ));
    }

    #[test]
    fn pattern_capture() {
        let mut router = Router::new();
        router
            .set_path("/users/{id}/posts/{post}", MethodSet::GET, ok_handler("u"))
            .unwrap();
        match router.match_route(&Method::GET, "/users/42/posts/7") {
            RoutingResult::Handler { path_params, .. } => {
                assert_eq!(
                    path_params,
                    vec![
                        ("id".to_owned(), "42".to_owned()),
                        ("post".to_owned(), "7".to_owned())
                    ]
                );
            }
            _ => panic!("expected pattern match"),
        }
        assert!(matched_tag(&router, Method::GET, "/users/42").is_none());
    }

    #[test]
    fn empty_segment_does_not_match_param() {
        let mut router = Router::new();
        router.set_path("/users/{id}", MethodSet::GET, ok_handler("u")).unwrap();
        assert!(matches!(
            router.match_route(&Method::GET, "/users//"),
            RoutingResult::NotFound
        ));
    }

    #[test]
    fn literal_beats_pattern() {
        let mut router = Router::new();
        router.set_path("/files/{name}", MethodSet::GET, ok_handler("pattern")).unwrap();
        router.set_path("/files/index", MethodSet::GET, ok_handler("literal")).unwrap();
        // Exact paths are indexed separately and always win.
        match router.match_route(&Method::GET, "/files/index") {
            RoutingResult::Handler { path_params, .. } => assert!(path_params.is_empty()),
            _ => panic!("expected literal match"),
        }
    }

    #[test]
    fn literal_segment_beats_param_among_patterns() {
        let mut router = Router::new();
        router.set_path("/a/{x}/c", MethodSet::GET, ok_handler("x")).unwrap();
        router.set_path("/a/b/{y}", MethodSet::GET, ok_handler("y")).unwrap();
        match router.match_route(&Method::GET, "/a/b/c") {
            RoutingResult::Handler { path_params, .. } => {
                assert_eq!(path_params, vec![("y".to_owned(), "c".to_owned())]);
            }
            _ => panic!("expected pattern match"),
        }
    }

    #[test]
    fn first_registered_pattern_wins_ties() {
        let mut router = Router::new();
        router.set_path("/t/{a}", MethodSet::GET, ok_handler("first")).unwrap();
        router.set_path("/t/{b}", MethodSet::GET, ok_handler("second")).unwrap();
        match router.match_route(&Method::GET, "/t/v") {
            RoutingResult::Handler { path_params, .. } => {
                assert_eq!(path_params[0].0, "a");
            }
            _ => panic!("expected pattern match"),
        }
    }
}
