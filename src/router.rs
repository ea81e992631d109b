//! router -- maps a request path to a chain of handlers.
//!
//! `Router` is the seam. `Routes` is a plain table implementation:
//! literal components, `{name}` variables, and a trailing `*` that
//! matches the rest of the path.
//
use crate::request::{HttpMethod, Request};
use crate::response::Response;
use anyhow::Error;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next handler in the chain.
    Next,
    /// Response is complete. Stop here.
    Complete,
}

/// Trait for callback
pub trait Handler: Send + Sync {
    /// Caller must provide handler fn. Fills in the response; may push it early.
    fn handle(&self, request: &Request, response: &mut Response<'_>) -> Result<Flow, Error>;
}

/// Plain functions and closures work as handlers.
impl<F> Handler for F
where
    F: Fn(&Request, &mut Response<'_>) -> Result<Flow, Error> + Send + Sync,
{
    fn handle(&self, request: &Request, response: &mut Response<'_>) -> Result<Flow, Error> {
        self(request, response)
    }
}

/// Handlers found for a path.
#[derive(Clone)]
pub struct RouteMatch {
    pub handlers: Vec<Arc<dyn Handler>>,
    /// `{name}` components from the route, with the path text they matched.
    pub url_variables: HashMap<String, String>,
}

/// Finds the handler chain for a request.
pub trait Router: Send + Sync {
    fn find_handlers(&self, path_components: &[String], request: &Request) -> Option<RouteMatch>;
}

/// One component of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
    /// Matches everything after this point, including nothing.
    Rest,
}

struct Route {
    method: Option<HttpMethod>,
    segments: Vec<Segment>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Route {
    fn parse(pattern: &str) -> Vec<Segment> {
        pattern
            .split('/')
            .filter(|c| !c.is_empty())
            .map(|c| {
                if c == "*" {
                    Segment::Rest
                } else if let Some(name) = c.strip_prefix('{').and_then(|c| c.strip_suffix('}')) {
                    Segment::Variable(name.to_string())
                } else {
                    Segment::Literal(c.to_string())
                }
            })
            .collect()
    }

    /// Variables bound if `path` matches.
    fn matches(&self, path: &[String], method: &HttpMethod) -> Option<HashMap<String, String>> {
        if self.method.as_ref().is_some_and(|m| m != method) {
            return None;
        }
        let mut vars = HashMap::new();
        let mut components = path.iter();
        for segment in &self.segments {
            match segment {
                Segment::Rest => return Some(vars),
                Segment::Literal(lit) => {
                    if components.next()? != lit {
                        return None;
                    }
                }
                Segment::Variable(name) => {
                    vars.insert(name.clone(), components.next()?.clone());
                }
            }
        }
        match components.next() {
            Some(_) => None,
            None => Some(vars),
        }
    }
}

/// Route table. First matching route wins.
#[derive(Default)]
pub struct Routes {
    routes: Vec<Route>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route any method on `pattern` to a handler chain.
    pub fn add(&mut self, pattern: &str, handlers: Vec<Arc<dyn Handler>>) -> &mut Self {
        self.routes.push(Route {
            method: None,
            segments: Route::parse(pattern),
            handlers,
        });
        self
    }

    /// Route only `method` on `pattern`.
    pub fn add_method(
        &mut self,
        method: HttpMethod,
        pattern: &str,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> &mut Self {
        self.routes.push(Route {
            method: Some(method),
            segments: Route::parse(pattern),
            handlers,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Router for Routes {
    fn find_handlers(&self, path_components: &[String], request: &Request) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route
                .matches(path_components, &request.method)
                .map(|url_variables| RouteMatch {
                    handlers: route.handlers.clone(),
                    url_variables,
                })
        })
    }
}

#[test]
fn routes_match_in_order() {
    fn ok(_request: &Request, _response: &mut Response<'_>) -> Result<Flow, Error> {
        Ok(Flow::Complete)
    }
    let chain = |n: usize| -> Vec<Arc<dyn Handler>> { (0..n).map(|_| Arc::new(ok) as Arc<dyn Handler>).collect() };
    let mut routes = Routes::new();
    routes
        .add_method(HttpMethod::Post, "/items/{id}", chain(1))
        .add("/items/{id}/parts/{part}", chain(2))
        .add("/static/*", chain(1))
        .add("/", chain(1));
    assert_eq!(routes.len(), 4);
    let path = |p: &str| -> Vec<String> { p.split('/').filter(|c| !c.is_empty()).map(String::from).collect() };
    let mut request = Request::new();

    //  Method-restricted route skipped for GET.
    assert!(routes.find_handlers(&path("/items/7"), &request).is_none());
    request.method = HttpMethod::Post;
    let found = routes.find_handlers(&path("/items/7"), &request).expect("no route");
    assert_eq!(found.url_variables.get("id").map(String::as_str), Some("7"));

    let found = routes
        .find_handlers(&path("/items/7/parts/wheel"), &request)
        .expect("no route");
    assert_eq!(found.handlers.len(), 2);
    assert_eq!(found.url_variables.get("part").map(String::as_str), Some("wheel"));

    assert!(routes.find_handlers(&path("/static/css/site.css"), &request).is_some());
    assert!(routes.find_handlers(&path("/static"), &request).is_some());
    assert!(routes.find_handlers(&path("/"), &request).is_some());
    assert!(routes.find_handlers(&path("/nothing/here"), &request).is_none());
}
