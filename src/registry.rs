//! Route registry - maps request paths to a backend target and required roles
//!
//! Patterns are path templates:
//!
//! - literal segments (`/api/v1/orders`)
//! - single-segment placeholders (`{id}`), matching any non-empty run of
//!   non-slash characters
//! - an optional trailing catch-all (`*` or `{*rest}`), matching one or more
//!   remaining segments
//!
//! Every pattern is anchored at both ends, so `/orders/{id}` never matches
//! `/orders/1/items`. When several patterns match, the most specific one wins:
//! longest literal prefix first, then fewest placeholders, then
//! non-catch-all before catch-all, then registration order. The ordering is
//! computed once at build time and [`RouteRegistry::resolve`] returns the first
//! match, so resolution does not depend on map iteration order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::{Error, Result};

/// Pattern syntax errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// Pattern does not start with `/`
    #[error("route pattern must start with '/': {0}")]
    NotAbsolute(String),

    /// `{}` placeholder without a name
    #[error("empty placeholder in route pattern: {0}")]
    EmptyPlaceholder(String),

    /// Unbalanced or embedded braces
    #[error("malformed placeholder in route pattern: {0}")]
    MalformedPlaceholder(String),

    /// Catch-all somewhere other than the last segment
    #[error("catch-all must be the last segment: {0}")]
    MisplacedCatchAll(String),
}

/// A registered route: where matching requests go and who may call them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    /// Logical service name from configuration
    pub service: String,
    /// Path template
    pub pattern: String,
    /// Backend base URL
    pub target: String,
    /// Roles allowed to call this route (empty = public)
    pub required_roles: BTreeSet<String>,
}

impl ServiceRoute {
    /// Create a route
    pub fn new(
        service: impl Into<String>,
        pattern: impl Into<String>,
        target: impl Into<String>,
        required_roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            service: service.into(),
            pattern: pattern.into(),
            target: target.into(),
            required_roles: required_roles.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the route can be called without a token
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.required_roles.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    CatchAll,
}

fn parse_pattern(pattern: &str) -> std::result::Result<Vec<Segment>, PatternError> {
    let Some(rest) = pattern.strip_prefix('/') else {
        return Err(PatternError::NotAbsolute(pattern.to_string()));
    };

    let raw: Vec<&str> = rest.split('/').collect();
    let last = raw.len() - 1;
    let mut segments = Vec::with_capacity(raw.len());

    for (i, seg) in raw.iter().enumerate() {
        let parsed = if *seg == "*" {
            Segment::CatchAll
        } else if let Some(inner) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if inner.contains(['{', '}']) {
                return Err(PatternError::MalformedPlaceholder(pattern.to_string()));
            }
            match inner.strip_prefix('*') {
                Some(name) if !name.is_empty() => Segment::CatchAll,
                Some(_) => return Err(PatternError::EmptyPlaceholder(pattern.to_string())),
                None if inner.is_empty() => {
                    return Err(PatternError::EmptyPlaceholder(pattern.to_string()));
                }
                None => Segment::Param,
            }
        } else if seg.contains(['{', '}']) {
            return Err(PatternError::MalformedPlaceholder(pattern.to_string()));
        } else {
            Segment::Literal((*seg).to_string())
        };

        if parsed == Segment::CatchAll && i != last {
            return Err(PatternError::MisplacedCatchAll(pattern.to_string()));
        }
        segments.push(parsed);
    }

    Ok(segments)
}

/// A route with its matcher and precomputed specificity.
#[derive(Debug)]
struct CompiledRoute {
    route: ServiceRoute,
    matcher: Regex,
    literal_prefix: usize,
    placeholders: usize,
    catch_all: bool,
    order: usize,
}

impl CompiledRoute {
    fn compile(route: ServiceRoute, order: usize) -> std::result::Result<Self, PatternError> {
        let segments = parse_pattern(&route.pattern)?;

        let mut source = String::from("^");
        let mut literal_prefix = 0;
        let mut in_prefix = true;
        let mut placeholders = 0;
        let mut catch_all = false;

        for segment in &segments {
            source.push('/');
            match segment {
                Segment::Literal(lit) => {
                    source.push_str(&regex::escape(lit));
                    if in_prefix {
                        literal_prefix += 1 + lit.len();
                    }
                }
                Segment::Param => {
                    source.push_str("[^/]+");
                    placeholders += 1;
                    if in_prefix {
                        literal_prefix += 1;
                        in_prefix = false;
                    }
                }
                Segment::CatchAll => {
                    source.push_str(".+");
                    placeholders += 1;
                    catch_all = true;
                    if in_prefix {
                        literal_prefix += 1;
                        in_prefix = false;
                    }
                }
            }
        }
        source.push('$');

        let matcher = Regex::new(&source)
            .map_err(|_| PatternError::MalformedPlaceholder(route.pattern.clone()))?;

        Ok(Self {
            route,
            matcher,
            literal_prefix,
            placeholders,
            catch_all,
            order,
        })
    }

    fn priority(&self) -> (Reverse<usize>, usize, bool, usize) {
        (
            Reverse(self.literal_prefix),
            self.placeholders,
            self.catch_all,
            self.order,
        )
    }
}

/// Builder collecting routes in registration order.
#[derive(Debug, Default)]
pub struct RouteRegistryBuilder {
    routes: Vec<CompiledRoute>,
}

impl RouteRegistryBuilder {
    /// Register a route. Later registrations lose ties against earlier ones.
    pub fn route(mut self, route: ServiceRoute) -> std::result::Result<Self, PatternError> {
        let order = self.routes.len();
        self.routes.push(CompiledRoute::compile(route, order)?);
        Ok(self)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(mut self) -> RouteRegistry {
        self.routes.sort_by_key(CompiledRoute::priority);
        RouteRegistry {
            routes: self.routes,
        }
    }
}

/// Immutable route table, shared read-only across request handlers.
#[derive(Debug)]
pub struct RouteRegistry {
    routes: Vec<CompiledRoute>,
}

impl RouteRegistry {
    /// Start an empty registry
    #[must_use]
    pub fn builder() -> RouteRegistryBuilder {
        RouteRegistryBuilder::default()
    }

    /// Build the registry from the configured services.
    ///
    /// Services and their routes are registered in key order. A pattern
    /// registered by two services is rejected as ambiguous.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid or duplicated pattern.
    pub fn from_services(services: &BTreeMap<String, ServiceConfig>) -> Result<Self> {
        let mut builder = Self::builder();
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();

        for (name, service) in services {
            if url::Url::parse(&service.target).is_err() {
                warn!(service = %name, target = %service.target, "Service target is not a valid URL; requests will fail with 502");
            }

            for (pattern, roles) in &service.routes {
                if let Some(other) = owners.insert(pattern.as_str(), name.as_str()) {
                    return Err(Error::Config(format!(
                        "Route pattern '{pattern}' is registered by both '{other}' and '{name}'"
                    )));
                }

                builder = builder
                    .route(ServiceRoute::new(
                        name.as_str(),
                        pattern.as_str(),
                        service.target.as_str(),
                        roles.iter().map(String::as_str),
                    ))
                    .map_err(|e| Error::Config(e.to_string()))?;
            }
        }

        Ok(builder.build())
    }

    /// Find the most specific route matching the full `path`.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&ServiceRoute> {
        self.routes
            .iter()
            .find(|r| r.matcher.is_match(path))
            .map(|r| &r.route)
    }

    /// Routes in match-priority order
    pub fn routes(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.routes.iter().map(|r| &r.route)
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
