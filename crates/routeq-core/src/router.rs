//! Topic router
//!
//! Compiles registered topic patterns into a tree of literal and parameter
//! segments. A segment starting with `:` is a named parameter; anything
//! else is a literal. The tree is only built at registration time, so
//! matching takes `&self` and is safe to share across tasks.

use std::collections::HashMap;

use routeq_types::{Error, Result};

/// Segment separator for patterns and topics
pub const SEPARATOR: char = '/';

/// Prefix marking a named parameter segment
pub const PARAM_MARKER: char = ':';

/// Single-level wildcard that parameter segments normalize to
pub const WILDCARD: &str = "+";

#[derive(Debug)]
struct RouteNode<T> {
    literals: HashMap<String, RouteNode<T>>,
    param: Option<Box<ParamNode<T>>>,
    handler: Option<T>,
}

#[derive(Debug)]
struct ParamNode<T> {
    name: String,
    node: RouteNode<T>,
}

impl<T> RouteNode<T> {
    fn new() -> Self {
        Self {
            literals: HashMap::new(),
            param: None,
            handler: None,
        }
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    let path = path.trim_matches(SEPARATOR);
    // An empty path has no segments rather than one empty segment.
    path.split(SEPARATOR).filter(move |_| !path.is_empty())
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment<'_>>> {
    segments(pattern)
        .map(|token| match token.strip_prefix(PARAM_MARKER) {
            Some(name) => {
                let name = name.trim();
                if name.is_empty() {
                    Err(Error::InvalidConfig(format!(
                        "empty parameter name in pattern '{pattern}'"
                    )))
                } else {
                    Ok(Segment::Param(name))
                }
            }
            None => Ok(Segment::Literal(token)),
        })
        .collect()
}

/// Result of a successful [`Router::match_route`]
#[derive(Debug)]
pub struct RouteMatch<'a, T> {
    pub handler: &'a T,
    pub params: HashMap<String, String>,
}

/// Pattern tree mapping topics to handlers
#[derive(Debug)]
pub struct Router<T> {
    root: RouteNode<T>,
    routes: usize,
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self {
            root: RouteNode::new(),
            routes: 0,
        }
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes == 0
    }

    /// Register `handler` under `pattern`
    ///
    /// Returns the normalized pattern with every parameter segment
    /// replaced by [`WILDCARD`], suitable as a broker-native subscription
    /// filter. Fails without touching the tree when the path already has a
    /// handler or a parameter at some depth is named differently than the
    /// one already registered there.
    pub fn add_route(&mut self, pattern: &str, handler: T) -> Result<String> {
        let parsed = parse_pattern(pattern)?;
        let normalized = parsed
            .iter()
            .map(|segment| match segment {
                Segment::Literal(token) => *token,
                Segment::Param(_) => WILDCARD,
            })
            .collect::<Vec<_>>()
            .join("/");

        self.check_insert(pattern, &parsed, &normalized)?;

        let mut node = &mut self.root;
        for segment in &parsed {
            node = match segment {
                Segment::Literal(token) => node
                    .literals
                    .entry((*token).to_string())
                    .or_insert_with(RouteNode::new),
                Segment::Param(name) => {
                    &mut node
                        .param
                        .get_or_insert_with(|| {
                            Box::new(ParamNode {
                                name: (*name).to_string(),
                                node: RouteNode::new(),
                            })
                        })
                        .node
                }
            };
        }
        node.handler = Some(handler);
        self.routes += 1;

        Ok(normalized)
    }

    fn check_insert(&self, pattern: &str, parsed: &[Segment<'_>], normalized: &str) -> Result<()> {
        let mut node = Some(&self.root);
        for segment in parsed {
            let Some(current) = node else {
                return Ok(());
            };
            node = match segment {
                Segment::Literal(token) => current.literals.get(*token),
                Segment::Param(name) => match &current.param {
                    Some(param) if param.name != *name => {
                        return Err(Error::ParamConflict {
                            pattern: pattern.to_string(),
                            existing: param.name.clone(),
                            found: (*name).to_string(),
                        });
                    }
                    Some(param) => Some(&param.node),
                    None => None,
                },
            };
        }

        match node {
            Some(terminal) if terminal.handler.is_some() => {
                Err(Error::DuplicateRoute(normalized.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Resolve a concrete topic
    ///
    /// At each depth a literal child wins over the parameter child; the
    /// parameter child binds the segment under its name. There is no
    /// backtracking and no partial match: the walk must consume every
    /// segment and end on a node with a handler.
    pub fn match_route(&self, topic: &str) -> Option<RouteMatch<'_, T>> {
        let mut params = HashMap::new();
        let mut node = &self.root;

        for token in segments(topic) {
            node = match (node.literals.get(token), &node.param) {
                (Some(child), _) => child,
                (None, Some(param)) => {
                    params.insert(param.name.clone(), token.to_string());
                    &param.node
                }
                (None, None) => return None,
            };
        }

        node.handler.as_ref().map(|handler| RouteMatch { handler, params })
    }
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_beats_parameter() {
        let mut router = Router::new();
        router.add_route("/a/:id", "param").unwrap();
        router.add_route("/a/b", "literal").unwrap();

        let found = router.match_route("a/b").unwrap();
        assert_eq!(*found.handler, "literal");
        assert!(found.params.is_empty());

        let found = router.match_route("a/c").unwrap();
        assert_eq!(*found.handler, "param");
        assert_eq!(found.params.get("id").map(String::as_str), Some("c"));
    }

    #[test]
    fn test_parameter_binding() {
        let mut router = Router::new();
        let normalized = router.add_route("/user/:id/order/:oid", 1).unwrap();
        assert_eq!(normalized, "user/+/order/+");

        let found = router.match_route("user/42/order/7").unwrap();
        assert_eq!(found.params.len(), 2);
        assert_eq!(found.params["id"], "42");
        assert_eq!(found.params["oid"], "7");
    }

    #[test]
    fn test_segment_count_mismatch_does_not_match() {
        let mut router = Router::new();
        router.add_route("/a/b", ()).unwrap();

        assert!(router.match_route("/a").is_none());
        assert!(router.match_route("/a/b/c").is_none());
        assert!(router.match_route("/a/b").is_some());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut router = Router::new();
        router.add_route("orders/:id", 1).unwrap();

        let err = router.add_route("/orders/:id/", 2).unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute(ref p) if p == "orders/+"));
        assert!(err.is_configuration());
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_parameter_name_conflict_rejected() {
        let mut router = Router::new();
        router.add_route("user/:id/profile", 1).unwrap();

        let err = router.add_route("user/:uid/orders", 2).unwrap_err();
        match err {
            Error::ParamConflict { existing, found, .. } => {
                assert_eq!(existing, "id");
                assert_eq!(found, "uid");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Same name at the same depth shares the parameter node
        router.add_route("user/:id/orders", 3).unwrap();
        let found = router.match_route("user/9/orders").unwrap();
        assert_eq!(*found.handler, 3);
    }

    #[test]
    fn test_empty_pattern_is_root_handler() {
        let mut router = Router::new();
        assert!(router.match_route("").is_none());

        assert_eq!(router.add_route("/", "root").unwrap(), "");
        assert_eq!(*router.match_route("").unwrap().handler, "root");
        assert!(router.match_route("a").is_none());
    }

    #[test]
    fn test_intermediate_node_without_handler() {
        let mut router = Router::new();
        router.add_route("a/b/c", ()).unwrap();
        assert!(router.match_route("a/b").is_none());
    }

    #[test]
    fn test_no_backtracking_after_literal_match() {
        let mut router = Router::new();
        router.add_route("a/b/x", "literal").unwrap();
        router.add_route("a/:p/y", "param").unwrap();

        // Literal `b` is taken at depth 1, so `a/b/y` does not fall back
        assert!(router.match_route("a/b/y").is_none());
        assert_eq!(*router.match_route("a/c/y").unwrap().handler, "param");
    }

    #[test]
    fn test_empty_parameter_name_rejected() {
        let mut router: Router<()> = Router::new();
        let err = router.add_route("a/:/b", ()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
