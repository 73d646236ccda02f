//! Resource routing.
//!
//! Patterns are compiled into a token trie. Resolution walks the trie with
//! backtracking and prefers, at each position, a literal over a placeholder,
//! a placeholder over an anonymous wildcard, and any of those over a trailing
//! full wildcard.

use std::collections::HashMap;
use std::sync::Arc;

use resmesh_core::{PathParams, PatternToken, ResourcePattern};
use tracing::debug;

use crate::error::RegistrationError;
use crate::handler::HandlerEntry;

/// A resolved route.
#[derive(Debug, Clone)]
pub struct Match {
    /// The handler registered for the pattern.
    pub entry: Arc<HandlerEntry>,
    /// The matched pattern.
    pub pattern: String,
    /// Placeholder bindings.
    pub params: PathParams,
    /// Segments matched by a trailing full wildcard, joined by `.`.
    pub tail: Option<String>,
    /// The concurrency group key.
    pub group: String,
}

struct Route {
    pattern: ResourcePattern,
    entry: Arc<HandlerEntry>,
    /// Placeholder names with the token index they bind.
    bindings: Vec<(String, usize)>,
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    wildcard: Option<Box<Node>>,
    full_wildcard: Option<Arc<Route>>,
    route: Option<Arc<Route>>,
}

/// Maps resource names to handler entries.
#[derive(Default)]
pub struct Router {
    root: Node,
    patterns: Vec<String>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` for `pattern`.
    ///
    /// Fails if the pattern is malformed, if its group template references a
    /// tag that is not a placeholder, or if it is ambiguous with a registered
    /// pattern.
    pub fn add(&mut self, pattern: &str, entry: HandlerEntry) -> Result<(), RegistrationError> {
        let pattern = ResourcePattern::parse(pattern)?;

        if let Some(template) = entry.group() {
            let placeholders: Vec<&str> = pattern.placeholders().collect();
            if let Some(tag) = template.tags().find(|tag| !placeholders.contains(tag)) {
                return Err(RegistrationError::UnknownGroupTag {
                    pattern: pattern.to_string(),
                    template: template.to_string(),
                    tag: tag.to_string(),
                });
            }
        }

        let conflict = |reason: String| RegistrationError::ConflictingRegistration {
            pattern: pattern.to_string(),
            reason,
        };

        let mut node = &mut self.root;
        let mut full = false;
        let mut bindings = Vec::new();
        for (idx, token) in pattern.tokens().iter().enumerate() {
            node = match token {
                PatternToken::Literal(s) => node.literals.entry(s.clone()).or_default(),
                PatternToken::Placeholder(name) => {
                    bindings.push((name.clone(), idx));
                    node.param.get_or_insert_with(Box::default).as_mut()
                }
                PatternToken::Wildcard => node.wildcard.get_or_insert_with(Box::default).as_mut(),
                PatternToken::FullWildcard => {
                    full = true;
                    break;
                }
            };
        }

        let slot = if full {
            &mut node.full_wildcard
        } else {
            &mut node.route
        };
        if let Some(existing) = slot.as_ref() {
            return Err(conflict(format!("already registered as '{}'", existing.pattern)));
        }

        debug!(pattern = %pattern, "Resource pattern registered");
        self.patterns.push(pattern.to_string());
        *slot = Some(Arc::new(Route {
            pattern,
            entry: Arc::new(entry),
            bindings,
        }));
        Ok(())
    }

    /// Resolves a concrete resource name.
    pub fn resolve(&self, name: &str) -> Option<Match> {
        if name.is_empty() {
            return None;
        }
        let tokens: Vec<&str> = name.split('.').collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return None;
        }

        let (route, tail) = walk(&self.root, &tokens, 0)?;
        let params: PathParams = route
            .bindings
            .iter()
            .map(|(name, idx)| (name.clone(), tokens[*idx].to_string()))
            .collect();
        let group = match route.entry.group() {
            Some(template) => template.render(&params),
            None => name.to_string(),
        };

        Some(Match {
            entry: route.entry.clone(),
            pattern: route.pattern.to_string(),
            params,
            tail,
            group,
        })
    }

    /// The registered patterns, in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("patterns", &self.patterns)
            .finish()
    }
}

fn walk<'a>(node: &'a Node, tokens: &[&str], i: usize) -> Option<(&'a Arc<Route>, Option<String>)> {
    let Some(&token) = tokens.get(i) else {
        return node.route.as_ref().map(|route| (route, None));
    };

    if let Some(child) = node.literals.get(token)
        && let Some(found) = walk(child, tokens, i + 1)
    {
        return Some(found);
    }

    if let Some(child) = &node.param
        && let Some(found) = walk(child, tokens, i + 1)
    {
        return Some(found);
    }

    if let Some(child) = &node.wildcard
        && let Some(found) = walk(child, tokens, i + 1)
    {
        return Some(found);
    }

    node.full_wildcard
        .as_ref()
        .map(|route| (route, Some(tokens[i..].join("."))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::request::GetRequest;
    use crate::HandlerResult;

    async fn noop(_req: GetRequest) -> HandlerResult {
        Ok(())
    }

    fn entry() -> HandlerEntry {
        Handler::new().get_model(noop).build().unwrap()
    }

    fn router(patterns: &[&str]) -> Router {
        let mut router = Router::new();
        for pattern in patterns {
            router.add(pattern, entry()).unwrap();
        }
        router
    }

    #[test]
    fn test_placeholder_binding() {
        let router = router(&["user.$id"]);
        let m = router.resolve("user.42").unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));
        assert_eq!(m.group, "user.42");
        assert_eq!(m.tail, None);
    }

    #[test]
    fn test_full_wildcard_tail() {
        let router = router(&["data.>"]);
        let m = router.resolve("data.a.b.c").unwrap();
        assert_eq!(m.tail.as_deref(), Some("a.b.c"));
        assert!(router.resolve("data").is_none());
    }

    #[test]
    fn test_most_specific_match_wins() {
        let router = router(&["lib.>", "lib.*.items", "lib.$id.items", "lib.special.items"]);

        assert_eq!(router.resolve("lib.special.items").unwrap().pattern, "lib.special.items");
        let m = router.resolve("lib.7.items").unwrap();
        assert_eq!(m.pattern, "lib.$id.items");
        assert_eq!(m.params["id"], "7");
        assert_eq!(router.resolve("lib.7.other").unwrap().pattern, "lib.>");
    }

    #[test]
    fn test_backtracks_to_less_specific_branch() {
        let router = router(&["lib.special.x", "lib.$id.y"]);
        let m = router.resolve("lib.special.y").unwrap();
        assert_eq!(m.pattern, "lib.$id.y");
        assert_eq!(m.params["id"], "special");
    }

    #[test]
    fn test_wildcard_binds_nothing() {
        let router = router(&["lib.*.meta"]);
        let m = router.resolve("lib.9.meta").unwrap();
        assert!(m.params.is_empty());
        assert!(router.resolve("lib.9").is_none());
    }

    #[test]
    fn test_group_template() {
        let mut router = Router::new();
        let entry = Handler::new().get_model(noop).group("shelf.${shelf}").build().unwrap();
        router.add("lib.shelf.$shelf.book.$id", entry).unwrap();

        let a = router.resolve("lib.shelf.3.book.1").unwrap();
        let b = router.resolve("lib.shelf.3.book.2").unwrap();
        assert_eq!(a.group, "shelf.3");
        assert_eq!(a.group, b.group);
    }

    #[test]
    fn test_unknown_group_tag_rejected() {
        let mut router = Router::new();
        let entry = Handler::new().get_model(noop).group("${nope}").build().unwrap();
        assert!(matches!(
            router.add("lib.$id", entry),
            Err(RegistrationError::UnknownGroupTag { .. })
        ));
    }

    #[test]
    fn test_conflicting_registrations() {
        let mut router = router(&["lib.$id", "lib.>"]);
        assert!(matches!(
            router.add("lib.$id", entry()),
            Err(RegistrationError::ConflictingRegistration { .. })
        ));
        assert!(matches!(
            router.add("lib.$name", entry()),
            Err(RegistrationError::ConflictingRegistration { .. })
        ));
        assert!(matches!(
            router.add("lib.>", entry()),
            Err(RegistrationError::ConflictingRegistration { .. })
        ));
        assert!(matches!(
            router.add("lib.>.>", entry()),
            Err(RegistrationError::Pattern(_))
        ));
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_placeholder_names_may_differ_per_pattern() {
        let router = router(&["org.$org", "org.$orgId.members", "org.$a.team.$b"]);

        let m = router.resolve("org.acme").unwrap();
        assert_eq!(m.pattern, "org.$org");
        assert_eq!(m.params.len(), 1);
        assert_eq!(m.params["org"], "acme");

        let m = router.resolve("org.acme.members").unwrap();
        assert_eq!(m.pattern, "org.$orgId.members");
        assert_eq!(m.params.len(), 1);
        assert_eq!(m.params["orgId"], "acme");

        let m = router.resolve("org.acme.team.red").unwrap();
        assert_eq!(m.params["a"], "acme");
        assert_eq!(m.params["b"], "red");
    }

    #[test]
    fn test_invalid_names_do_not_resolve() {
        let router = router(&["lib.>"]);
        assert!(router.resolve("").is_none());
        assert!(router.resolve("lib..x").is_none());
        assert_eq!(router.patterns().collect::<Vec<_>>(), vec!["lib.>"]);
    }
}
