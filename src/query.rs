//! Structural query index over topic keys.
//!
//! Evaluates an XPath subset against the set of known topic keys:
//!
//! - `//key[@oid='Game1']`
//! - `//*[@domain='sports']`
//! - `//key[@domain='sports' and @league='nba']`
//!
//! The element is either `key` or `*`; predicates test attributes for
//! equality and may be chained with `and`. Anything else is rejected with
//! `InvalidQuery` so a bad subscribe fails synchronously.

use crate::error::{BrokerError, Result};
use crate::types::{TopicId, TopicKey};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Contract the orchestrator needs from a query index.
pub trait QueryIndex: Send + Sync {
    /// Register a topic key when its topic becomes known.
    fn insert_key(&self, key: &TopicKey);

    /// Forget a topic key when its topic dies.
    fn remove_key(&self, oid: &TopicId);

    /// Evaluate a query against all known keys.
    fn match_query(&self, query: &str) -> Result<Vec<TopicId>>;

    /// All known keys carrying exactly this domain. Structural, so domain
    /// values that would not survive embedding in a query string still
    /// match.
    fn match_domain(&self, domain: &str) -> Vec<TopicId>;

    /// Evaluate a query against one key (used for retroactive matching).
    fn matches(&self, query: &str, key: &TopicKey) -> Result<bool>;
}

/// A parsed query expression.
#[derive(Clone, Debug, PartialEq, Eq)]
struct QueryExpr {
    /// None means `*`.
    element: Option<String>,
    /// Attribute equality predicates, all of which must hold.
    predicates: Vec<(String, String)>,
}

impl QueryExpr {
    fn parse(query: &str) -> Result<Self> {
        let invalid = |reason: &str| BrokerError::InvalidQuery {
            query: query.to_string(),
            reason: reason.to_string(),
        };

        let rest = query
            .trim()
            .strip_prefix("//")
            .ok_or_else(|| invalid("expected '//' prefix"))?;

        let bracket = rest.find('[').ok_or_else(|| invalid("expected '[' predicate"))?;
        let element = rest[..bracket].trim();
        if element.is_empty() {
            return Err(invalid("missing element name"));
        }
        let element = if element == "*" {
            None
        } else if element.chars().all(|c| c.is_alphanumeric() || c == '_') {
            Some(element.to_string())
        } else {
            return Err(invalid("invalid element name"));
        };

        let body = rest[bracket + 1..]
            .trim()
            .strip_suffix(']')
            .ok_or_else(|| invalid("expected closing ']'"))?;

        let mut predicates = Vec::new();
        for part in body.split(" and ") {
            let part = part.trim();
            let attr_expr = part
                .strip_prefix('@')
                .ok_or_else(|| invalid("predicate must test an attribute"))?;
            let eq = attr_expr.find('=').ok_or_else(|| invalid("expected '='"))?;
            let name = attr_expr[..eq].trim();
            if name.is_empty() {
                return Err(invalid("missing attribute name"));
            }
            let value = attr_expr[eq + 1..].trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .ok_or_else(|| invalid("attribute value must be quoted"))?;
            predicates.push((name.to_string(), value.to_string()));
        }
        if predicates.is_empty() {
            return Err(invalid("empty predicate"));
        }

        Ok(Self { element, predicates })
    }

    fn matches(&self, key: &TopicKey) -> bool {
        // Topic keys are flat; the only element they expose is `key`.
        if let Some(element) = &self.element {
            if element != "key" {
                return false;
            }
        }
        self.predicates.iter().all(|(name, value)| {
            if name == "oid" {
                return key.oid.as_str() == value;
            }
            key.attribute(name) == Some(value.as_str())
        })
    }
}

/// Default in-memory query index.
pub struct KeyQueryIndex {
    keys: RwLock<HashMap<TopicId, TopicKey>>,
}

impl KeyQueryIndex {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl Default for KeyQueryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryIndex for KeyQueryIndex {
    fn insert_key(&self, key: &TopicKey) {
        self.keys.write().insert(key.oid.clone(), key.clone());
    }

    fn remove_key(&self, oid: &TopicId) {
        self.keys.write().remove(oid);
    }

    fn match_query(&self, query: &str) -> Result<Vec<TopicId>> {
        let expr = QueryExpr::parse(query)?;
        let keys = self.keys.read();
        let mut matched: Vec<TopicId> = keys
            .values()
            .filter(|key| expr.matches(key))
            .map(|key| key.oid.clone())
            .collect();
        matched.sort();
        Ok(matched)
    }

    fn match_domain(&self, domain: &str) -> Vec<TopicId> {
        let keys = self.keys.read();
        let mut matched: Vec<TopicId> = keys
            .values()
            .filter(|key| key.domain.as_deref() == Some(domain))
            .map(|key| key.oid.clone())
            .collect();
        matched.sort();
        matched
    }

    fn matches(&self, query: &str, key: &TopicKey) -> Result<bool> {
        Ok(QueryExpr::parse(query)?.matches(key))
    }
}
