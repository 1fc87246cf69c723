//! Qualified namespaces and the include/rename configuration.
//!
//! A namespace is a `database.collection` pair. The engine keeps two sets:
//! the *included* set (an empty set means everything except system and
//! config traffic) and the source-to-destination rename map (identity when
//! no mapping is configured).

use std::fmt;
use std::str::FromStr;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// A qualified `database.collection` name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// System and config traffic is never replicated, regardless of the
    /// configured include set.
    pub fn is_system(&self) -> bool {
        self.database == "local"
            || self.database == "config"
            || self.collection.starts_with("system.")
    }
}

impl FromStr for Namespace {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
                Ok(Self::new(db, coll))
            }
            _ => Err(ConfigError::InvalidNamespace {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// The namespace filter and rename map shared by every tailer.
#[derive(Debug, Clone, Default)]
pub struct NamespaceConfig {
    included: FxHashSet<Namespace>,
    renames: FxHashMap<Namespace, Namespace>,
}

impl NamespaceConfig {
    /// Build from parallel source and destination lists.
    ///
    /// An empty destination list means the identity mapping. Otherwise the
    /// lists must be the same length and free of duplicates on either side.
    pub fn new(sources: Vec<Namespace>, destinations: Vec<Namespace>) -> Result<Self, ConfigError> {
        if destinations.is_empty() {
            return Ok(Self {
                included: sources.into_iter().collect(),
                renames: FxHashMap::default(),
            });
        }
        if sources.len() != destinations.len() {
            return Err(ConfigError::NamespaceLengths {
                sources: sources.len(),
                destinations: destinations.len(),
            });
        }
        let unique_sources: FxHashSet<_> = sources.iter().collect();
        let unique_destinations: FxHashSet<_> = destinations.iter().collect();
        if unique_sources.len() + unique_destinations.len() != 2 * sources.len() {
            return Err(ConfigError::DuplicateNamespaces);
        }
        let renames = sources
            .iter()
            .cloned()
            .zip(destinations.into_iter())
            .collect();
        Ok(Self {
            included: sources.into_iter().collect(),
            renames,
        })
    }

    /// Whether writes to `ns` should be replicated at all.
    pub fn allows(&self, ns: &Namespace) -> bool {
        if ns.is_system() {
            return false;
        }
        self.included.is_empty() || self.included.contains(ns)
    }

    /// The destination name for `ns`; identity when no mapping exists.
    pub fn rename(&self, ns: &Namespace) -> Namespace {
        self.renames.get(ns).cloned().unwrap_or_else(|| ns.clone())
    }

    pub fn included(&self) -> impl Iterator<Item = &Namespace> {
        self.included.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> Namespace {
        s.parse().unwrap()
    }

    #[test]
    fn parses_on_first_dot() {
        let parsed = ns("db.some.dotted.coll");
        assert_eq!(parsed.database(), "db");
        assert_eq!(parsed.collection(), "some.dotted.coll");
        assert!("plain".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
    }

    #[test]
    fn system_and_config_are_excluded() {
        let config = NamespaceConfig::default();
        assert!(!config.allows(&ns("local.oplog.rs")));
        assert!(!config.allows(&ns("config.shards")));
        assert!(!config.allows(&ns("app.system.indexes")));
        assert!(config.allows(&ns("app.events")));
    }

    #[test]
    fn empty_include_set_allows_everything_else() {
        let config = NamespaceConfig::new(vec![], vec![]).unwrap();
        assert!(config.allows(&ns("a.b")));
        assert_eq!(config.rename(&ns("a.b")), ns("a.b"));
    }

    #[test]
    fn rename_map_is_applied() {
        let config = NamespaceConfig::new(vec![ns("a.src")], vec![ns("b.dst")]).unwrap();
        assert!(config.allows(&ns("a.src")));
        assert!(!config.allows(&ns("a.other")));
        assert_eq!(config.rename(&ns("a.src")), ns("b.dst"));
    }

    #[test]
    fn rejects_mismatched_and_duplicate_sets() {
        assert!(matches!(
            NamespaceConfig::new(vec![ns("a.b")], vec![ns("c.d"), ns("e.f")]),
            Err(ConfigError::NamespaceLengths { .. })
        ));
        assert!(matches!(
            NamespaceConfig::new(vec![ns("a.b"), ns("a.b")], vec![ns("c.d"), ns("e.f")]),
            Err(ConfigError::DuplicateNamespaces)
        ));
        assert!(matches!(
            NamespaceConfig::new(vec![ns("a.b"), ns("c.d")], vec![ns("x.y"), ns("x.y")]),
            Err(ConfigError::DuplicateNamespaces)
        ));
    }
}
