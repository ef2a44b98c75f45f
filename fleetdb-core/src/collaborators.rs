//! Routing and classification seams
//!
//! The data-access layer never decides by itself where an instance lives,
//! whether SQL reads or writes, or which instances mirror a role's data. Each
//! question is a trait so the application can supply its own policy; the
//! defaults below are driven by [`FleetConfig`](crate::config::FleetConfig).

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::types::{AffectedRoles, InstanceId, Role};

/// Resolves an instance to its connection URL
pub trait InstanceDirectory: Send + Sync {
    /// `None` means the instance has no reachable database
    fn connection_url(&self, instance: &InstanceId) -> Option<String>;
}

/// Read/write predicate over raw SQL
pub trait StatementClassifier: Send + Sync {
    fn is_read(&self, statement: &str) -> bool;
}

/// Maps affected roles to the other instances that keep a copy of their data
pub trait ReplicationTopology: Send + Sync {
    /// Deduplicated, never contains `origin`
    fn targets(&self, roles: &AffectedRoles, origin: &InstanceId) -> BTreeSet<InstanceId>;
}

/// Instance directory backed by a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    urls: HashMap<InstanceId, String>,
}

impl StaticDirectory {
    pub fn new(urls: HashMap<InstanceId, String>) -> Self {
        Self { urls }
    }

    pub fn with(mut self, instance: impl Into<InstanceId>, url: impl Into<String>) -> Self {
        self.urls.insert(instance.into(), url.into());
        self
    }
}

impl InstanceDirectory for StaticDirectory {
    fn connection_url(&self, instance: &InstanceId) -> Option<String> {
        self.urls
            .get(instance)
            .filter(|url| !url.trim().is_empty())
            .cloned()
    }
}

/// Classifies by the statement's leading keyword.
///
/// `WITH` queries are reads unless one of their clauses modifies data.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "EXPLAIN", "VALUES", "TABLE"];
const MODIFYING_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE", "TRUNCATE"];

impl StatementClassifier for KeywordClassifier {
    fn is_read(&self, statement: &str) -> bool {
        let body = strip_leading_noise(statement);
        let mut words = body
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty());

        let Some(first) = words.next() else {
            return false;
        };
        let first = first.to_ascii_uppercase();

        if first == "WITH" {
            return !words.any(|w| {
                MODIFYING_KEYWORDS
                    .iter()
                    .any(|k| w.eq_ignore_ascii_case(k))
            });
        }

        READ_KEYWORDS.contains(&first.as_str())
    }
}

/// Skips whitespace, opening parentheses and SQL comments before the first keyword
fn strip_leading_noise(statement: &str) -> &str {
    let mut rest = statement;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return trimmed;
        }
    }
}

/// Role → instances map; the targets of a write are the union over its roles
#[derive(Debug, Clone, Default)]
pub struct RoleTopology {
    instances_by_role: HashMap<Role, BTreeSet<InstanceId>>,
}

impl RoleTopology {
    pub fn new(instances_by_role: HashMap<Role, BTreeSet<InstanceId>>) -> Self {
        Self { instances_by_role }
    }

    pub fn with<I, T>(mut self, role: impl Into<Role>, instances: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<InstanceId>,
    {
        self.instances_by_role
            .entry(role.into())
            .or_default()
            .extend(instances.into_iter().map(Into::into));
        self
    }
}

impl ReplicationTopology for RoleTopology {
    fn targets(&self, roles: &AffectedRoles, origin: &InstanceId) -> BTreeSet<InstanceId> {
        let mut targets = BTreeSet::new();
        for role in roles.iter() {
            match self.instances_by_role.get(role) {
                Some(instances) => targets.extend(instances.iter().cloned()),
                None => debug!(role = %role, "role has no instances in topology"),
            }
        }
        targets.remove(origin);
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_reads() {
        let c = KeywordClassifier;
        assert!(c.is_read("SELECT * FROM alumnos"));
        assert!(c.is_read("  select 1"));
        assert!(c.is_read("(SELECT 1) UNION (SELECT 2)"));
        assert!(c.is_read("-- fetch profile\nSELECT nombre FROM directivos"));
        assert!(c.is_read("/* audit */ SHOW search_path"));
        assert!(c.is_read("WITH x AS (SELECT 1) SELECT * FROM x"));
    }

    #[test]
    fn test_classifier_writes() {
        let c = KeywordClassifier;
        assert!(!c.is_read("UPDATE t SET x=1"));
        assert!(!c.is_read("insert into t values (1)"));
        assert!(!c.is_read("DELETE FROM t"));
        assert!(!c.is_read("WITH moved AS (DELETE FROM a RETURNING *) INSERT INTO b SELECT * FROM moved"));
        assert!(!c.is_read("CREATE TABLE t (id int)"));
        assert!(!c.is_read(""));
        assert!(!c.is_read("-- only a comment"));
    }

    #[test]
    fn test_directory_treats_blank_url_as_missing() {
        let dir = StaticDirectory::default()
            .with("A", "postgres://a/db")
            .with("B", "   ");
        assert_eq!(
            dir.connection_url(&InstanceId::from("A")).as_deref(),
            Some("postgres://a/db")
        );
        assert!(dir.connection_url(&InstanceId::from("B")).is_none());
        assert!(dir.connection_url(&InstanceId::from("Z")).is_none());
    }

    #[test]
    fn test_topology_unions_roles_and_excludes_origin() {
        let topology = RoleTopology::default()
            .with("TeacherRole", ["A", "B"])
            .with("TutorRole", ["B", "C"]);
        let roles: AffectedRoles = ["TeacherRole", "TutorRole", "Unknown"].into_iter().collect();

        let targets = topology.targets(&roles, &InstanceId::from("A"));
        let expected: BTreeSet<InstanceId> = ["B", "C"].into_iter().map(InstanceId::from).collect();
        assert_eq!(targets, expected);
    }
}
