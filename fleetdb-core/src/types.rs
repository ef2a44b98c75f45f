//! Identifiers and value types shared across the data-access layer

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Positional statement parameter.
///
/// Carried to the database as a bound value and to the relay verbatim.
pub type Param = serde_json::Value;

/// A single result row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Identifier of one database deployment in the fleet
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stakeholder category whose stored data a write may change
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(role: &str) -> Self {
        Self(role.to_owned())
    }
}

/// Roles whose data a write affects. Empty means "do not replicate".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffectedRoles(BTreeSet<Role>);

impl AffectedRoles {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.0.iter()
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.0.contains(role)
    }
}

impl<R: Into<Role>> FromIterator<R> for AffectedRoles {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Returns the role set only when it would trigger replication
pub(crate) fn replicating(roles: Option<&AffectedRoles>) -> Option<&AffectedRoles> {
    roles.filter(|r| !r.is_empty())
}

/// Outcome of one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// Rows touched or returned, whichever the statement produced
    pub fn row_count(&self) -> u64 {
        if self.rows.is_empty() {
            self.rows_affected
        } else {
            self.rows.len() as u64
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A write captured inside a transaction, waiting for commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub statement: String,
    pub params: Vec<Param>,
}

impl PendingWrite {
    pub fn new(statement: impl Into<String>, params: &[Param]) -> Self {
        Self {
            statement: statement.into(),
            params: params.to_vec(),
        }
    }
}

const PREVIEW_CHARS: usize = 80;

/// Statement text for log lines, cut at a char boundary
pub(crate) fn statement_preview(statement: &str) -> String {
    match statement.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &statement[..idx]),
        None => statement.to_string(),
    }
}
