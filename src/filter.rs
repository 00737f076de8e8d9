//! Typed filter expressions over stored records
//!
//! Queries and exports filter with a small expression tree instead of
//! predicate strings: fields and operators are checked at compile time and
//! evaluated directly against rows. Predicates compose by AND only.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Level, Message, NetworkTask};

/// A record field usable in equality comparisons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Message label
    Label,
    /// Source file
    File,
    /// Source function
    Function,
    /// Backing task URL
    Url,
    /// Backing task HTTP method
    HttpMethod,
}

/// A filter expression evaluated against messages (and their backing tasks)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Severity is at least the given level
    LevelAtLeast(Level),
    /// Severity is exactly the given level
    LevelEquals(Level),
    /// Creation time falls in `[from, to)`; open bounds are unconstrained
    CreatedAt {
        /// Inclusive lower bound in nanoseconds since the Unix epoch
        from: Option<u64>,
        /// Exclusive upper bound in nanoseconds since the Unix epoch
        to: Option<u64>,
    },
    /// Field equals the given value
    FieldEquals {
        /// Field to compare
        field: Field,
        /// Expected value
        value: String,
    },
    /// Owning session is one of the given set
    SessionIn(HashSet<Uuid>),
    /// Every sub-predicate holds
    All(Vec<Predicate>),
}

impl Predicate {
    /// Combine two predicates with AND.
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::All(mut parts) => {
                parts.push(other);
                Predicate::All(parts)
            }
            lhs => Predicate::All(vec![lhs, other]),
        }
    }

    /// Evaluate against a message and its backing task, if any.
    #[must_use]
    pub fn matches(&self, message: &Message, task: Option<&NetworkTask>) -> bool {
        match self {
            Predicate::LevelAtLeast(level) => message.level >= *level,
            Predicate::LevelEquals(level) => message.level == *level,
            Predicate::CreatedAt { from, to } => {
                from.map_or(true, |bound| message.created_at >= bound)
                    && to.map_or(true, |bound| message.created_at < bound)
            }
            Predicate::FieldEquals { field, value } => match field {
                Field::Label => message.label == *value,
                Field::File => message.file == *value,
                Field::Function => message.function == *value,
                Field::Url => task.is_some_and(|t| t.url == *value),
                Field::HttpMethod => task.is_some_and(|t| t.http_method == *value),
            },
            Predicate::SessionIn(sessions) => sessions.contains(&message.session_id),
            Predicate::All(parts) => parts.iter().all(|p| p.matches(message, task)),
        }
    }
}

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Most recent records first (the default)
    #[default]
    NewestFirst,
    /// Chronological order
    OldestFirst,
}

/// A query over stored messages
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Optional predicate; `None` matches everything
    pub predicate: Option<Predicate>,
    /// Optional session restriction, intersected with the predicate
    pub sessions: Option<HashSet<Uuid>>,
    /// Result ordering
    pub order: Order,
}

impl MessageQuery {
    /// Query matching every message, newest first.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a predicate.
    #[must_use]
    pub fn matching(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    /// Restrict to a set of sessions.
    #[must_use]
    pub fn in_sessions(sessions: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            sessions: Some(sessions.into_iter().collect()),
            ..Self::default()
        }
    }
}

/// A query over stored network tasks
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Optional session restriction
    pub sessions: Option<HashSet<Uuid>>,
    /// Result ordering
    pub order: Order,
}

impl TaskQuery {
    /// Query matching every task, newest first.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a set of sessions.
    #[must_use]
    pub fn in_sessions(sessions: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            sessions: Some(sessions.into_iter().collect()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(level: Level, created_at: u64, label: &str) -> Message {
        Message {
            id: 1,
            created_at,
            level,
            label: label.to_string(),
            session_id: Uuid::nil(),
            text: "test".to_string(),
            metadata: vec![],
            file: "lib.rs".to_string(),
            function: "run".to_string(),
            line: 1,
            task_id: None,
        }
    }

    #[test]
    fn test_level_at_least() {
        let predicate = Predicate::LevelAtLeast(Level::Warning);

        assert!(!predicate.matches(&message(Level::Info, 0, "a"), None));
        assert!(predicate.matches(&message(Level::Warning, 0, "a"), None));
        assert!(predicate.matches(&message(Level::Critical, 0, "a"), None));
    }

    #[test]
    fn test_level_equals() {
        let predicate = Predicate::LevelEquals(Level::Error);

        assert!(predicate.matches(&message(Level::Error, 0, "a"), None));
        assert!(!predicate.matches(&message(Level::Critical, 0, "a"), None));
    }

    #[test]
    fn test_created_at_range() {
        let predicate = Predicate::CreatedAt {
            from: Some(100),
            to: Some(200),
        };

        assert!(!predicate.matches(&message(Level::Info, 99, "a"), None));
        assert!(predicate.matches(&message(Level::Info, 100, "a"), None));
        assert!(predicate.matches(&message(Level::Info, 199, "a"), None));
        assert!(!predicate.matches(&message(Level::Info, 200, "a"), None));
    }

    #[test]
    fn test_created_at_open_bounds() {
        let open = Predicate::CreatedAt {
            from: None,
            to: None,
        };
        assert!(open.matches(&message(Level::Info, 0, "a"), None));

        let lower_only = Predicate::CreatedAt {
            from: Some(50),
            to: None,
        };
        assert!(lower_only.matches(&message(Level::Info, u64::MAX, "a"), None));
        assert!(!lower_only.matches(&message(Level::Info, 49, "a"), None));
    }

    #[test]
    fn test_field_equals_label() {
        let predicate = Predicate::FieldEquals {
            field: Field::Label,
            value: "network".to_string(),
        };

        assert!(predicate.matches(&message(Level::Info, 0, "network"), None));
        assert!(!predicate.matches(&message(Level::Info, 0, "auth"), None));
    }

    #[test]
    fn test_task_fields_require_task() {
        let predicate = Predicate::FieldEquals {
            field: Field::Url,
            value: "https://example.com/api".to_string(),
        };

        // A plain message never matches a task field
        assert!(!predicate.matches(&message(Level::Info, 0, "a"), None));
    }

    #[test]
    fn test_and_composition() {
        let predicate = Predicate::LevelAtLeast(Level::Warning).and(Predicate::CreatedAt {
            from: Some(10),
            to: None,
        });

        assert!(predicate.matches(&message(Level::Error, 20, "a"), None));
        assert!(!predicate.matches(&message(Level::Error, 5, "a"), None));
        assert!(!predicate.matches(&message(Level::Info, 20, "a"), None));
    }

    #[test]
    fn test_session_in() {
        let session = Uuid::new_v4();
        let predicate = Predicate::SessionIn([session].into_iter().collect());

        let mut matching = message(Level::Info, 0, "a");
        matching.session_id = session;
        assert!(predicate.matches(&matching, None));

        let other = message(Level::Info, 0, "a");
        assert!(!predicate.matches(&other, None));
    }
}
