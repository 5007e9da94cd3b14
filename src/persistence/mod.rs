//! Persistence Module
//!
//! The engine only needs load/save/find-by-criteria over its records,
//! expressed as the [`Repository`] trait. An in-memory implementation
//! backs the default executor and the tests.
//!
//! # Components
//!
//! - [`Entity`]: identity plus string-valued fields usable in criteria
//! - [`Criteria`]: equality, set membership and absence conditions
//! - [`MemoryRepository`]: `RwLock`-guarded map preserving insertion order

pub mod memory;

use std::sync::Arc;

use crate::error::Result;
use crate::execution::events::{Directive, ExecutionEvent};
use crate::execution::instance::{StateExecutionInstance, WorkflowRun};
use crate::machine::StateMachine;
use crate::outcome::Outcome;

pub use memory::MemoryRepository;

/// Generates a fresh random identifier.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A persisted record.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Returns the value of a queryable field, or `None` when unset.
    fn field(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, String),
    In(String, Vec<String>),
    Missing(String),
}

/// Conjunction of field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    conditions: Vec<Condition>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<String>) -> Self {
        self.conditions
            .push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn in_set<I, S>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.push(Condition::In(
            field.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn missing(mut self, field: &str) -> Self {
        self.conditions.push(Condition::Missing(field.to_string()));
        self
    }

    pub fn matches<T: Entity>(&self, entity: &T) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, value) => entity.field(field).as_deref() == Some(value.as_str()),
            Condition::In(field, values) => entity
                .field(field)
                .map_or(false, |actual| values.iter().any(|v| *v == actual)),
            Condition::Missing(field) => entity.field(field).is_none(),
        })
    }
}

/// Storage contract used by the engine.
pub trait Repository<T: Entity>: Send + Sync {
    /// Inserts or replaces a record, returning its id.
    fn save(&self, entity: T) -> Result<String>;

    fn get(&self, id: &str) -> Result<Option<T>>;

    fn find_one(&self, criteria: &Criteria) -> Result<Option<T>>;

    /// Returns matches in insertion order.
    fn find_all(&self, criteria: &Criteria) -> Result<Vec<T>>;

    fn delete(&self, id: &str) -> Result<bool>;

    /// Inserts `entity` unless a record matching `conflict` exists. The
    /// check and the insert happen atomically; returns whether it was saved.
    fn save_if_absent(&self, entity: T, conflict: &Criteria) -> Result<bool>;

    /// Applies `apply` atomically. The change is stored only when `apply`
    /// returns true; the updated record is returned in that case.
    fn update(&self, id: &str, apply: &mut dyn FnMut(&mut T) -> bool) -> Result<Option<T>>;
}

/// The set of repositories the engine works against.
#[derive(Clone)]
pub struct Persistence {
    pub machines: Arc<dyn Repository<StateMachine>>,
    pub runs: Arc<dyn Repository<WorkflowRun>>,
    pub instances: Arc<dyn Repository<StateExecutionInstance>>,
    pub events: Arc<dyn Repository<ExecutionEvent>>,
    pub directives: Arc<dyn Repository<Directive>>,
    pub outcomes: Arc<dyn Repository<Outcome>>,
}

impl Persistence {
    pub fn in_memory() -> Self {
        Self {
            machines: Arc::new(MemoryRepository::new()),
            runs: Arc::new(MemoryRepository::new()),
            instances: Arc::new(MemoryRepository::new()),
            events: Arc::new(MemoryRepository::new()),
            directives: Arc::new(MemoryRepository::new()),
            outcomes: Arc::new(MemoryRepository::new()),
        }
    }
}

impl Default for Persistence {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Record {
        id: String,
        status: String,
        parent: Option<String>,
    }

    impl Entity for Record {
        fn id(&self) -> &str {
            &self.id
        }

        fn field(&self, name: &str) -> Option<String> {
            match name {
                "id" => Some(self.id.clone()),
                "status" => Some(self.status.clone()),
                "parent" => self.parent.clone(),
                _ => None,
            }
        }
    }

    fn record(id: &str, status: &str, parent: Option<&str>) -> Record {
        Record {
            id: id.into(),
            status: status.into(),
            parent: parent.map(String::from),
        }
    }

    #[test]
    fn test_criteria_eq() {
        let r = record("1", "RUNNING", None);
        assert!(Criteria::new().eq("status", "RUNNING").matches(&r));
        assert!(!Criteria::new().eq("status", "PAUSED").matches(&r));
        assert!(!Criteria::new().eq("parent", "0").matches(&r));
    }

    #[test]
    fn test_criteria_in_set() {
        let r = record("1", "QUEUED", Some("p"));
        assert!(Criteria::new()
            .in_set("status", ["NEW", "QUEUED"])
            .matches(&r));
        assert!(!Criteria::new().in_set("status", ["SUCCESS"]).matches(&r));
        assert!(!Criteria::new()
            .in_set("status", Vec::<String>::new())
            .matches(&r));
    }

    #[test]
    fn test_criteria_missing() {
        assert!(Criteria::new()
            .missing("parent")
            .matches(&record("1", "NEW", None)));
        assert!(!Criteria::new()
            .missing("parent")
            .matches(&record("1", "NEW", Some("p"))));
    }

    #[test]
    fn test_empty_criteria_matches_everything() {
        assert!(Criteria::new().matches(&record("1", "NEW", None)));
    }

    #[test]
    fn test_generate_id_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
