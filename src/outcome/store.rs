//! Outcome Store

use std::sync::Arc;

use chrono::Utc;
use log::debug;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::persistence::{generate_id, Criteria, MemoryRepository, Repository};

use super::{ExecutionRef, Outcome, OutcomeRef, OutcomeScope};

/// Scoped key/value store for step outputs.
#[derive(Clone)]
pub struct OutcomeStore {
    repository: Arc<dyn Repository<Outcome>>,
}

impl OutcomeStore {
    pub fn new(repository: Arc<dyn Repository<Outcome>>) -> Self {
        Self { repository }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRepository::new()))
    }

    /// Stores an outcome and returns its id.
    ///
    /// A node can publish a name once per scope key. Different nodes may
    /// publish the same name into a shared scope; lookups see the latest.
    pub fn consume(
        &self,
        at: &ExecutionRef,
        name: &str,
        payload: Option<Value>,
        scope: OutcomeScope,
    ) -> Result<String> {
        let scope_key = at.scope_key(scope);
        let producing_node_id = at.node_id().to_string();
        let conflict = Criteria::new()
            .eq("name", name)
            .eq("scope", scope.as_str())
            .eq("scope_key", scope_key.as_str())
            .eq("producing_node_id", producing_node_id.as_str());

        let outcome = Outcome {
            id: generate_id(),
            producing_execution_id: at.workflow_execution_id.clone(),
            producing_node_id,
            pipeline_execution_id: at.pipeline_execution_id.clone(),
            name: name.to_string(),
            scope,
            scope_key,
            payload,
            created_at: Utc::now(),
        };
        let id = outcome.id.clone();
        debug!(
            "Outcome '{}' published by {} ({})",
            outcome.name, outcome.producing_node_id, scope
        );
        if !self.repository.save_if_absent(outcome, &conflict)? {
            return Err(EngineError::Outcome(format!(
                "Outcome '{}' already published by {} in {} scope",
                name,
                at.node_id(),
                scope
            )));
        }
        Ok(id)
    }

    /// Resolves an outcome payload by name.
    ///
    /// Without a producer or scope restriction the search walks from the
    /// current node outward through its ancestors, then the run, then the
    /// pipeline. Returns `None` when nothing matches or the match has no
    /// payload.
    pub fn resolve(&self, at: &ExecutionRef, reference: &OutcomeRef) -> Result<Option<Value>> {
        Ok(self
            .resolve_outcome(at, reference)?
            .and_then(|outcome| outcome.payload))
    }

    /// Like [`resolve`](Self::resolve) but returns the whole record.
    pub fn resolve_outcome(
        &self,
        at: &ExecutionRef,
        reference: &OutcomeRef,
    ) -> Result<Option<Outcome>> {
        if let Some(node_id) = &reference.producer_node_id {
            let criteria = Criteria::new()
                .eq("name", reference.name.as_str())
                .eq("producing_node_id", node_id.as_str());
            return Ok(self.repository.find_all(&criteria)?.pop());
        }

        if let Some(scope) = reference.scope {
            return self.find_in_scope(&reference.name, scope, &at.scope_key(scope));
        }

        for node_id in at.node_path.iter().rev() {
            if let Some(found) = self.find_in_scope(&reference.name, OutcomeScope::Node, node_id)? {
                return Ok(Some(found));
            }
        }
        for scope in [OutcomeScope::Stage, OutcomeScope::Pipeline] {
            if let Some(found) = self.find_in_scope(&reference.name, scope, &at.scope_key(scope))? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Every outcome visible from `at`, nearest first.
    pub fn visible(&self, at: &ExecutionRef) -> Result<Vec<Outcome>> {
        let mut visible = Vec::new();
        for node_id in at.node_path.iter().rev() {
            visible.extend(self.find_scope(OutcomeScope::Node, node_id)?);
        }
        visible.extend(self.find_scope(OutcomeScope::Stage, &at.scope_key(OutcomeScope::Stage))?);
        visible.extend(
            self.find_scope(OutcomeScope::Pipeline, &at.scope_key(OutcomeScope::Pipeline))?,
        );
        Ok(visible)
    }

    /// All outcomes produced by one node of one run.
    pub fn find_all_by_runtime_id(&self, execution_id: &str, node_id: &str) -> Result<Vec<Outcome>> {
        let criteria = Criteria::new()
            .eq("producing_execution_id", execution_id)
            .eq("producing_node_id", node_id);
        self.repository.find_all(&criteria)
    }

    pub fn fetch_outcomes(&self, ids: &[String]) -> Result<Vec<Outcome>> {
        self.repository
            .find_all(&Criteria::new().in_set("id", ids.iter().cloned()))
    }

    pub fn fetch_outcome(&self, id: &str) -> Result<Option<Outcome>> {
        self.repository.get(id)
    }

    /// Removes every outcome produced by a node, returning how many.
    pub fn clean_for_node(&self, node_id: &str) -> Result<usize> {
        let produced = self
            .repository
            .find_all(&Criteria::new().eq("producing_node_id", node_id))?;
        let mut removed = 0;
        for outcome in produced {
            if self.repository.delete(&outcome.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn find_in_scope(&self, name: &str, scope: OutcomeScope, key: &str) -> Result<Option<Outcome>> {
        let criteria = Criteria::new()
            .eq("name", name)
            .eq("scope", scope.as_str())
            .eq("scope_key", key);
        Ok(self.repository.find_all(&criteria)?.pop())
    }

    fn find_scope(&self, scope: OutcomeScope, key: &str) -> Result<Vec<Outcome>> {
        let criteria = Criteria::new()
            .eq("scope", scope.as_str())
            .eq("scope_key", key);
        self.repository.find_all(&criteria)
    }
}
