//! Async Correlation Layer
//!
//! - [`CorrelationRegistry`]: which instance waits on which correlation id
//! - [`WaitNotify`]: the notification contract
//! - [`QueueNotifier`]: delivers notifications into the resume queue

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use log::{debug, warn};

use super::step::ResponseData;

/// A result delivered for one correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub correlation_id: String,
    pub response: ResponseData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waiter {
    pub instance_id: String,
    pub workflow_execution_id: String,
}

/// Maps each outstanding correlation id to exactly one waiting instance.
#[derive(Default)]
pub struct CorrelationRegistry {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, correlation_id: &str, instance_id: &str, workflow_execution_id: &str) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = waiters.insert(
            correlation_id.to_string(),
            Waiter {
                instance_id: instance_id.to_string(),
                workflow_execution_id: workflow_execution_id.to_string(),
            },
        ) {
            if previous.instance_id != instance_id {
                warn!(
                    "Correlation id {} moved from instance {} to {}",
                    correlation_id, previous.instance_id, instance_id
                );
            }
        }
    }

    /// Removes and returns the waiter; `None` if unknown or already taken.
    pub fn take(&self, correlation_id: &str) -> Option<Waiter> {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(correlation_id)
    }

    /// Drops every id the instance waits on, returning the removed ids.
    pub fn remove_for_instance(&self, instance_id: &str) -> Vec<String> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        let removed: Vec<String> = waiters
            .iter()
            .filter(|(_, w)| w.instance_id == instance_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            waiters.remove(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wait-and-notify contract with at-most-once delivery per id.
pub trait WaitNotify: Send + Sync {
    fn register_waiter(&self, correlation_id: &str);

    /// Forgets an id so later notifications for it are rejected.
    fn cancel(&self, correlation_id: &str);

    /// Delivers a result; false when nobody waits on the id.
    fn notify(&self, correlation_id: &str, response: ResponseData) -> bool;
}

/// Notifier feeding the engine's resume queue.
pub struct QueueNotifier {
    waiting: Mutex<HashSet<String>>,
    resume_tx: Mutex<Sender<Notification>>,
}

impl QueueNotifier {
    pub fn new(resume_tx: Sender<Notification>) -> Self {
        Self {
            waiting: Mutex::new(HashSet::new()),
            resume_tx: Mutex::new(resume_tx),
        }
    }
}

impl WaitNotify for QueueNotifier {
    fn register_waiter(&self, correlation_id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(correlation_id.to_string());
    }

    fn cancel(&self, correlation_id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(correlation_id);
    }

    fn notify(&self, correlation_id: &str, response: ResponseData) -> bool {
        let registered = self
            .waiting
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(correlation_id);
        if !registered {
            warn!("Notification for unknown correlation id {} ignored", correlation_id);
            return false;
        }

        let sent = self
            .resume_tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .send(Notification {
                correlation_id: correlation_id.to_string(),
                response,
            });
        match sent {
            Ok(()) => {
                debug!("Queued resume for {}", correlation_id);
                true
            }
            Err(e) => {
                warn!("Resume queue closed, dropping {}: {}", correlation_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_registry_take_is_exactly_once() {
        let registry = CorrelationRegistry::new();
        registry.register("c1", "i1", "run");

        let waiter = registry.take("c1").unwrap();
        assert_eq!(waiter.instance_id, "i1");
        assert!(registry.take("c1").is_none());
    }

    #[test]
    fn test_registry_remove_for_instance() {
        let registry = CorrelationRegistry::new();
        registry.register("c1", "i1", "run");
        registry.register("c2", "i1", "run");
        registry.register("c3", "i2", "run");

        let mut removed = registry.remove_for_instance("i1");
        removed.sort();
        assert_eq!(removed, vec!["c1", "c2"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_notifier_delivers_once() {
        let (tx, rx) = channel();
        let notifier = QueueNotifier::new(tx);
        notifier.register_waiter("c1");

        assert!(notifier.notify("c1", ResponseData::success()));
        assert!(!notifier.notify("c1", ResponseData::success()));

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.correlation_id, "c1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notifier_cancel() {
        let (tx, rx) = channel();
        let notifier = QueueNotifier::new(tx);
        notifier.register_waiter("c1");
        notifier.cancel("c1");

        assert!(!notifier.notify("c1", ResponseData::success()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notifier_unknown_id() {
        let (tx, rx) = channel();
        let notifier = QueueNotifier::new(tx);
        assert!(!notifier.notify("ghost", ResponseData::failed("late")));
        assert!(rx.try_recv().is_err());
    }
}
