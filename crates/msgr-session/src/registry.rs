//! Task registry — every background task a session spawns, by ticket.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;
use uuid::Uuid;

/// Identifies one registered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTicket {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    ticket: TaskTicket,
    abort: AbortHandle,
}

/// Drops the registry entry however the task ends: completion, panic or
/// abort.
struct Deregister {
    tasks: Arc<Mutex<HashMap<Uuid, Entry>>>,
    id: Uuid,
    done: Arc<AtomicBool>,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        self.tasks.lock().remove(&self.id);
    }
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` and track it until it finishes or is cancelled.
    pub fn spawn<F, T>(&self, name: &str, fut: F) -> (TaskTicket, JoinHandle<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = TaskTicket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        let done = Arc::new(AtomicBool::new(false));
        let deregister = Deregister {
            tasks: self.tasks.clone(),
            id: ticket.id,
            done: done.clone(),
        };
        let handle = tokio::spawn(async move {
            let _deregister = deregister;
            fut.await
        });

        // The task may already be gone; never register a finished one.
        let mut tasks = self.tasks.lock();
        if !done.load(Ordering::SeqCst) {
            tasks.insert(
                ticket.id,
                Entry {
                    ticket: ticket.clone(),
                    abort: handle.abort_handle(),
                },
            );
        }
        drop(tasks);

        debug!("Spawned task {} ({})", ticket.name, ticket.id);
        (ticket, handle)
    }

    /// Abort one task. Returns false when it already finished.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let entry = self.tasks.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.abort.abort();
                debug!("Cancelled task {} ({})", entry.ticket.name, id);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let entries: Vec<Entry> = self.tasks.lock().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.abort.abort();
        }
        if !entries.is_empty() {
            debug!("Cancelled {} tasks", entries.len());
        }
        entries.len()
    }

    pub fn list(&self) -> Vec<TaskTicket> {
        let mut tickets: Vec<TaskTicket> = self
            .tasks
            .lock()
            .values()
            .map(|e| e.ticket.clone())
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        tickets
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_finished_tasks_deregister() {
        let registry = TaskRegistry::new();
        let (ticket, handle) = registry.spawn("quick", async { 5 });
        assert_eq!(ticket.name, "quick");
        assert_eq!(handle.await.unwrap(), 5);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_panicked_and_aborted_tasks_deregister() {
        let registry = TaskRegistry::new();
        let (_ticket, handle) = registry.spawn("boom", async {
            panic!("task failed");
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert!(registry.is_empty());

        let idle = tokio::time::sleep(Duration::from_secs(3600));
        let (_ticket, handle) = registry.spawn("idle", idle);
        assert_eq!(registry.len(), 1);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(registry.is_empty());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_list() {
        let registry = TaskRegistry::new();
        let (a, handle_a) = registry.spawn("a", tokio::time::sleep(Duration::from_secs(3600)));
        let (_b, _handle_b) = registry.spawn("b", tokio::time::sleep(Duration::from_secs(3600)));

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));

        assert!(registry.cancel(&a.id));
        assert!(!registry.cancel(&a.id));
        assert!(handle_a.await.unwrap_err().is_cancelled());

        assert_eq!(registry.cancel_all(), 1);
        assert!(registry.is_empty());
    }
}
