use crate::types::ExecutionId;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// FIFO of executions awaiting a processing pass.
///
/// Safe for many producers (API callers) and the single processor. An id is queued at most once.
#[derive(Default)]
pub struct ExecutionQueue {
    items: Mutex<VecDeque<ExecutionId>>,
    notify: Notify,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an execution; returns false if it was already waiting
    pub fn push(&self, id: ExecutionId) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.contains(&id) {
            return false;
        }
        items.push_back(id);
        drop(items);

        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<ExecutionId> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until something is pushed. A push that happened while nobody was waiting
    /// leaves a permit, so a wake-up is never missed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fifo_and_dedupe() {
        let queue = ExecutionQueue::new();
        let a = ExecutionId::new();
        let b = ExecutionId::new();

        assert!(queue.push(a));
        assert!(queue.push(b));
        assert!(!queue.push(a));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(ExecutionQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
                queue.pop()
            })
        };

        let id = ExecutionId::new();
        queue.push(id);

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(id));
    }
}
