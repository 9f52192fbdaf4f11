use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::types::ExecutionEvent;

/// Event bus for execution events
///
/// Each subscriber owns a bounded queue. Publishing never waits: a subscriber that falls
/// behind loses its oldest events and is told how many on its next receive.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn publish(&self, event: ExecutionEvent) {
        // Ignore the error if there are no receivers
        let _ = self.sender.send(event);
    }

    /// Subscribe to every execution
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            task_id: None,
        }
    }

    /// Subscribe to executions of one task
    pub fn subscribe_task(&self, task_id: &str) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            task_id: Some(task_id.to_string()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[derive(Debug, PartialEq)]
pub enum Received {
    Event(ExecutionEvent),
    /// This many events were dropped because the subscriber fell behind
    Lagged(u64),
    Closed,
}

pub struct Subscription {
    receiver: broadcast::Receiver<ExecutionEvent>,
    task_id: Option<String>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Received {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(task_id) = &self.task_id {
                        if &event.task_id != task_id {
                            continue;
                        }
                    }
                    return Received::Event(event);
                }
                Err(RecvError::Lagged(n)) => return Received::Lagged(n),
                Err(RecvError::Closed) => return Received::Closed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executions::types::{EventType, Execution};

    #[tokio::test]
    async fn test_task_filter() {
        let bus = EventBus::new(16);
        let mut all = bus.subscribe();
        let mut only_b = bus.subscribe_task("b");

        let a = Execution::new("a", "alpha");
        let b = Execution::new("b", "beta");
        bus.publish(ExecutionEvent::started(&a));
        bus.publish(ExecutionEvent::started(&b));

        match all.recv().await {
            Received::Event(e) => assert_eq!(e.task_id, "a"),
            other => panic!("unexpected {:?}", other),
        }
        match only_b.recv().await {
            Received::Event(e) => {
                assert_eq!(e.task_id, "b");
                assert_eq!(e.event_type, EventType::Started);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        let exec = Execution::new("a", "alpha");
        for i in 0..10 {
            bus.publish(ExecutionEvent::output(&exec, &format!("line {}", i), &[]));
        }

        assert_eq!(slow.recv().await, Received::Lagged(6));
        match slow.recv().await {
            Received::Event(e) => assert_eq!(e.data["line"], "line 6"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(ExecutionEvent::started(&Execution::new("a", "alpha")));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
