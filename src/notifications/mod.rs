//! Outbound notification seam
//!
//! Message formatting and channel delivery live outside this crate. The core only decides
//! *when* to notify and hands the event to a [`Notifier`].

use async_trait::async_trait;
use tracing::info;

use crate::approvals::{Approval, MessageRef};
use crate::logs::ExecutionResult;
use crate::tasks::{NotificationEvent, Task};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn task_event(
        &self,
        task: &Task,
        event: NotificationEvent,
        result: Option<&ExecutionResult>,
    );

    /// Post an approval request; the returned references are stored on the approval
    async fn approval_requested(&self, approval: &Approval, channels: &[String]) -> Vec<MessageRef>;

    async fn approval_updated(&self, approval: &Approval);
}

/// Default notifier: writes every notification to the log
#[derive(Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn task_event(
        &self,
        task: &Task,
        event: NotificationEvent,
        result: Option<&ExecutionResult>,
    ) {
        let config = task.notifications.clone().unwrap_or_default();
        let output = if config.include_output {
            result.map(|r| r.clean_output.as_str())
        } else {
            None
        };
        info!(
            task_id = %task.id,
            event = ?event,
            channels = ?config.channels,
            status = ?result.map(|r| r.status),
            output = output.unwrap_or(""),
            "notification"
        );
    }

    async fn approval_requested(&self, approval: &Approval, channels: &[String]) -> Vec<MessageRef> {
        info!(
            approval_id = %approval.id,
            task_id = %approval.task_id,
            channels = ?channels,
            "approval requested"
        );
        Vec::new()
    }

    async fn approval_updated(&self, approval: &Approval) {
        info!(
            approval_id = %approval.id,
            status = approval.status.as_str(),
            messages = approval.channel_messages.len(),
            "approval updated"
        );
    }
}

/// Events a finished run should announce, in send order
pub fn terminal_events(success: bool) -> [NotificationEvent; 2] {
    if success {
        [NotificationEvent::TaskComplete, NotificationEvent::TaskSuccess]
    } else {
        [NotificationEvent::TaskComplete, NotificationEvent::TaskFailure]
    }
}

/// Deliver `event` if the task subscribed to it
pub async fn dispatch(
    notifier: &dyn Notifier,
    task: &Task,
    event: NotificationEvent,
    result: Option<&ExecutionResult>,
) {
    let wanted = task
        .notifications
        .as_ref()
        .is_some_and(|config| config.wants(event));
    if wanted {
        notifier.task_event(task, event, result).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records what it was asked to send
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<(String, NotificationEvent)>>,
        pub requests: Mutex<Vec<String>>,
        pub updates: Mutex<Vec<(String, crate::approvals::ApprovalStatus)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn task_event(&self, task: &Task, event: NotificationEvent, _: Option<&ExecutionResult>) {
            self.events.lock().unwrap().push((task.id.clone(), event));
        }

        async fn approval_requested(&self, approval: &Approval, channels: &[String]) -> Vec<MessageRef> {
            self.requests.lock().unwrap().push(approval.id.clone());
            channels
                .iter()
                .map(|c| MessageRef {
                    provider: "test".to_string(),
                    chat_id: c.clone(),
                    message_id: format!("msg-{}", approval.id),
                })
                .collect()
        }

        async fn approval_updated(&self, approval: &Approval) {
            self.updates
                .lock()
                .unwrap()
                .push((approval.id.clone(), approval.status));
        }
    }
}
