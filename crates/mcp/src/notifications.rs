//! Routing of server-initiated notifications to the active consumer.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use {serde::Serialize, tracing::debug};

use crate::types::{JsonRpcNotification, LOGGING_MESSAGE_METHOD, LoggingMessageParams};

/// A peer notification, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNotification {
    pub server_name: String,
    pub level: String,
    pub message: String,
}

impl ServerNotification {
    /// Normalize a raw notification. MCP logging messages keep their level;
    /// anything else is reported at `info` as the method and its params.
    pub fn from_jsonrpc(server_name: &str, notif: &JsonRpcNotification) -> Self {
        let logging = (notif.method == LOGGING_MESSAGE_METHOD)
            .then(|| {
                notif
                    .params
                    .clone()
                    .and_then(|p| serde_json::from_value::<LoggingMessageParams>(p).ok())
            })
            .flatten();

        let (level, message) = match logging {
            Some(params) => {
                let message = match params.data {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (params.level, message)
            },
            None => {
                let message = match &notif.params {
                    Some(params) => format!("{} {params}", notif.method),
                    None => notif.method.clone(),
                };
                ("info".to_string(), message)
            },
        };

        Self {
            server_name: server_name.to_string(),
            level,
            message,
        }
    }
}

/// Callback receiving notifications while registered.
pub type NotificationConsumer = Arc<dyn Fn(ServerNotification) + Send + Sync>;

/// Delivers to at most one consumer, queueing while none is registered.
pub(crate) struct NotificationRouter {
    consumer: Mutex<Option<NotificationConsumer>>,
    pending: Mutex<VecDeque<ServerNotification>>,
    capacity: usize,
}

impl NotificationRouter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            consumer: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn set_consumer(&self, consumer: NotificationConsumer) {
        *self.consumer.lock().unwrap_or_else(|e| e.into_inner()) = Some(consumer);
    }

    pub(crate) fn clear_consumer(&self) {
        *self.consumer.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub(crate) fn route(&self, notification: ServerNotification) {
        let consumer = {
            let guard = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(consumer) => Arc::clone(consumer),
                None => {
                    // Queue while still holding the consumer lock so a
                    // concurrent registration cannot miss this message.
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    if pending.len() >= self.capacity {
                        pending.pop_front();
                        debug!(
                            capacity = self.capacity,
                            "pending notification queue full, dropping oldest"
                        );
                    }
                    pending.push_back(notification);
                    return;
                },
            }
        };
        consumer(notification);
    }

    /// Take every queued notification, oldest first.
    pub(crate) fn drain(&self) -> Vec<ServerNotification> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn note(message: &str) -> ServerNotification {
        ServerNotification {
            server_name: "a".into(),
            level: "info".into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_logging_message_keeps_level() {
        let notif = JsonRpcNotification::new(
            LOGGING_MESSAGE_METHOD,
            Some(json!({"level": "warning", "data": "disk low"})),
        );
        let n = ServerNotification::from_jsonrpc("a", &notif);
        assert_eq!(n.level, "warning");
        assert_eq!(n.message, "disk low");

        let notif = JsonRpcNotification::new(
            LOGGING_MESSAGE_METHOD,
            Some(json!({"level": "error", "data": {"code": 3}})),
        );
        assert_eq!(
            ServerNotification::from_jsonrpc("a", &notif).message,
            r#"{"code":3}"#
        );
    }

    #[test]
    fn test_other_methods_are_info() {
        let notif = JsonRpcNotification::new("notifications/tools/list_changed", None);
        let n = ServerNotification::from_jsonrpc("srv", &notif);
        assert_eq!(n.server_name, "srv");
        assert_eq!(n.level, "info");
        assert_eq!(n.message, "notifications/tools/list_changed");
    }

    #[test]
    fn test_queue_then_deliver_to_consumer() {
        let router = NotificationRouter::new(10);
        router.route(note("queued"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.set_consumer(Arc::new(move |n| sink.lock().unwrap().push(n.message)));
        router.route(note("live"));

        assert_eq!(*seen.lock().unwrap(), vec!["live".to_string()]);
        let drained = router.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message, "queued");
        assert!(router.drain().is_empty());

        router.clear_consumer();
        router.route(note("after"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(router.drain()[0].message, "after");
    }

    #[test]
    fn test_pending_queue_drops_oldest() {
        let router = NotificationRouter::new(2);
        for m in ["one", "two", "three"] {
            router.route(note(m));
        }
        let messages: Vec<_> = router.drain().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }
}
