//! The event bus: a process-local, typed pub/sub multiplexing
//! DNS lifecycle events to live subscribers. Built on `tokio::broadcast`:
//! publish never blocks, and a subscriber that falls behind the bounded
//! queue receives `Lagged` and resumes from the next event rather than
//! applying backpressure to the resolver.

use crate::constants::EVENT_BUS_QUEUE_SIZE;
use crate::drivers::LogEntry;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    DnsLogEvent,
    DnsStatus,
    DnsCache,
    DnsDenylist,
    DnsAllowlist,
    DnsInfo,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DnsLogEvent => "dns/log/event",
            Topic::DnsStatus => "dns/status",
            Topic::DnsCache => "dns/cache/",
            Topic::DnsDenylist => "dns/denylist/",
            Topic::DnsAllowlist => "dns/allowlist/",
            Topic::DnsInfo => "dns/info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Started,
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub port: u16,
    pub providers: Vec<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeNotification {
    pub role: String,
    pub key: String,
    pub action: String,
}

/// Payload carried by an `Event`; shape matches the data model object for
/// the event's topic.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Log(LogEntry),
    Status(StatusSnapshot),
    Change(ChangeNotification),
    ConfigSnapshot(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    pub timestamp: i64,
    pub payload: EventPayload,
}

pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_QUEUE_SIZE);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort, non-blocking publish: never blocks the pipeline.
    /// No subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn publish_status(&self, state: LifecycleState, port: u16, providers: Vec<String>, detail: Option<String>) {
        self.publish(Event {
            topic: Topic::DnsStatus,
            timestamp: crate::drivers::cache_driver::now_ms(),
            payload: EventPayload::Status(StatusSnapshot {
                state,
                port,
                providers,
                detail,
            }),
        });
    }

    pub fn publish_log(&self, entry: LogEntry) {
        self.publish(Event {
            topic: Topic::DnsLogEvent,
            timestamp: entry.timestamp(),
            payload: EventPayload::Log(entry),
        });
    }

    pub fn publish_change(&self, topic: Topic, role: &str, key: &str, action: &str) {
        self.publish(Event {
            topic,
            timestamp: crate::drivers::cache_driver::now_ms(),
            payload: EventPayload::Change(ChangeNotification {
                role: role.to_string(),
                key: key.to_string(),
                action: action.to_string(),
            }),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish_status(LifecycleState::Started, 5300, vec!["cloudflare".into()], None);
        bus.publish_status(LifecycleState::Stopped, 5300, vec![], None);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            EventPayload::Status(StatusSnapshot {
                state: LifecycleState::Started,
                ..
            })
        ));
        assert!(matches!(
            second.payload,
            EventPayload::Status(StatusSnapshot {
                state: LifecycleState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish_status(LifecycleState::Started, 5300, vec![], None);
    }
}
