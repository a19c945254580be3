//! A hub sink that keeps every event for assertions.

use datasync_engine::{HubEvent, HubSink};
use parking_lot::Mutex;

/// Records dispatched hub events in order.
#[derive(Debug, Default)]
pub struct RecordingHub {
    events: Mutex<Vec<HubEvent>>,
}

impl RecordingHub {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far.
    pub fn events(&self) -> Vec<HubEvent> {
        self.events.lock().clone()
    }

    /// Event names so far.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(HubEvent::name).collect()
    }

    /// Number of events named `name`.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Whether an event named `name` was recorded.
    pub fn contains(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl HubSink for RecordingHub {
    fn dispatch(&self, event: HubEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let hub = RecordingHub::new();
        hub.dispatch(HubEvent::SubscriptionsEstablished);
        hub.dispatch(HubEvent::NetworkStatus { active: true });
        hub.dispatch(HubEvent::Ready);
        assert_eq!(hub.names(), vec!["subscriptionsEstablished", "networkStatus", "ready"]);
        assert_eq!(hub.count("ready"), 1);
        hub.clear();
        assert!(!hub.contains("ready"));
    }
}
