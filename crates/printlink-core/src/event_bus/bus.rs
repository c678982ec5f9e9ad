//! The bus itself.
//!
//! Handlers run synchronously on the publishing thread in the order they
//! subscribed. The engine publishes only after releasing its state lock,
//! so a handler may call back into the connection.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{AppEvent, EventCategory};

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Which events a handler wants
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these categories.
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    pub fn matches(&self, event: &AppEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

type Handler = Arc<dyn Fn(AppEvent) + Send + Sync>;

/// Bus sizing
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Slots in the broadcast channel behind [`EventBus::receiver`]
    pub channel_capacity: usize,
    /// Events kept for [`EventBus::history`]; zero keeps none
    pub history_len: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_len: 0,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EventBusError {
    /// Nobody, neither handler nor receiver, saw the event
    #[error("No active subscribers")]
    NoSubscribers,
}

/// Publish/subscribe hub for printer notifications
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    handlers: RwLock<BTreeMap<SubscriptionId, (EventFilter, Handler)>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<AppEvent>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(config.history_len)),
            config,
        }
    }

    /// Deliver `event` to matching handlers, then to async receivers
    ///
    /// The handler table is snapshotted first, so handlers may subscribe,
    /// unsubscribe or publish. Returns how many receivers were reached.
    pub fn publish(&self, event: AppEvent) -> Result<usize, EventBusError> {
        self.remember(&event);

        let matching: Vec<Handler> = self
            .handlers
            .read()
            .values()
            .filter(|(filter, _)| filter.matches(&event))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        let delivered = !matching.is_empty();
        for handler in matching {
            handler(event.clone());
        }

        match self.sender.send(event) {
            Ok(receivers) => Ok(receivers),
            Err(_) if delivered => Ok(0),
            Err(_) => Err(EventBusError::NoSubscribers),
        }
    }

    /// Publish events in order; an unheard event is not an error here
    pub fn publish_all(&self, events: impl IntoIterator<Item = AppEvent>) {
        for event in events {
            tracing::trace!("event: {}", event.description());
            let _ = self.publish(event);
        }
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(AppEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, (filter, Arc::new(handler)));
        tracing::debug!("{} subscribed", id);
        id
    }

    /// Broadcast receiver for tokio tasks; lagging receivers lose events
    pub fn receiver(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Returns false when `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.handlers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("{} unsubscribed", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// The last `history_len` events, oldest first
    pub fn history(&self) -> Vec<AppEvent> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    fn remember(&self, event: &AppEvent) {
        if self.config.history_len == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.config.history_len {
            history.pop_front();
        }
        history.push_back(event.clone());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::events::{ConnectionEvent, MachineEvent};
    use std::sync::atomic::AtomicUsize;

    fn fan(speed: u8) -> AppEvent {
        AppEvent::Machine(MachineEvent::FanSpeedSet { speed })
    }

    fn connected(port: &str) -> AppEvent {
        AppEvent::Connection(ConnectionEvent::ConnectionSucceeded {
            port: port.to_string(),
        })
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(EventFilter::All, move |_| seen.lock().push(tag));
        }

        bus.publish(fan(10)).expect("delivered");
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_twice() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventFilter::All, |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unheard_event_is_reported() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.publish(fan(0)),
            Err(EventBusError::NoSubscribers)
        ));
    }

    #[test]
    fn test_category_filter() {
        let bus = EventBus::new();
        let machine = Arc::new(AtomicUsize::new(0));
        let counter = machine.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Machine]),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let _ = bus.publish(connected("/dev/ttyACM0"));
        let _ = bus.publish(fan(255));
        assert_eq!(machine.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_shot_handler_removes_itself() {
        let bus = Arc::new(EventBus::new());
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let (weak_bus, slot, count) = (Arc::downgrade(&bus), own_id.clone(), calls.clone());
        let id = bus.subscribe(EventFilter::All, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            if let (Some(bus), Some(id)) = (weak_bus.upgrade(), slot.lock().take()) {
                bus.unsubscribe(id);
            }
        });
        *own_id.lock() = Some(id);

        let _ = bus.publish(fan(1));
        let _ = bus.publish(fan(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_history_keeps_latest() {
        let bus = EventBus::with_config(EventBusConfig {
            history_len: 3,
            ..Default::default()
        });
        for speed in 0..6u8 {
            let _ = bus.publish(fan(speed));
        }
        assert_eq!(bus.history(), vec![fan(3), fan(4), fan(5)]);

        bus.clear_history();
        assert!(bus.history().is_empty());
        assert!(EventBus::new().history().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_sees_published_events() {
        let bus = EventBus::new();
        let mut receiver = bus.receiver();

        assert_eq!(bus.publish(connected("sim")).expect("received"), 1);
        assert_eq!(receiver.recv().await.expect("event"), connected("sim"));
    }
}
