use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::event::DashboardEvent;

/// Queue depth per subscriber before the oldest event is dropped.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscriber {
  /// When set, only events for this session are delivered.
  session: Option<String>,
  queue: Mutex<VecDeque<DashboardEvent>>,
  notify: Notify,
  capacity: usize,
  closed: AtomicBool,
  dropped: AtomicU64,
}

impl Subscriber {
  fn push(&self, event: DashboardEvent) {
    let mut queue = self.queue.lock().expect("subscriber queue poisoned");
    if queue.len() >= self.capacity {
      queue.pop_front();
      let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
      warn!(dropped, "slow dashboard subscriber, dropping oldest event");
    }
    queue.push_back(event);
    drop(queue);
    self.notify.notify_one();
  }
}

/// Publishes per-session events to zero or more subscribers.
///
/// `publish` never suspends and never blocks on a consumer; each subscriber
/// has a bounded queue with a drop-oldest overflow policy. Per-subscriber
/// ordering matches publication order.
pub struct DashboardEventBus {
  subscribers: Mutex<Vec<Arc<Subscriber>>>,
  capacity: usize,
}

impl DashboardEventBus {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      subscribers: Mutex::new(Vec::new()),
      capacity,
    }
  }

  /// Subscribe to every event on this bus.
  pub fn subscribe(&self) -> EventSubscription {
    self.add_subscriber(None)
  }

  /// Subscribe to events for a single session.
  pub fn subscribe_session(&self, session: &str) -> EventSubscription {
    self.add_subscriber(Some(session.to_string()))
  }

  fn add_subscriber(&self, session: Option<String>) -> EventSubscription {
    let subscriber = Arc::new(Subscriber {
      session,
      queue: Mutex::new(VecDeque::new()),
      notify: Notify::new(),
      capacity: self.capacity,
      closed: AtomicBool::new(false),
      dropped: AtomicU64::new(0),
    });
    self
      .subscribers
      .lock()
      .expect("subscriber list poisoned")
      .push(subscriber.clone());
    EventSubscription { inner: subscriber }
  }

  /// Deliver an event to every live subscriber interested in its session.
  pub fn publish(&self, event: DashboardEvent) {
    let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
    subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
    for subscriber in subscribers.iter() {
      let interested = subscriber
        .session
        .as_deref()
        .is_none_or(|session| session == event.session());
      if interested {
        subscriber.push(event.clone());
      }
    }
  }

  /// Number of live subscribers, for introspection in tests.
  pub fn subscriber_count(&self) -> usize {
    let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
    subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
    subscribers.len()
  }
}

impl Default for DashboardEventBus {
  fn default() -> Self {
    Self::new()
  }
}

/// A handle to one subscriber's queue. Dropping it detaches the subscriber
/// from the bus.
pub struct EventSubscription {
  inner: Arc<Subscriber>,
}

impl EventSubscription {
  /// Wait for the next event.
  pub async fn recv(&mut self) -> DashboardEvent {
    loop {
      if let Some(event) = self.try_recv() {
        return event;
      }
      self.inner.notify.notified().await;
    }
  }

  /// Pop the next event without waiting.
  pub fn try_recv(&mut self) -> Option<DashboardEvent> {
    self
      .inner
      .queue
      .lock()
      .expect("subscriber queue poisoned")
      .pop_front()
  }

  /// Events dropped because this subscriber fell behind.
  pub fn dropped(&self) -> u64 {
    self.inner.dropped.load(Ordering::Relaxed)
  }
}

impl Drop for EventSubscription {
  fn drop(&mut self) {
    self.inner.closed.store(true, Ordering::Release);
  }
}
