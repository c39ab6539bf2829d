// ABOUTME: Synchronous observer list plus a broadcast channel for engine events.
// ABOUTME: Listeners run in registration order; a panicking listener is caught and logged.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fieldlog_core::EngineEvent;
use parking_lot::Mutex;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the id was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Receive every event asynchronously. Slow receivers may observe
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn emit(&self, event: EngineEvent) {
        // Snapshot so listeners may register or unregister while being called.
        let listeners: Vec<(ListenerId, Listener)> = self.listeners.lock().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(listener = id.0, event = event.name(), "event listener panicked");
            }
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.on(move |_| seen.lock().push(n));
        }

        bus.emit(EngineEvent::Ready);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(|_| panic!("listener bug"));
        let c = Arc::clone(&count);
        bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(EngineEvent::Ready);
        bus.emit(EngineEvent::Ready);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_unregisters() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(EngineEvent::Ready);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::Ready);
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::Ready);
    }
}
