//! Event dispatcher — single-consumer ordered delivery with a bounded queue.
//!
//! Producers never wait on the consumer. Events queue in a bounded FIFO
//! while the listener is busy; a full queue sheds its oldest entries and
//! the loss is reported as one `Overflow` warning delivered ahead of the
//! surviving events.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use msgr_core::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::{Event, EventKind, Warning, WarningKind};

/// Result of handing a pre-sequenced event to [`EventDispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// Queued after a gap warning for the missing range.
    QueuedAfterGap { missing: u64 },
    /// Sequence not newer than the last accepted one; dropped.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub accepted: u64,
    pub delivered: u64,
    pub dropped_overflow: u64,
    pub stale: u64,
    pub gaps: u64,
}

#[derive(Debug, Clone, Copy)]
struct OverflowSummary {
    dropped: u64,
    first_sequence: u64,
    last_sequence: u64,
}

impl OverflowSummary {
    fn into_event(self) -> Event {
        Event::new(
            self.last_sequence,
            EventKind::Warning(Warning::new(
                WarningKind::Overflow {
                    dropped: self.dropped,
                    first_sequence: self.first_sequence,
                    last_sequence: self.last_sequence,
                },
                format!(
                    "listener fell behind; dropped {} events ({}..={})",
                    self.dropped, self.first_sequence, self.last_sequence
                ),
            )),
        )
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Event>,
    last_sequence: u64,
    overflow: Option<OverflowSummary>,
    registered: bool,
    closed: bool,
    stats: DispatcherStats,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

/// Cloneable handle; all clones feed the same consumer.
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<Shared>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    // ---------------------------------------------------------------
    // Consumer side
    // ---------------------------------------------------------------

    /// Register the one consumer. Returns the delivery loop, which the
    /// caller spawns; it runs until [`EventDispatcher::close`].
    pub fn register<F, Fut>(&self, listener: F) -> Result<BoxFuture<'static, ()>>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(Error::NotConnected);
            }
            if inner.registered {
                return Err(Error::ListenerAlreadyRegistered);
            }
            inner.registered = true;
        }

        let shared = self.shared.clone();
        Ok(Box::pin(async move {
            loop {
                let next = {
                    let mut inner = shared.inner.lock();
                    if inner.closed {
                        break;
                    }
                    let next = match inner.overflow.take() {
                        Some(summary) => Some(summary.into_event()),
                        None => inner.queue.pop_front(),
                    };
                    if next.is_some() {
                        inner.stats.delivered += 1;
                    }
                    next
                };

                match next {
                    Some(event) => listener(event).await,
                    None => shared.notify.notified().await,
                }
            }
            debug!("Event delivery loop finished");
        }))
    }

    pub fn is_registered(&self) -> bool {
        self.shared.inner.lock().registered
    }

    // ---------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------

    /// Enqueue `kind` under the next sequence number. Returns the number.
    pub fn publish(&self, kind: EventKind) -> Result<u64> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(Error::NotConnected);
        }
        let sequence = inner.last_sequence + 1;
        inner.last_sequence = sequence;
        self.enqueue(&mut inner, Event::new(sequence, kind));
        drop(inner);

        self.shared.notify.notify_one();
        Ok(sequence)
    }

    /// Accept an event that already carries a sequence number.
    pub fn dispatch(&self, event: Event) -> Result<DispatchOutcome> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(Error::NotConnected);
        }

        let expected = inner.last_sequence + 1;
        if event.sequence < expected {
            inner.stats.stale += 1;
            debug!(
                "Dropping stale event {} (last accepted {})",
                event.sequence, inner.last_sequence
            );
            return Ok(DispatchOutcome::Stale);
        }

        let outcome = if event.sequence > expected {
            let missing = event.sequence - expected;
            warn!(
                "Sequence gap: expected {}, received {}",
                expected, event.sequence
            );
            inner.stats.gaps += 1;
            let gap = Event::new(
                expected,
                EventKind::Warning(Warning::new(
                    WarningKind::SequenceGap {
                        expected,
                        received: event.sequence,
                    },
                    format!("{} events missing before {}", missing, event.sequence),
                )),
            );
            self.enqueue(&mut inner, gap);
            DispatchOutcome::QueuedAfterGap { missing }
        } else {
            DispatchOutcome::Queued
        };

        inner.last_sequence = event.sequence;
        self.enqueue(&mut inner, event);
        drop(inner);

        self.shared.notify.notify_one();
        Ok(outcome)
    }

    fn enqueue(&self, inner: &mut Inner, event: Event) {
        if inner.queue.len() >= self.shared.capacity {
            if let Some(old) = inner.queue.pop_front() {
                inner.stats.dropped_overflow += 1;
                let summary = inner.overflow.get_or_insert(OverflowSummary {
                    dropped: 0,
                    first_sequence: old.sequence,
                    last_sequence: old.sequence,
                });
                summary.dropped += 1;
                summary.last_sequence = old.sequence;
                if summary.dropped == 1 {
                    warn!("Event queue full; shedding oldest events");
                }
            }
        }
        inner.stats.accepted += 1;
        inner.queue.push_back(event);
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Stop delivery. Pending events are discarded and later publishes fail.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let discarded = inner.queue.len();
        inner.queue.clear();
        inner.overflow = None;
        drop(inner);

        self.shared.notify.notify_one();
        debug!("Dispatcher closed, {} pending events discarded", discarded);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.inner.lock().last_sequence
    }

    pub fn pending(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.shared.inner.lock().stats
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("EventDispatcher")
            .field("capacity", &self.shared.capacity)
            .field("pending", &inner.queue.len())
            .field("last_sequence", &inner.last_sequence)
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PresenceEvent, PresenceStatus};
    use tokio::sync::mpsc;

    fn presence(user: &str) -> EventKind {
        EventKind::Presence(PresenceEvent {
            user_id: user.into(),
            status: PresenceStatus::Online,
            last_active: None,
            thread_id: None,
        })
    }

    fn collector(dispatcher: &EventDispatcher) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = dispatcher
            .register(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                }
            })
            .unwrap();
        tokio::spawn(delivery);
        rx
    }

    #[tokio::test]
    async fn test_delivers_in_sequence_order() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = collector(&dispatcher);

        for seq in 1..=3 {
            let outcome = dispatcher.dispatch(Event::new(seq, presence("u"))).unwrap();
            assert_eq!(outcome, DispatchOutcome::Queued);
        }

        for seq in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().sequence, seq);
        }
    }

    #[tokio::test]
    async fn test_gap_emits_warning() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = collector(&dispatcher);

        dispatcher.dispatch(Event::new(1, presence("a"))).unwrap();
        let outcome = dispatcher.dispatch(Event::new(4, presence("b"))).unwrap();
        assert_eq!(outcome, DispatchOutcome::QueuedAfterGap { missing: 2 });

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        let gap = rx.recv().await.unwrap();
        assert_eq!(gap.sequence, 2);
        match gap.kind {
            EventKind::Warning(w) => assert_eq!(
                w.kind,
                WarningKind::SequenceGap {
                    expected: 2,
                    received: 4
                }
            ),
            other => panic!("expected gap warning, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap().sequence, 4);
        assert_eq!(dispatcher.stats().gaps, 1);
    }

    #[tokio::test]
    async fn test_stale_events_are_dropped() {
        let dispatcher = EventDispatcher::new(16);
        dispatcher.dispatch(Event::new(1, presence("a"))).unwrap();
        dispatcher.dispatch(Event::new(2, presence("a"))).unwrap();
        assert_eq!(
            dispatcher.dispatch(Event::new(2, presence("a"))).unwrap(),
            DispatchOutcome::Stale
        );
        assert_eq!(
            dispatcher.dispatch(Event::new(1, presence("a"))).unwrap(),
            DispatchOutcome::Stale
        );
        assert_eq!(dispatcher.pending(), 2);
        assert_eq!(dispatcher.stats().stale, 2);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_reports_once() {
        let dispatcher = EventDispatcher::new(3);
        for i in 0..5 {
            dispatcher.publish(presence(&i.to_string())).unwrap();
        }
        assert_eq!(dispatcher.pending(), 3);

        let mut rx = collector(&dispatcher);
        let summary = rx.recv().await.unwrap();
        assert_eq!(summary.sequence, 2);
        match summary.kind {
            EventKind::Warning(w) => assert_eq!(
                w.kind,
                WarningKind::Overflow {
                    dropped: 2,
                    first_sequence: 1,
                    last_sequence: 2
                }
            ),
            other => panic!("expected overflow warning, got {:?}", other),
        }
        for seq in 3..=5 {
            assert_eq!(rx.recv().await.unwrap().sequence, seq);
        }
        assert_eq!(dispatcher.stats().dropped_overflow, 2);
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_producer() {
        let dispatcher = EventDispatcher::new(2);
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener_gate = gate.clone();
        let delivery = dispatcher
            .register(move |event: Event| {
                let gate = listener_gate.clone();
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.sequence);
                    if event.sequence == 1 {
                        gate.notified().await;
                    }
                }
            })
            .unwrap();
        tokio::spawn(delivery);

        dispatcher.publish(presence("first")).unwrap();
        let mut seen = vec![rx.recv().await.unwrap()];
        for _ in 0..4 {
            dispatcher.publish(presence("burst")).unwrap();
        }
        gate.notify_one();

        while seen.len() < 4 {
            seen.push(rx.recv().await.unwrap());
        }
        // 1 delivered, 2 and 3 shed (summary carries 3), 4 and 5 survive.
        assert_eq!(seen, vec![1, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_second_listener_rejected() {
        let dispatcher = EventDispatcher::new(4);
        let _rx = collector(&dispatcher);
        let second = dispatcher.register(|_event| async {});
        assert!(matches!(second, Err(Error::ListenerAlreadyRegistered)));
    }

    #[tokio::test]
    async fn test_close_discards_and_rejects() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.publish(presence("a")).unwrap();
        dispatcher.close();
        assert_eq!(dispatcher.pending(), 0);
        assert!(matches!(dispatcher.publish(presence("b")), Err(Error::NotConnected)));
        assert!(dispatcher.is_closed());
        assert!(dispatcher.register(|_event| async {}).is_err());
    }
}
