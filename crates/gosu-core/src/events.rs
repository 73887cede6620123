//! Process-wide named events.
//!
//! An event is addressed by name; signalling it dispatches concurrently to
//! every subscription. Two subscription styles exist:
//!
//! - **async**: every signal spawns a fresh invocation of the callback;
//! - **buffered**: signals coalesce through an atomic counter. The 0→1
//!   transition elects a single drain task that keeps invoking the callback
//!   until the counter returns to zero, so a burst of signals produces at
//!   least one and at most burst-many invocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use futures::future::BoxFuture;

/// Callback invoked when an event fires.
pub type EventFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Removal sentinel for buffered queues: once installed, drains stop and
/// further signals never elect a new drain. Far enough from `i32::MIN`
/// that the drain's decrement cannot wrap.
const QUEUE_DEAD: i32 = i32::MIN / 2;

static EVENTS: LazyLock<RwLock<HashMap<String, Arc<NamedEvent>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));
static SUB_SEQ: AtomicU64 = AtomicU64::new(1);

struct BufferedSub {
    callback: EventFn,
    queue: AtomicI32,
}

impl BufferedSub {
    fn signal(sub: &Arc<BufferedSub>) {
        if sub.queue.fetch_add(1, Ordering::SeqCst) + 1 == 1 {
            let sub = sub.clone();
            tokio::spawn(async move {
                loop {
                    (sub.callback)().await;
                    if sub.queue.fetch_sub(1, Ordering::SeqCst) - 1 <= 0 {
                        break;
                    }
                }
            });
        }
    }
}

enum Subscription {
    Async(EventFn),
    Buffered(Arc<BufferedSub>),
}

impl Subscription {
    fn signal(&self) {
        match self {
            Subscription::Async(callback) => {
                let callback = callback.clone();
                tokio::spawn(async move { callback().await });
            }
            Subscription::Buffered(sub) => BufferedSub::signal(sub),
        }
    }
}

#[derive(Default)]
pub struct NamedEvent {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
}

impl NamedEvent {
    fn signal(&self) {
        for sub in self.subscriptions.read().unwrap().values() {
            sub.signal();
        }
    }
}

fn named_event(name: &str, insert: bool) -> Option<Arc<NamedEvent>> {
    if let Some(event) = EVENTS.read().unwrap().get(name) {
        return Some(event.clone());
    }
    if !insert {
        return None;
    }
    let mut events = EVENTS.write().unwrap();
    Some(events.entry(name.to_string()).or_default().clone())
}

/// Fire the named event; a no-op when nothing ever subscribed to it.
pub fn signal(name: &str) {
    tracing::debug!(event = name, "signaling event");
    if let Some(event) = named_event(name, false) {
        event.signal();
    }
}

fn subscribe(name: &str, sub: Subscription) -> EventGuard {
    let event = named_event(name, true).expect("insert");
    let id = SUB_SEQ.fetch_add(1, Ordering::Relaxed);
    event.subscriptions.write().unwrap().insert(id, sub);
    EventGuard { event, id }
}

/// Subscribe; every signal spawns the callback.
pub fn listen(name: &str, callback: EventFn) -> EventGuard {
    subscribe(name, Subscription::Async(callback))
}

/// Subscribe with coalescing; concurrent signals fold into a drain loop.
pub fn listen_buffered(name: &str, callback: EventFn) -> EventGuard {
    subscribe(
        name,
        Subscription::Buffered(Arc::new(BufferedSub {
            callback,
            queue: AtomicI32::new(0),
        })),
    )
}

/// Detaches the subscription when dropped or explicitly removed.
pub struct EventGuard {
    event: Arc<NamedEvent>,
    id: u64,
}

impl EventGuard {
    pub fn remove(&self) {
        let mut subs = self.event.subscriptions.write().unwrap();
        if let Some(sub) = subs.get(&self.id) {
            // Race against a running drain: the sentinel wins over pending
            // signals, and a second remove is a no-op.
            if let Subscription::Buffered(buffered) = sub {
                if buffered.queue.swap(QUEUE_DEAD, Ordering::SeqCst) < 0 {
                    return;
                }
            }
            subs.remove(&self.id);
        }
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter_callback(counter: Arc<AtomicUsize>) -> EventFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn async_subscription_runs_per_signal() {
        let hits = Arc::new(AtomicUsize::new(0));
        let _guard = listen("evt-async", counter_callback(hits.clone()));
        for _ in 0..5 {
            signal("evt-async");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn removed_subscription_stops_firing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = listen("evt-removed", counter_callback(hits.clone()));
        signal("evt-removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.remove();
        signal("evt-removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signal_without_subscribers_is_noop() {
        signal("evt-nobody");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn buffered_subscription_coalesces() {
        let hits = Arc::new(AtomicUsize::new(0));
        let slow: EventFn = {
            let hits = hits.clone();
            Arc::new(move || {
                let hits = hits.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        let _guard = listen_buffered("evt-burst", slow);

        let mut tasks = Vec::new();
        for _ in 0..100 {
            tasks.push(tokio::spawn(async { signal("evt-burst") }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        // Let the drain loop run dry.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let count = hits.load(Ordering::SeqCst);
        assert!(count >= 1, "callback never ran");
        assert!(count <= 100, "callback ran more than once per signal");
    }

    #[tokio::test]
    async fn buffered_remove_races_cleanly_with_drain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = listen_buffered("evt-race", counter_callback(hits.clone()));
        signal("evt-race");
        guard.remove();
        guard.remove();
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal("evt-race");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hits.load(Ordering::SeqCst) <= 1);
    }
}
