//! Typed multicast registry for transport and session events.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// Handle to a registered callback.
///
/// Clones share identity: unsubscribing with any clone removes the
/// registration made with another.
pub struct Listener<T> {
    callback: Arc<Callback<T>>,
}

impl<T> Listener<T> {
    /// Wrap a callback in a new listener handle.
    #[must_use]
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Whether both handles refer to the same callback.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }

    fn call(&self, value: &T) {
        (self.callback)(value);
    }
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("callback", &Arc::as_ptr(&self.callback).cast::<()>())
            .finish()
    }
}

/// Ordered list of listeners invoked synchronously on every broadcast.
///
/// Each broadcaster owns its own list; there is no global registry.
/// `call_all` works on a snapshot, so a listener may unsubscribe itself
/// (or subscribe others) mid-broadcast and the change applies from the
/// next broadcast on. A panicking listener is not caught.
pub struct EventBroadcaster<T> {
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> Default for EventBroadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventBroadcaster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<T> EventBroadcaster<T> {
    /// Create an empty broadcaster.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener at the end of the list.
    ///
    /// The same handle may be registered more than once; it is then
    /// invoked once per registration.
    pub fn subscribe(&self, listener: Listener<T>) {
        self.lock().push(listener);
    }

    /// Register a callback and return its handle.
    pub fn listen<F>(&self, callback: F) -> Listener<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener = Listener::new(callback);
        self.subscribe(listener.clone());
        listener
    }

    /// Remove the first registration of `listener`.
    ///
    /// Returns whether anything was removed.
    pub fn unsubscribe(&self, listener: &Listener<T>) -> bool {
        let mut listeners = self.lock();
        match listeners.iter().position(|l| l.same_as(listener)) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Invoke every listener, in subscription order, with `value`.
    pub fn call_all(&self, value: &T) {
        let snapshot = self.lock().clone();
        for listener in &snapshot {
            listener.call(value);
        }
    }

    /// Remove all listeners.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Listener<T>>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> EventBroadcaster<T>
where
    T: Clone + Send + 'static,
{
    /// Forward every broadcast into a stream.
    ///
    /// Unsubscribe the returned listener to end the stream.
    pub fn stream(&self) -> (Listener<T>, UnboundedReceiverStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.listen(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        (listener, UnboundedReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener<u32> {
        let log = Arc::clone(log);
        Listener::new(move |v: &u32| log.lock().unwrap().push(format!("{tag}:{v}")))
    }

    #[test]
    fn test_call_all_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let events = EventBroadcaster::new();
        events.subscribe(recorder(&log, "a"));
        events.subscribe(recorder(&log, "b"));
        events.subscribe(recorder(&log, "c"));

        events.call_all(&7);

        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7", "c:7"]);
    }

    #[test]
    fn test_unsubscribe_removes_first_match_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let listener = Listener::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let events = EventBroadcaster::new();
        events.subscribe(listener.clone());
        events.subscribe(listener.clone());

        assert!(events.unsubscribe(&listener));
        assert_eq!(events.len(), 1);

        events.call_all(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(events.unsubscribe(&listener));
        assert!(!events.unsubscribe(&listener));
        assert!(events.is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_listener() {
        let events = EventBroadcaster::<u32>::new();
        events.listen(|_| {});
        let stranger = Listener::new(|_: &u32| {});
        assert!(!events.unsubscribe(&stranger));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_clear() {
        let events = EventBroadcaster::<u32>::new();
        events.listen(|_| {});
        events.listen(|_| {});
        events.clear();
        assert!(events.is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_itself_during_broadcast() {
        let events = Arc::new(EventBroadcaster::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Listener<u32>>>> = Arc::new(Mutex::new(None));

        let listener = {
            let events = Arc::clone(&events);
            let hits = Arc::clone(&hits);
            let slot = Arc::clone(&slot);
            Listener::new(move |_: &u32| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().unwrap().take() {
                    events.unsubscribe(&me);
                }
            })
        };
        *slot.lock().unwrap() = Some(listener.clone());
        events.subscribe(listener);

        let later = Arc::new(AtomicUsize::new(0));
        let later_hits = Arc::clone(&later);
        events.listen(move |_| {
            later_hits.fetch_add(1, Ordering::SeqCst);
        });

        events.call_all(&1);
        events.call_all(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(later.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_receives_broadcasts() {
        let events = EventBroadcaster::<u32>::new();
        let (listener, mut stream) = events.stream();

        events.call_all(&1);
        events.call_all(&2);
        assert!(events.unsubscribe(&listener));
        drop(listener);
        events.call_all(&3);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, None);
    }
}
