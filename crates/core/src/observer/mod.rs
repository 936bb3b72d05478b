use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned by [`Observers::subscribe`]. Hand it back to
/// [`Observers::unsubscribe`] to detach the callback.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "dropping the token makes the callback impossible to detach"]
pub struct Subscription {
    id: u64,
}

/// Registry of outward callbacks for a single event kind.
pub struct Observers<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<T>)>>,
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Registers `callback` and returns the token that removes it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push((id, Arc::new(callback)));
        }
        Subscription { id }
    }

    /// Returns `false` when the token was already detached.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let Ok(mut callbacks) = self.callbacks.lock() else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != subscription.id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every callback with `value`. The registry lock is released
    /// before the callbacks run, so they may subscribe or unsubscribe.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for callback in snapshot {
            callback(value);
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notifies_until_unsubscribed() {
        let observers = Observers::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let sink = total.clone();
        let token = observers.subscribe(move |value| {
            sink.fetch_add(*value as usize, Ordering::SeqCst);
        });

        observers.notify(&3);
        observers.notify(&4);
        assert_eq!(total.load(Ordering::SeqCst), 7);

        assert!(observers.unsubscribe(token));
        observers.notify(&100);
        assert_eq!(total.load(Ordering::SeqCst), 7);
        assert!(observers.is_empty());
    }

    #[test]
    fn callbacks_may_reenter_the_registry() {
        let observers = Arc::new(Observers::<()>::new());
        let inner = observers.clone();
        let _token = observers.subscribe(move |_| {
            let _nested = inner.subscribe(|_| {});
        });

        observers.notify(&());
        assert_eq!(observers.len(), 2);
    }
}
