//! Session observers
//!
//! Observers are held weakly; a dropped observer simply stops receiving
//! calls. Fan-out iterates a snapshot so callbacks may register or remove
//! observers.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::Error;
use crate::media::sample::{AudioBuffer, AudioFormat, MediaTime, SampleBuffer, VideoFormat};

use super::state::ReadyState;

/// Media delivered by a playing session
#[derive(Debug, Clone)]
pub enum Media {
    Video(SampleBuffer),
    /// Audio buffer and its presentation time
    Audio(AudioBuffer, MediaTime),
}

/// Inbound format change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// Callbacks from a session task; all methods default to no-ops
pub trait SessionObserver: Send + Sync {
    fn ready_state_changed(&self, _state: ReadyState) {}

    fn media_received(&self, _media: &Media) {}

    fn format_changed(&self, _format: &Format) {}

    /// Every expected media type has flowed since the last activation
    fn ready(&self) {}

    fn error_occurred(&self, _error: &Error) {}
}

/// Weak observer registry
pub(crate) struct WeakRegistry<T: ?Sized> {
    observers: Mutex<Vec<Weak<T>>>,
}

pub(crate) type ObserverRegistry = WeakRegistry<dyn SessionObserver>;

impl<T: ?Sized> Default for WeakRegistry<T> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> WeakRegistry<T> {
    pub(crate) fn add(&self, observer: Weak<T>) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|o| o.strong_count() > 0 && !o.ptr_eq(&observer));
        observers.push(observer);
    }

    pub(crate) fn remove(&self, observer: &Weak<T>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|o| !o.ptr_eq(observer));
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn notify(&self, f: impl Fn(&T)) {
        for observer in self.snapshot() {
            f(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SessionObserver for Counter {
        fn ready(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_registry_skips_dropped_observers() {
        let registry = ObserverRegistry::default();
        let kept = Arc::new(Counter::default());
        let dropped = Arc::new(Counter::default());
        let kept_dyn: Arc<dyn SessionObserver> = kept.clone();
        let dropped_dyn: Arc<dyn SessionObserver> = dropped;
        registry.add(Arc::downgrade(&kept_dyn));
        registry.add(Arc::downgrade(&dropped_dyn));
        drop(dropped_dyn);

        registry.notify(|o| o.ready());
        assert_eq!(kept.0.load(Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_registry_add_is_idempotent_and_remove() {
        let registry = ObserverRegistry::default();
        let observer: Arc<dyn SessionObserver> = Arc::new(Counter::default());
        let weak = Arc::downgrade(&observer);
        registry.add(weak.clone());
        registry.add(weak.clone());
        assert_eq!(registry.snapshot().len(), 1);

        registry.remove(&weak);
        assert!(registry.snapshot().is_empty());
    }
}
