//! Parameter-change notification.
//!
//! Every parameter owned by a client model carries an ordered list of
//! callbacks.  The state space model attaches one callback per client model
//! that bumps a shared generation counter, so cached Kalman filter output is
//! known to be stale exactly when a parameter or datum actually changed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Synchronous change callback.
pub type ChangeObserver = Arc<dyn Fn() + Send + Sync>;

/// Ordered list of change callbacks, invoked in registration order.
#[derive(Clone, Default)]
pub struct Observers {
    callbacks: Vec<ChangeObserver>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: ChangeObserver) {
        self.callbacks.push(observer);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn notify(&self) {
        for callback in &self.callbacks {
            callback();
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observers({})", self.callbacks.len())
    }
}

/// A scalar parameter that notifies its observers when its value changes.
#[derive(Debug, Clone, Default)]
pub struct UnivParam {
    value: f64,
    observers: Observers,
}

impl UnivParam {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            observers: Observers::new(),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Set the value.  Observers fire only if the bit pattern changed.
    pub fn set(&mut self, value: f64) {
        if value.to_bits() != self.value.to_bits() {
            self.value = value;
            self.observers.notify();
        }
    }

    pub fn add_observer(&mut self, observer: ChangeObserver) {
        self.observers.add(observer);
    }
}

/// Generation counter shared between a model and the callbacks it hands out.
#[derive(Debug, Clone, Default)]
pub struct ChangeCounter {
    generation: Arc<AtomicU64>,
}

impl ChangeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// A callback that invalidates everything stamped with an older generation.
    pub fn observer(&self) -> ChangeObserver {
        let generation = Arc::clone(&self.generation);
        Arc::new(move || {
            generation.fetch_add(1, Ordering::AcqRel);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_univ_param_notifies_on_change_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let mut p = UnivParam::new(1.0);
        p.add_observer(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        p.set(1.0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        p.set(2.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!((p.value() - 2.0).abs() < 1e-15);
        p.set(2.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observers_called_in_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut obs = Observers::new();
        for i in 0..3 {
            let l = Arc::clone(&log);
            obs.add(Arc::new(move || l.lock().unwrap().push(i)));
        }
        obs.notify();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(obs.len(), 3);
    }

    #[test]
    fn test_change_counter_observer_bumps_generation() {
        let counter = ChangeCounter::new();
        let g0 = counter.current();
        let cb = counter.observer();
        cb();
        cb();
        assert_eq!(counter.current(), g0 + 2);
        counter.bump();
        assert_eq!(counter.current(), g0 + 3);
    }
}
