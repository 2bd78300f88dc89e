//! Observable state containers
//!
//! Every stateful component funnels its mutations through a [`StatePublisher`],
//! so subscribers see each committed change as one consistent snapshot.

use tokio::sync::watch;

/// Holds the current value of a state record and notifies subscribers when
/// an update actually changes it
#[derive(Debug)]
pub struct StatePublisher<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> StatePublisher<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Receiver that yields on every committed change
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Apply `mutate` atomically. Returns whether the state changed.
    pub fn update(&self, mutate: impl FnOnce(&mut T)) -> bool {
        self.tx.send_if_modified(|state| {
            let before = state.clone();
            mutate(state);
            *state != before
        })
    }

    /// Read a projection of the current state without cloning all of it
    pub fn read<R>(&self, project: impl FnOnce(&T) -> R) -> R {
        project(&self.tx.borrow())
    }
}

impl<T: Clone + PartialEq + Default> Default for StatePublisher<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter {
        value: u32,
        label: String,
    }

    #[tokio::test]
    async fn test_update_notifies_only_on_change() {
        let publisher = StatePublisher::<Counter>::default();
        let mut rx = publisher.subscribe();

        assert!(!publisher.update(|state| state.value = 0));
        assert!(!rx.has_changed().unwrap());

        assert!(publisher.update(|state| {
            state.value = 2;
            state.label = "two".to_string();
        }));
        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.value, 2);
        assert_eq!(seen.label, "two");
    }

    #[test]
    fn test_update_without_subscribers() {
        let publisher = StatePublisher::new(Counter::default());
        publisher.update(|state| state.value = 7);
        assert_eq!(publisher.snapshot().value, 7);
        assert_eq!(publisher.read(|state| state.value), 7);
    }
}
