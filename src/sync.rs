use log::*;
use tokio::sync::{broadcast, mpsc};

pub type Sender<T> = mpsc::UnboundedSender<T>;
pub type Receiver<T> = mpsc::UnboundedReceiver<T>;

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    mpsc::unbounded_channel()
}

/// Signals a subscriber may fall behind by before the oldest ones are dropped for it.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Source of typed signals with any number of subscribers.
///
/// Subscribers only observe signals emitted after they subscribed. Dropping a
/// [`Subscription`] unsubscribes it.
///
/// Each subscriber buffers up to the subject's capacity. A subscriber that falls further
/// behind loses the oldest signals, so a request waiting for one of them runs into its
/// timeout.
pub struct Subject<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> Subject<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription(self.sender.subscribe())
    }

    /// Delivers `signal` to all current subscribers and returns their count.
    pub fn emit(&self, signal: E) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for Subject<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Subject<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

pub struct Subscription<E>(broadcast::Receiver<E>);

impl<E: Clone> Subscription<E> {
    /// Waits for the next signal. Returns `None` once the subject is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.0.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("subscriber lagged behind, {} signals dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next already emitted signal, if any.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.0.try_recv() {
                Ok(v) => return Some(v),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("subscriber lagged behind, {} signals dropped", n);
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lagging_subscriber_keeps_newest() {
        let subject = Subject::with_capacity(2);
        let mut sub = subject.subscribe();
        for i in 1..=3 {
            assert_eq!(subject.emit(i), 1);
        }
        assert_eq!(sub.try_recv(), Some(2));
        assert_eq!(sub.try_recv(), Some(3));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn late_subscriber_sees_only_new_signals() {
        let subject = Subject::new();
        subject.emit("early");
        let mut sub = subject.subscribe();
        subject.emit("late");
        assert_eq!(sub.try_recv(), Some("late"));
        drop(sub);
        assert_eq!(subject.subscriber_count(), 0);
    }
}
