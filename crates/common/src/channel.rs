//! Bounded event bridge between blocking threads and the Tokio runtime
//!
//! Both ends can be used from synchronous code (`*_blocking`, `try_*`) and
//! from async code, so the same bridge feeds USB worker threads, deferred
//! work queues and async front-ends.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

/// Sending half of an event bridge
pub struct EventSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> EventSender<T> {
    /// Send an event from async code
    pub async fn send(&self, event: T) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send an event, blocking while the bridge is full
    pub fn send_blocking(&self, event: T) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send without blocking; gives the event back when full or closed
    pub fn try_send(&self, event: T) -> std::result::Result<(), T> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) | TrySendError::Closed(event) => event,
        })
    }

    /// Close the bridge; receivers drain what is queued, then see an error
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Receiving half of an event bridge
pub struct EventReceiver<T> {
    rx: Receiver<T>,
}

impl<T> Clone for EventReceiver<T> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}

impl<T> EventReceiver<T> {
    /// Receive an event from async code
    pub async fn recv(&self) -> crate::Result<T> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<T> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    ///
    /// `Ok(None)` means the bridge is open but empty.
    pub fn try_recv(&self) -> crate::Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(crate::Error::Channel("bridge closed".into())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a bounded event bridge
///
/// Returns (sender, receiver); both halves may be cloned freely.
pub fn create_event_bridge<T>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_thread_to_async() {
        let (tx, rx) = create_event_bridge::<u32>(8);

        let handle = std::thread::spawn(move || {
            for i in 0..4 {
                tx.send_blocking(i).unwrap();
            }
        });

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(rx.recv().await.unwrap());
        }
        handle.join().unwrap();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_try_send_full_returns_event() {
        let (tx, rx) = create_event_bridge::<&str>(1);
        tx.try_send("a").unwrap();
        assert_eq!(tx.try_send("b"), Err("b"));
        assert_eq!(rx.try_recv().unwrap(), Some("a"));
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn test_close_drains_then_errors() {
        let (tx, rx) = create_event_bridge::<u8>(4);
        tx.send_blocking(7).unwrap();
        tx.close();
        assert_eq!(rx.recv_blocking().unwrap(), 7);
        assert!(rx.recv_blocking().is_err());
        assert!(rx.try_recv().is_err());
    }
}
