//! Routine mailboxes: id-numbered bounded message queues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};

use beam_core::error::{BeamError, Result};

/// Identifier of a routine, unique within the process.
pub type RoutineId = u64;

static NEXT_ROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// Take the next id from the process-wide counter.
pub(crate) fn next_routine_id() -> RoutineId {
    NEXT_ROUTINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A bounded queue addressed by a routine id.
///
/// The id is unset until the mailbox is registered with an agent, and can
/// only be assigned once.
#[derive(Debug)]
pub struct Mailbox {
    // 0 = unassigned; ids start at 1.
    id: AtomicU64,
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id: AtomicU64::new(0),
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> Option<RoutineId> {
        match self.id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Assign the next process-wide id. Fails if an id is already set.
    pub fn assign_id(&self) -> Result<RoutineId> {
        if let Some(id) = self.id() {
            return Err(BeamError::RoutineIdAssigned { id });
        }
        let id = next_routine_id();
        match self.id.compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(id),
            Err(existing) => Err(BeamError::RoutineIdAssigned { id: existing }),
        }
    }

    /// Push a message, waiting for room if the queue is full.
    pub async fn deliver(&self, message: Bytes) -> Result<()> {
        let closing = self.close_signal.notified();
        if self.is_closed() {
            return Err(self.closed_error());
        }
        tokio::select! {
            res = self.tx.send(message) => res.map_err(|_| self.closed_error()),
            _ = closing => Err(self.closed_error()),
        }
    }

    /// Wait for the next message. `None` once the mailbox is closed and
    /// drained.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        let closing = self.close_signal.notified();
        if self.is_closed() {
            return rx.try_recv().ok();
        }
        tokio::select! {
            msg = rx.recv() => msg,
            _ = closing => rx.try_recv().ok(),
        }
    }

    /// Take a message if one is queued and no receiver is currently waiting.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Refuse further deliveries and wake the receiver.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> BeamError {
        BeamError::ConnectionClosed(format!("mailbox {}", self.id().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_assign_id_once() {
        let mailbox = Mailbox::new(4);
        assert_eq!(mailbox.id(), None);
        let id = mailbox.assign_id().unwrap();
        assert!(id >= 1);
        assert_eq!(mailbox.id(), Some(id));
        assert!(matches!(
            mailbox.assign_id(),
            Err(BeamError::RoutineIdAssigned { id: existing }) if existing == id
        ));
    }

    #[test]
    fn test_ids_increase_across_mailboxes() {
        let a = Mailbox::new(1).assign_id().unwrap();
        let b = Mailbox::new(1).assign_id().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_deliver_and_recv_in_order() {
        let mailbox = Mailbox::new(4);
        mailbox.deliver(Bytes::from_static(b"one")).await.unwrap();
        mailbox.deliver(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.recv().await.unwrap(), "one");
        assert_eq!(mailbox.try_recv().unwrap(), "two");
        assert!(mailbox.try_recv().is_none());
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_full_mailbox_waits_for_room() {
        let mailbox = Arc::new(Mailbox::new(1));
        mailbox.deliver(Bytes::from_static(b"first")).await.unwrap();

        let pending = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.deliver(Bytes::from_static(b"second")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(mailbox.recv().await.unwrap(), "first");
        pending.await.unwrap().unwrap();
        assert_eq!(mailbox.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_close_wakes_receiver_and_rejects_delivery() {
        let mailbox = Arc::new(Mailbox::new(2));
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        mailbox.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(mailbox.deliver(Bytes::from_static(b"late")).await.is_err());
    }
}
