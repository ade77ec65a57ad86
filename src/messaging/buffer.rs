//! Local buffer between a listener's consumer workers and its caller

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::message::{AckHandle, Acknowledgement, ReceivedResult};
use crate::error::{CoordinationError, CoordinationResult};

#[derive(Debug)]
pub(crate) enum BufferedItem {
    Result(ReceivedResult),
    /// A message that could not be decoded. The handle is dropped when the
    /// caller sees the error, releasing the worker that produced it.
    Poison(CoordinationError, AckHandle),
}

#[derive(Debug, Default)]
pub(crate) struct ResultBuffer {
    items: Mutex<VecDeque<BufferedItem>>,
    available: Notify,
    closed: AtomicBool,
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand an item to the caller. Once closed, the item comes back so the
    /// worker can NACK it.
    pub fn push(&self, item: BufferedItem) -> Result<(), BufferedItem> {
        {
            let mut items = self.items.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next buffered result, waiting up to `timeout`
    pub async fn pop(&self, timeout: Duration) -> CoordinationResult<Option<ReceivedResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Ok(None);
            }
            if let Some(item) = self.items.lock().pop_front() {
                return match item {
                    BufferedItem::Result(result) => Ok(Some(result)),
                    BufferedItem::Poison(error, _handle) => Err(error),
                };
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Refuse further items and NACK everything still buffered. Returns how
    /// many results were NACKed.
    pub fn close(&self) -> usize {
        let drained: Vec<BufferedItem> = {
            let mut items = self.items.lock();
            self.closed.store(true, Ordering::Release);
            items.drain(..).collect()
        };
        self.available.notify_waiters();

        let mut nacked = 0;
        for item in drained {
            match item {
                BufferedItem::Result(result) => {
                    result.acknowledge(Acknowledgement::Nack);
                    nacked += 1;
                }
                BufferedItem::Poison(_, handle) => handle.acknowledge(Acknowledgement::Nack),
            }
        }
        nacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::ResultMessage;

    fn result(id: &str) -> (BufferedItem, tokio::sync::oneshot::Receiver<Acknowledgement>) {
        let (handle, rx) = AckHandle::new();
        (
            BufferedItem::Result(ReceivedResult::new(ResultMessage::empty(id), handle)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_pop_in_push_order() {
        let buffer = ResultBuffer::new();
        let (a, _rx_a) = result("a");
        let (b, _rx_b) = result("b");
        buffer.push(a).unwrap();
        buffer.push(b).unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(buffer.pop(timeout).await.unwrap().unwrap().id(), "a");
        assert_eq!(buffer.pop(timeout).await.unwrap().unwrap().id(), "b");
        assert!(buffer.pop(timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_nacks_buffered_and_refuses_new() {
        let buffer = ResultBuffer::new();
        let (a, mut rx_a) = result("a");
        buffer.push(a).unwrap();

        assert_eq!(buffer.close(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), Acknowledgement::Nack);

        let (late, _rx) = result("late");
        assert!(buffer.push(late).is_err());
        assert!(buffer.pop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poison_surfaces_as_error() {
        let buffer = ResultBuffer::new();
        let (handle, mut rx) = AckHandle::new();
        buffer
            .push(BufferedItem::Poison(
                CoordinationError::serialization("result", "bad"),
                handle,
            ))
            .unwrap();

        let err = buffer.pop(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CoordinationError::SerializationFailure { .. }));
        assert_eq!(rx.try_recv().unwrap(), Acknowledgement::Nack);
    }
}
