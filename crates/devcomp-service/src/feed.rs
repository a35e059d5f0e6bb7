//! Streaming infeed/outfeed queues and channels.
//!
//! All three use [`FeedQueue`]: an unbounded producer/consumer queue whose
//! waits can be bounded by a deadline and interrupted by a [`CancelToken`].

use devcomp_ir::{Literal, Shape};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::handle::{ChannelHandle, ChannelKind, DeviceHandle};

/// Why a blocking pop returned without a value.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitError {
    TimedOut,
    Cancelled,
    /// The value at the front has this shape, which was not expected. It
    /// stays queued.
    Mismatch(Shape),
}

#[derive(Debug, Default)]
pub struct FeedQueue {
    items: Mutex<VecDeque<Literal>>,
    ready: Condvar,
}

impl FeedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, literal: Literal) {
        self.items.lock().push_back(literal);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued value, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    /// Wake every waiter so it re-checks its cancellation state.
    pub fn interrupt(&self) {
        let _items = self.items.lock();
        self.ready.notify_all();
    }

    /// Block until a value is available and pop it.
    ///
    /// With `expected`, the front value must be compatible with that shape,
    /// otherwise [`WaitError::Mismatch`] is returned and the value is left
    /// in place.
    pub fn pop(
        self: &Arc<Self>,
        expected: Option<&Shape>,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> Result<Literal, WaitError> {
        let _registration = cancel.map(|token| token.register(self));
        let mut items = self.items.lock();
        loop {
            if let Some(front) = items.front() {
                if let Some(expected) = expected {
                    let actual = front.shape();
                    if !actual.compatible(expected) {
                        return Err(WaitError::Mismatch(actual));
                    }
                }
                if let Some(value) = items.pop_front() {
                    return Ok(value);
                }
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(WaitError::Cancelled);
            }
            match deadline {
                Some(deadline) => {
                    let result = self.ready.wait_until(&mut items, deadline);
                    if result.timed_out() && items.is_empty() {
                        return Err(WaitError::TimedOut);
                    }
                }
                None => self.ready.wait(&mut items),
            }
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<Literal> {
        self.items.lock().pop_front()
    }
}

/// Cancellation flag for one execution.
///
/// Queues register themselves while a wait is in progress so that
/// cancelling wakes the waiter instead of leaving it blocked.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    waiting: Mutex<Vec<Arc<FeedQueue>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let waiting = self.waiting.lock().clone();
        for queue in waiting {
            queue.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, queue: &Arc<FeedQueue>) -> WaitRegistration<'_> {
        self.waiting.lock().push(Arc::clone(queue));
        WaitRegistration {
            token: self,
            queue: Arc::clone(queue),
        }
    }
}

struct WaitRegistration<'a> {
    token: &'a CancelToken,
    queue: Arc<FeedQueue>,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        let mut waiting = self.token.waiting.lock();
        if let Some(position) = waiting.iter().position(|q| Arc::ptr_eq(q, &self.queue)) {
            waiting.swap_remove(position);
        }
    }
}

/// Infeed and outfeed queues keyed by device and replica.
#[derive(Debug, Default)]
pub struct FeedRegistry {
    infeeds: Mutex<HashMap<(DeviceHandle, u32), Arc<FeedQueue>>>,
    outfeeds: Mutex<HashMap<(DeviceHandle, u32), Arc<FeedQueue>>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn infeed(&self, device: DeviceHandle, replica: u32) -> Arc<FeedQueue> {
        Arc::clone(self.infeeds.lock().entry((device, replica)).or_default())
    }

    pub fn outfeed(&self, device: DeviceHandle, replica: u32) -> Arc<FeedQueue> {
        Arc::clone(self.outfeeds.lock().entry((device, replica)).or_default())
    }

    /// Empty every queue of `device`, returning the number of dropped values.
    ///
    /// Queues stay registered: executions already submitted hold them.
    pub fn clear_device(&self, device: DeviceHandle) -> usize {
        let mut dropped = 0;
        for table in [&self.infeeds, &self.outfeeds] {
            for ((owner, _), queue) in table.lock().iter() {
                if *owner == device {
                    dropped += queue.clear();
                }
            }
        }
        dropped
    }
}

/// A point-to-point channel between replicas or between host and device.
#[derive(Debug)]
pub struct Channel {
    pub handle: ChannelHandle,
    pub kind: ChannelKind,
    pub queue: Arc<FeedQueue>,
}

impl Channel {
    pub fn new(handle: ChannelHandle, kind: ChannelKind) -> Self {
        Self {
            handle,
            kind,
            queue: Arc::new(FeedQueue::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcomp_ir::ElementType;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = Arc::new(FeedQueue::new());
        queue.push(Literal::s32(1));
        queue.push(Literal::s32(2));
        assert_eq!(queue.pop(None, None, None).unwrap(), Literal::s32(1));
        assert_eq!(queue.try_pop(), Some(Literal::s32(2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_times_out() {
        let queue = Arc::new(FeedQueue::new());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            queue.pop(None, Some(deadline), None),
            Err(WaitError::TimedOut)
        );
    }

    #[test]
    fn test_mismatch_leaves_value_queued() {
        let queue = Arc::new(FeedQueue::new());
        queue.push(Literal::s32(3));
        let expected = Shape::scalar(ElementType::F32);
        assert_eq!(
            queue.pop(Some(&expected), None, None),
            Err(WaitError::Mismatch(Shape::scalar(ElementType::S32)))
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(FeedQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push(Literal::f32(1.5));
        });
        assert_eq!(queue.pop(None, None, None).unwrap(), Literal::f32(1.5));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let queue = Arc::new(FeedQueue::new());
        let token = Arc::new(CancelToken::new());
        let waiter_queue = Arc::clone(&queue);
        let waiter_token = Arc::clone(&token);
        let handle =
            thread::spawn(move || waiter_queue.pop(None, None, Some(&waiter_token)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(handle.join().unwrap(), Err(WaitError::Cancelled));
        assert!(token.waiting.lock().is_empty());
    }

    #[test]
    fn test_clear_device_keeps_queues() {
        let feeds = FeedRegistry::new();
        let device = DeviceHandle(1);
        let infeed = feeds.infeed(device, 0);
        infeed.push(Literal::s32(1));
        feeds.outfeed(device, 1).push(Literal::s32(2));
        feeds.infeed(DeviceHandle(2), 0).push(Literal::s32(3));
        assert_eq!(feeds.clear_device(device), 2);
        assert!(Arc::ptr_eq(&infeed, &feeds.infeed(device, 0)));
        assert_eq!(feeds.infeed(DeviceHandle(2), 0).len(), 1);
    }
}
