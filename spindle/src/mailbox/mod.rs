//! Single-producer single-consumer mailboxes.
//!
//! A [`Mailbox`] is a bounded ring buffer shared by exactly one producing task
//! and one consuming task. When a side cannot make progress it registers a
//! [`Listener`] in its slot of the mailbox and pauses. The other side takes the
//! listener out and delivers a wakeup once it has published progress, so each
//! pause is released exactly once.
//!
//! Handles are cheap to clone: the producer and the consumer each keep a clone
//! of the same mailbox.
use crate::task::{Event, Listener, ListenerCell, PauseReason};
use crate::utils::{ScopeGuard, ThreadNotify};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

mod error;
pub use error::MailboxError;

mod future;
pub use future::{Get, Put};

/// Capacity used by [`Mailbox::default`], before rounding.
pub const DEFAULT_CAPACITY: usize = 10;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A bounded SPSC channel between two tasks.
///
/// The capacity is always a power of two so slot lookup is a mask. At most one
/// task may put and at most one task may get at any time. Two producers (or two
/// consumers) running concurrently make the mailbox panic.
///
/// ```no_run
/// use spindle::mailbox::Mailbox;
///
/// # #[spindle::main(worker_threads = 2)]
/// # async fn main() {
/// let mailbox = Mailbox::new(4);
/// let producer = mailbox.clone();
///
/// spindle::spawn(async move {
///     for i in 0..10 {
///         producer.put(i).await;
///     }
/// });
///
/// for i in 0..10 {
///     assert_eq!(mailbox.get().await, i);
/// }
/// # }
/// ```
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    id: u64,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,

    /// Next slot to consume. Written by the consumer only.
    head: CachePadded<AtomicUsize>,

    /// Next slot to produce. Written by the producer only.
    tail: CachePadded<AtomicUsize>,

    /// Producer's last observed `head`.
    head_cache: CachePadded<UnsafeCell<usize>>,

    /// Consumer's last observed `tail`.
    tail_cache: CachePadded<UnsafeCell<usize>>,

    producer_busy: AtomicBool,
    consumer_busy: AtomicBool,

    /// Consumer waiting for a message.
    sink: ListenerCell,

    /// Producer waiting for a free slot.
    source: ListenerCell,
}

// Safety: slots are only written by the side holding the producer guard and
// only read by the side holding the consumer guard, with `tail`/`head`
// publishing ownership of each slot. The caches are private to their side.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Mailbox<T> {
    /// Creates a mailbox holding at least `capacity` messages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or cannot be rounded up to a power of two.
    #[track_caller]
    pub fn new(capacity: usize) -> Self {
        match Self::with_capacity(capacity) {
            Ok(mailbox) => mailbox,
            Err(e) => panic!("{e}"),
        }
    }

    /// Creates a mailbox holding at least `capacity` messages. The capacity is
    /// rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Result<Self, MailboxError> {
        if capacity == 0 {
            return Err(MailboxError::InvalidCapacity);
        }

        let capacity = capacity
            .checked_next_power_of_two()
            .ok_or(MailboxError::CapacityOverflow(capacity))?;

        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                buffer,
                mask: capacity - 1,
                head: CachePadded::new(AtomicUsize::new(0)),
                tail: CachePadded::new(AtomicUsize::new(0)),
                head_cache: CachePadded::new(UnsafeCell::new(0)),
                tail_cache: CachePadded::new(UnsafeCell::new(0)),
                producer_busy: AtomicBool::new(false),
                consumer_busy: AtomicBool::new(false),
                sink: ListenerCell::new(),
                source: ListenerCell::new(),
            }),
        })
    }

    /// Puts `msg` if a slot is free. Returns the message back otherwise.
    pub fn try_put(&self, msg: T) -> Result<(), T> {
        self.inner.try_put(msg)
    }

    /// Like [`try_put`](Self::try_put), but on failure registers `listener`
    /// to be woken with [`Event::SpaceAvailable`] once a slot frees up.
    pub fn try_put_with(&self, msg: T, listener: &Arc<Listener>) -> Result<(), T> {
        self.inner.try_put_with(msg, listener)
    }

    /// Takes the oldest message, if any.
    pub fn try_get(&self) -> Option<T> {
        self.inner.try_get()
    }

    /// Like [`try_get`](Self::try_get), but on failure registers `listener`
    /// to be woken with [`Event::MessageAvailable`] once a message arrives.
    pub fn try_get_with(&self, listener: &Arc<Listener>) -> Option<T> {
        self.inner.try_get_with(listener)
    }

    /// Moves up to `max` buffered messages into `buf` without waiting. Returns
    /// how many were moved.
    pub fn drain_into(&self, buf: &mut Vec<T>, max: usize) -> usize {
        self.inner.drain_into(buf, max)
    }

    /// Drops every buffered message. Calling it on an empty mailbox is a
    /// no-op. Acts as the consumer.
    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_empty(&self) -> bool {
        !self.inner.has_message()
    }

    pub fn is_full(&self) -> bool {
        !self.inner.has_space()
    }

    pub fn has_message(&self) -> bool {
        self.inner.has_message()
    }

    pub fn has_space(&self) -> bool {
        self.inner.has_space()
    }

    /// Returns `true` if `listener` is registered on this mailbox and the
    /// condition it waits for already holds, meaning its wakeup is due.
    pub fn is_ready_to_resume(&self, listener: &Arc<Listener>) -> bool {
        (self.inner.sink.is(listener) && self.inner.has_message())
            || (self.inner.source.is(listener) && self.inner.has_space())
    }
}

impl<T: Send + 'static> Mailbox<T> {
    /// Puts `msg`, pausing the task while the mailbox is full.
    pub async fn put(&self, msg: T) {
        if self.put_inner(msg, None).await.is_err() {
            unreachable!("a put without deadline cannot time out");
        }
    }

    /// Puts `msg`, pausing at most `timeout` for a free slot. The message is
    /// handed back on timeout.
    pub fn put_timeout(&self, msg: T, timeout: Duration) -> Put<'_, T> {
        self.put_inner(msg, Some(timeout))
    }

    /// Takes the oldest message, pausing the task while the mailbox is empty.
    pub async fn get(&self) -> T {
        match self.get_inner(None).await {
            Some(msg) => msg,
            None => unreachable!("a get without deadline cannot time out"),
        }
    }

    /// Takes the oldest message, pausing at most `timeout` for one to arrive.
    /// Returns `None` on timeout.
    pub fn get_timeout(&self, timeout: Duration) -> Get<'_, T> {
        self.get_inner(Some(timeout))
    }

    /// Puts every message of `msgs` in order. Whatever fits is published in one
    /// go, waking the consumer once, before pausing for more space.
    pub async fn put_all<I>(&self, msgs: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut msgs = msgs.into_iter().peekable();

        while msgs.peek().is_some() {
            if self.inner.put_batch(&mut msgs) > 0 {
                continue;
            }

            if let Some(msg) = msgs.next() {
                self.put(msg).await;
            }
        }
    }

    /// Waits for at least one message, then moves up to `max` messages into
    /// `buf`. Returns how many were moved.
    pub async fn fill(&self, buf: &mut Vec<T>, max: usize) -> usize {
        if max == 0 {
            return 0;
        }

        buf.push(self.get().await);
        1 + self.inner.drain_into(buf, max - 1)
    }

    /// Puts `msg` from a thread that is not running a task, parking the thread
    /// while the mailbox is full. With a `timeout`, the message is handed back
    /// if no slot frees up in time.
    pub fn put_blocking(&self, mut msg: T, timeout: Option<Duration>) -> Result<(), T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let notify = ThreadNotify::current();

        loop {
            let listener = Listener::new(notify.waker());
            match self.inner.try_put_with(msg, &listener) {
                Ok(()) => return Ok(()),
                Err(returned) => msg = returned,
            }

            if !park(&notify, deadline) {
                self.inner.source.remove(&listener);
                return self.inner.try_put(msg);
            }
        }
    }

    /// Takes a message from a thread that is not running a task, parking the
    /// thread while the mailbox is empty. Returns `None` on timeout.
    pub fn get_blocking(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let notify = ThreadNotify::current();

        loop {
            let listener = Listener::new(notify.waker());
            if let Some(msg) = self.inner.try_get_with(&listener) {
                return Some(msg);
            }

            if !park(&notify, deadline) {
                self.inner.sink.remove(&listener);
                return self.inner.try_get();
            }
        }
    }

    fn put_inner(&self, msg: T, timeout: Option<Duration>) -> Put<'_, T> {
        Put::new(self, msg, timeout)
    }

    fn get_inner(&self, timeout: Option<Duration>) -> Get<'_, T> {
        Get::new(self, timeout)
    }
}

fn park(notify: &ThreadNotify, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => notify.park_until(deadline),
        None => {
            notify.park();
            true
        }
    }
}

impl<T> Inner<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn len(&self) -> usize {
        // `head` first, so `tail` can only be ahead of it.
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        std::cmp::min(tail.wrapping_sub(head), self.capacity())
    }

    fn has_message(&self) -> bool {
        self.len() > 0
    }

    fn has_space(&self) -> bool {
        self.len() < self.capacity()
    }

    fn producer(&self) -> ScopeGuard<impl FnOnce() + '_> {
        enter_side(&self.producer_busy, "producers")
    }

    fn consumer(&self) -> ScopeGuard<impl FnOnce() + '_> {
        enter_side(&self.consumer_busy, "consumers")
    }

    /// Free slots as seen by the producer. Refreshes the cached `head` only
    /// when the cached view shows a full buffer.
    ///
    /// Caller must hold the producer guard.
    unsafe fn free_slots(&self, tail: usize) -> usize {
        let head_cache = unsafe { &mut *self.head_cache.get() };

        if tail.wrapping_sub(*head_cache) == self.capacity() {
            *head_cache = self.head.load(Ordering::Acquire);
        }

        let used = tail.wrapping_sub(*head_cache);
        debug_assert!(used <= self.capacity(), "tail ran past head");
        self.capacity() - used
    }

    /// Buffered messages as seen by the consumer. Refreshes the cached `tail`
    /// only when the cached view shows an empty buffer.
    ///
    /// Caller must hold the consumer guard.
    unsafe fn available(&self, head: usize) -> usize {
        let tail_cache = unsafe { &mut *self.tail_cache.get() };

        if *tail_cache == head {
            *tail_cache = self.tail.load(Ordering::Acquire);
        }

        let available = tail_cache.wrapping_sub(head);
        debug_assert!(available <= self.capacity(), "head ran past tail");
        available
    }

    /// Caller must hold the producer guard and have checked for a free slot.
    unsafe fn write(&self, pos: usize, msg: T) {
        unsafe { (*self.buffer[pos & self.mask].get()).write(msg) };
    }

    /// Caller must hold the consumer guard and have checked that `pos` was
    /// published.
    unsafe fn read(&self, pos: usize) -> T {
        unsafe { (*self.buffer[pos & self.mask].get()).assume_init_read() }
    }

    fn push(&self, msg: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);

        // Safety: callers hold the producer guard.
        if unsafe { self.free_slots(tail) } == 0 {
            return Err(msg);
        }

        unsafe { self.write(tail, msg) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        // Safety: callers hold the consumer guard.
        if unsafe { self.available(head) } == 0 {
            return None;
        }

        let msg = unsafe { self.read(head) };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(msg)
    }

    fn notify_consumer(&self) {
        if let Some(listener) = self.sink.take() {
            listener.deliver(Event::MessageAvailable);
        }
    }

    fn notify_producer(&self) {
        if let Some(listener) = self.source.take() {
            listener.deliver(Event::SpaceAvailable);
        }
    }

    fn try_put(&self, msg: T) -> Result<(), T> {
        let _side = self.producer();
        self.push(msg)?;
        self.notify_consumer();
        Ok(())
    }

    fn try_put_with(&self, msg: T, listener: &Arc<Listener>) -> Result<(), T> {
        let _side = self.producer();

        let msg = match self.push(msg) {
            Ok(()) => {
                self.notify_consumer();
                return Ok(());
            }
            Err(msg) => msg,
        };

        drop(self.source.set(Arc::clone(listener)));

        // A slot may have freed up before the listener was visible.
        match self.push(msg) {
            Ok(()) => {
                self.source.remove(listener);
                self.notify_consumer();
                Ok(())
            }
            Err(msg) => Err(msg),
        }
    }

    fn try_get(&self) -> Option<T> {
        let _side = self.consumer();
        let msg = self.pop()?;
        self.notify_producer();
        Some(msg)
    }

    fn try_get_with(&self, listener: &Arc<Listener>) -> Option<T> {
        let _side = self.consumer();

        if let Some(msg) = self.pop() {
            self.notify_producer();
            return Some(msg);
        }

        drop(self.sink.set(Arc::clone(listener)));

        // A message may have landed before the listener was visible.
        let msg = self.pop()?;
        self.sink.remove(listener);
        self.notify_producer();
        Some(msg)
    }

    /// Writes as many messages as fit, then publishes them with a single
    /// store.
    fn put_batch<I>(&self, msgs: &mut I) -> usize
    where
        I: Iterator<Item = T>,
    {
        let _side = self.producer();
        let tail = self.tail.load(Ordering::Relaxed);

        // Safety: producer guard held.
        let free = unsafe { self.free_slots(tail) };

        let mut written = 0;
        for msg in msgs.by_ref().take(free) {
            unsafe { self.write(tail.wrapping_add(written), msg) };
            written += 1;
        }

        if written > 0 {
            self.tail
                .store(tail.wrapping_add(written), Ordering::Release);
            self.notify_consumer();
        }

        written
    }

    fn drain_into(&self, buf: &mut Vec<T>, max: usize) -> usize {
        let _side = self.consumer();
        let head = self.head.load(Ordering::Relaxed);

        // Safety: consumer guard held.
        let count = std::cmp::min(unsafe { self.available(head) }, max);
        if count == 0 {
            return 0;
        }

        buf.reserve(count);
        for i in 0..count {
            buf.push(unsafe { self.read(head.wrapping_add(i)) });
        }

        self.head.store(head.wrapping_add(count), Ordering::Release);
        self.notify_producer();
        count
    }

    fn clear(&self) {
        let _side = self.consumer();
        let mut cleared = 0;

        while let Some(msg) = self.pop() {
            drop(msg);
            cleared += 1;
        }

        if cleared > 0 {
            tracing::trace!(mailbox = self.id, cleared, "cleared mailbox");
            self.notify_producer();
        }
    }
}

/// Marks one side of the mailbox busy until the returned guard drops.
fn enter_side<'a>(busy: &'a AtomicBool, side: &'static str) -> ScopeGuard<impl FnOnce() + 'a> {
    assert!(
        !busy.swap(true, Ordering::Acquire),
        "concurrent {side} on a single-producer single-consumer mailbox"
    );

    ScopeGuard::new(move || busy.store(false, Ordering::Release))
}

impl<T: Send> PauseReason for Inner<T> {
    fn is_valid(&self, listener: &Arc<Listener>) -> bool {
        if self.sink.is(listener) {
            !self.has_message()
        } else if self.source.is(listener) {
            !self.has_space()
        } else {
            false
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut pos = *self.head.get_mut();
        let tail = *self.tail.get_mut();

        while pos != tail {
            // Safety: slots in `head..tail` hold published messages and nobody
            // else can reach them anymore.
            unsafe { self.buffer[pos & self.mask].get_mut().assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> fmt::Display for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mailbox(id={}, len={}, capacity={})",
            self.inner.id,
            self.len(),
            self.capacity()
        )
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("sink", &self.inner.sink)
            .field("source", &self.inner.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as spindle;
    use crate::test_utils::{CountPolls, mock_waker};
    use crate::time::sleep;
    use anyhow::Result;
    use rstest::rstest;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;
    use std::sync::atomic::Ordering;
    use std::thread;

    assert_impl_all!(Mailbox<u32>: Send, Sync, Clone);
    assert_not_impl_any!(Mailbox<Rc<u32>>: Send, Sync);

    #[rstest]
    #[case::one(1, 1)]
    #[case::three(3, 4)]
    #[case::default_size(DEFAULT_CAPACITY, 16)]
    #[case::exact(16, 16)]
    #[case::large(1000, 1024)]
    fn test_capacity_is_rounded(#[case] requested: usize, #[case] expected: usize) {
        let mailbox = Mailbox::<u32>::new(requested);
        assert_eq!(mailbox.capacity(), expected);
        assert!(mailbox.is_empty());
        assert!(!mailbox.is_full());
    }

    #[test]
    fn test_invalid_capacity() {
        assert_eq!(
            Mailbox::<u32>::with_capacity(0).err(),
            Some(MailboxError::InvalidCapacity)
        );
        assert_eq!(
            Mailbox::<u32>::with_capacity(usize::MAX).err(),
            Some(MailboxError::CapacityOverflow(usize::MAX))
        );
        assert_eq!(Mailbox::<u32>::default().capacity(), 16);
    }

    #[test]
    fn test_try_put_fails_when_full() {
        let mailbox = Mailbox::new(4);

        for i in 0..4 {
            assert!(mailbox.try_put(i).is_ok());
        }
        assert!(mailbox.is_full());
        assert_eq!(mailbox.try_put(99), Err(99));
        assert_eq!(mailbox.len(), 4);

        // State is intact after the failed put.
        assert_eq!(mailbox.try_get(), Some(0));
        assert!(mailbox.try_put(4).is_ok());

        let drained = std::iter::from_fn(|| mailbox.try_get()).collect::<Vec<_>>();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(mailbox.try_get().is_none());
    }

    #[test]
    fn test_wraps_around_many_times() {
        let mailbox = Mailbox::new(2);

        for i in 0..1000 {
            assert!(mailbox.try_put(i).is_ok());
            assert_eq!(mailbox.try_get(), Some(i));
        }
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_consumer_listener_woken_once() {
        let mailbox = Mailbox::new(4);
        let (waker, data) = mock_waker();
        let listener = Listener::new(waker);

        assert!(mailbox.try_get_with(&listener).is_none());
        assert!(mailbox.inner.sink.is(&listener));
        assert!(mailbox.inner.is_valid(&listener));
        assert!(!mailbox.is_ready_to_resume(&listener));

        mailbox.try_put(1).unwrap();
        mailbox.try_put(2).unwrap();

        assert_eq!(data.get_count(), 1);
        assert_eq!(listener.delivered(), Some(Event::MessageAvailable));
        assert!(mailbox.inner.sink.is_empty());
        assert!(!mailbox.inner.is_valid(&listener));
    }

    #[test]
    fn test_producer_listener_woken_on_get() {
        let mailbox = Mailbox::new(1);
        let (waker, data) = mock_waker();
        let listener = Listener::new(waker);

        mailbox.try_put(1).unwrap();
        assert_eq!(mailbox.try_put_with(2, &listener), Err(2));
        assert!(mailbox.inner.source.is(&listener));

        mailbox.clear();
        assert_eq!(data.get_count(), 1);
        assert_eq!(listener.delivered(), Some(Event::SpaceAvailable));

        // No progress, no wakeup.
        mailbox.clear();
        assert_eq!(data.get_count(), 1);
    }

    #[test]
    fn test_ready_to_resume_when_registered_and_satisfied() {
        let mailbox = Mailbox::new(2);
        let (waker, _) = mock_waker();
        let listener = Listener::new(waker);

        // Registration done by hand so the cell is not drained on put.
        mailbox.inner.sink.set(Arc::clone(&listener));
        unsafe { mailbox.inner.write(0, 7) };
        mailbox.inner.tail.store(1, Ordering::Release);

        assert!(mailbox.is_ready_to_resume(&listener));
        assert_eq!(mailbox.try_get(), Some(7));
        assert!(!mailbox.is_ready_to_resume(&listener));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mailbox = Mailbox::new(8);
        for i in 0..5 {
            mailbox.try_put(i).unwrap();
        }

        mailbox.clear();
        let once = (mailbox.len(), mailbox.is_empty(), mailbox.has_space());
        mailbox.clear();
        let twice = (mailbox.len(), mailbox.is_empty(), mailbox.has_space());

        assert_eq!(once, (0, true, true));
        assert_eq!(once, twice);

        // Behaves like a fresh mailbox of the same capacity.
        for i in 0..8 {
            assert!(mailbox.try_put(i).is_ok());
        }
        assert!(mailbox.is_full());
        assert_eq!(mailbox.try_get(), Some(0));
    }

    #[test]
    fn test_drain_into_respects_max() {
        let mailbox = Mailbox::new(8);
        for i in 0..6 {
            mailbox.try_put(i).unwrap();
        }

        let mut buf = Vec::new();
        assert_eq!(mailbox.drain_into(&mut buf, 4), 4);
        assert_eq!(mailbox.drain_into(&mut buf, 4), 2);
        assert_eq!(mailbox.drain_into(&mut buf, 4), 0);
        assert_eq!(buf, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_drop_releases_buffered_messages() {
        let item = Arc::new(());
        let mailbox = Mailbox::new(4);

        for _ in 0..3 {
            mailbox.try_put(Arc::clone(&item)).unwrap();
        }
        assert_eq!(Arc::strong_count(&item), 4);

        drop(mailbox.try_get());
        drop(mailbox);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn test_concurrent_producers_panic() {
        let mailbox = Mailbox::new(4);

        // Simulate another producer in the middle of a put.
        let _other = mailbox.inner.producer();
        let res = catch_unwind(AssertUnwindSafe(|| mailbox.try_put(1)));
        assert!(res.is_err());

        // The consumer side is unaffected.
        assert!(mailbox.try_get().is_none());
    }

    #[test]
    fn test_fifo_across_threads() {
        const N: usize = 10_000;
        let mailbox = Mailbox::new(8);

        let producer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                for i in 0..N {
                    assert!(mailbox.put_blocking(i, None).is_ok());
                }
            })
        };

        let received = (0..N)
            .map(|_| mailbox.get_blocking(None))
            .collect::<Option<Vec<_>>>();

        producer.join().unwrap();
        assert_eq!(received, Some((0..N).collect()));
    }

    #[test]
    fn test_blocking_timeouts() {
        let mailbox = Mailbox::new(1);

        let start = Instant::now();
        assert_eq!(mailbox.get_blocking(Some(Duration::from_millis(20))), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(mailbox.inner.sink.is_empty());

        mailbox.try_put(1).unwrap();
        assert_eq!(
            mailbox.put_blocking(2, Some(Duration::from_millis(10))),
            Err(2)
        );
        assert!(mailbox.inner.source.is_empty());
    }

    #[spindle::test(worker_threads = 1)]
    async fn test_producer_pauses_when_full() -> Result<()> {
        let mailbox = Mailbox::new(4);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let (producer, polls) = CountPolls::new({
            let mailbox = mailbox.clone();
            async move {
                for i in 0..10 {
                    mailbox.put(i).await;
                }
            }
        });

        let consumer = {
            let seen = Arc::clone(&seen);
            async move {
                for _ in 0..10 {
                    let msg = mailbox.get().await;
                    seen.lock().push(msg);
                }
            }
        };

        let producer = spindle::spawn(producer);
        let consumer = spindle::spawn(consumer);
        producer.await?;
        consumer.await?;

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());

        // Capacity 4 < 10 messages: the producer paused at least twice.
        assert!(polls.load(Ordering::Relaxed) >= 3);
        Ok(())
    }

    #[spindle::test(worker_threads = 2)]
    async fn test_get_timeout_leaves_no_listener() -> Result<()> {
        let mailbox = Mailbox::<u32>::new(4);

        let start = Instant::now();
        let res = mailbox.get_timeout(Duration::from_millis(30)).await;
        assert_eq!(res, None);
        assert!(start.elapsed() >= Duration::from_millis(30));

        // Nothing left registered: a later put wakes nobody.
        assert!(mailbox.inner.sink.is_empty());
        mailbox.try_put(5).map_err(|_| anyhow::anyhow!("mailbox full"))?;
        assert!(mailbox.inner.sink.is_empty());
        assert_eq!(mailbox.try_get(), Some(5));
        Ok(())
    }

    #[spindle::test(worker_threads = 2)]
    async fn test_put_timeout_hands_message_back() -> Result<()> {
        let mailbox = Mailbox::new(1);
        mailbox.put(1).await;

        let res = mailbox.put_timeout(2, Duration::from_millis(20)).await;
        assert_eq!(res, Err(2));
        assert!(mailbox.inner.source.is_empty());
        assert_eq!(mailbox.len(), 1);
        Ok(())
    }

    #[spindle::test(worker_threads = 2)]
    async fn test_timed_get_races_late_put() -> Result<()> {
        let mailbox = Mailbox::new(4);

        let producer = {
            let mailbox = mailbox.clone();
            spindle::spawn(async move {
                sleep(Duration::from_millis(50))?.await?;
                mailbox.put(42).await;
                Ok::<_, crate::time::TimeError>(())
            })
        };

        let consumer = {
            let mailbox = mailbox.clone();
            spindle::spawn(async move { mailbox.get_timeout(Duration::from_millis(200)).await })
        };

        assert_eq!(consumer.await?, Some(42));
        producer.await??;
        Ok(())
    }

    #[spindle::test(worker_threads = 2)]
    async fn test_put_all_and_fill() -> Result<()> {
        let mailbox = Mailbox::new(4);

        let producer = {
            let mailbox = mailbox.clone();
            spindle::spawn(async move { mailbox.put_all(0..20).await })
        };

        let mut received = Vec::new();
        while received.len() < 20 {
            let max = 20 - received.len();
            let n = mailbox.fill(&mut received, max).await;
            assert!((1..=4).contains(&n));
        }

        producer.await?;
        assert_eq!(received, (0..20).collect::<Vec<_>>());
        assert_eq!(mailbox.fill(&mut received, 0).await, 0);
        Ok(())
    }

    #[spindle::test(worker_threads = 1)]
    async fn test_blocking_put_feeds_task() -> Result<()> {
        let mailbox = Mailbox::new(2);

        let producer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                (0..50).all(|i| mailbox.put_blocking(i, Some(Duration::from_secs(5))).is_ok())
            })
        };

        let mut received = Vec::new();
        for _ in 0..50 {
            received.push(mailbox.get().await);
        }

        assert!(producer.join().map_err(|_| anyhow::anyhow!("producer panicked"))?);
        assert_eq!(received, (0..50).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_display() {
        let mailbox = Mailbox::new(3);
        mailbox.try_put("a").unwrap();
        let shown = mailbox.to_string();
        assert!(shown.starts_with("Mailbox(id="));
        assert!(shown.ends_with("len=1, capacity=4)"));
    }
}
