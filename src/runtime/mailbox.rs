//! Thread-safe FIFO of tagged items.
//!
//! The only structure shared between the network thread and worker threads.
//! Producers never block; consumers can poll, wait with a timeout, or wait
//! indefinitely.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One-shot completion signal carried alongside a mailbox item.
///
/// Clones share the same state: the consumer calls [`complete`] and the
/// producer can wait on its own clone.
///
/// [`complete`]: Completion::complete
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let (done, cvar) = &*self.inner;
        *done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until completed or `timeout` elapses. Returns whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, cvar) = &*self.inner;
        let guard = done.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// A queued item: operator tag, payload and optional completion handle.
#[derive(Debug, Clone)]
pub struct MailboxItem<T> {
    pub tag: u32,
    pub payload: T,
    pub completion: Option<Completion>,
}

impl<T> MailboxItem<T> {
    pub fn new(tag: u32, payload: T) -> Self {
        Self {
            tag,
            payload,
            completion: None,
        }
    }

    pub fn with_completion(tag: u32, payload: T, completion: Completion) -> Self {
        Self {
            tag,
            payload,
            completion: Some(completion),
        }
    }
}

/// Concurrent FIFO. Ordering is strict per instance, with no priorities.
#[derive(Debug)]
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<MailboxItem<T>>>,
    available: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Shared mailbox for handing to worker threads.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // A panicking holder cannot leave the deque half-modified, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<MailboxItem<T>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: MailboxItem<T>) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Append a tagged payload without a completion handle.
    pub fn push_tagged(&self, tag: u32, payload: T) {
        self.push(MailboxItem::new(tag, payload));
    }

    /// Append all items under one lock and wake every waiting consumer.
    pub fn push_batch(&self, items: impl IntoIterator<Item = MailboxItem<T>>) {
        let items: Vec<MailboxItem<T>> = items.into_iter().collect();
        self.lock().extend(items);
        self.available.notify_all();
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<MailboxItem<T>> {
        self.lock().pop_front()
    }

    /// Block until an item arrives or `timeout` elapses.
    ///
    /// A timeout too large to represent as a deadline waits indefinitely.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<MailboxItem<T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            let queue = self.lock();
            let mut queue = self
                .available
                .wait_while(queue, |q| q.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
            return queue.pop_front();
        };

        let mut queue = self.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(queue, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    /// Drain up to `max_count` items currently present, without blocking.
    pub fn pop_batch(&self, max_count: usize) -> Vec<MailboxItem<T>> {
        let mut queue = self.lock();
        let n = max_count.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Block until at least one item is present.
    pub fn wait_until_nonempty(&self) {
        let queue = self.lock();
        let _guard = self
            .available
            .wait_while(queue, |q| q.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            mailbox.push_tagged(i, i * 10);
        }
        assert_eq!(mailbox.size(), 5);
        let popped: Vec<u32> = std::iter::from_fn(|| mailbox.pop().map(|i| i.payload)).collect();
        assert_eq!(popped, vec![0, 10, 20, 30, 40]);
        assert!(mailbox.is_empty());
        assert!(mailbox.pop().is_none());
    }

    #[test]
    fn test_pop_blocking_times_out() {
        let mailbox: Mailbox<u8> = Mailbox::new();
        let start = Instant::now();
        assert!(mailbox.pop_blocking(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_blocking_unbounded_timeout() {
        let mailbox = Mailbox::new();
        mailbox.push_tagged(1, 42u8);
        let item = mailbox.pop_blocking(Duration::MAX).unwrap();
        assert_eq!(item.payload, 42);

        let mailbox = Mailbox::shared();
        let producer = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push_tagged(2, 7u8);
        });
        assert_eq!(mailbox.pop_blocking(Duration::MAX).unwrap().payload, 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_push_batch_from_iterator_reading_mailbox() {
        let mailbox = Mailbox::new();
        mailbox.push_tagged(0, 0usize);
        // The iterator inspects the same mailbox while it is consumed.
        mailbox.push_batch((1..4).map(|i| MailboxItem::new(1, i + mailbox.size())));
        let payloads: Vec<usize> = mailbox.pop_batch(10).into_iter().map(|i| i.payload).collect();
        assert_eq!(payloads, vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_pop_blocking_across_threads() {
        let mailbox = Mailbox::shared();
        let producer = Arc::clone(&mailbox);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push_tagged(7, "hello");
        });

        let item = mailbox.pop_blocking(Duration::from_secs(5)).unwrap();
        assert_eq!(item.tag, 7);
        assert_eq!(item.payload, "hello");
        handle.join().unwrap();
    }

    #[test]
    fn test_pop_batch_bounds() {
        let mailbox = Mailbox::new();
        mailbox.push_batch((0..10).map(|i| MailboxItem::new(1, i)));

        let first = mailbox.pop_batch(4);
        assert_eq!(first.iter().map(|i| i.payload).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let rest = mailbox.pop_batch(100);
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].payload, 4);
        assert!(mailbox.pop_batch(3).is_empty());
    }

    #[test]
    fn test_clear() {
        let mailbox = Mailbox::new();
        mailbox.push_tagged(1, ());
        mailbox.push_tagged(2, ());
        mailbox.clear();
        assert_eq!(mailbox.size(), 0);
    }

    #[test]
    fn test_wait_until_nonempty() {
        let mailbox = Mailbox::shared();
        let producer = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push_batch(vec![MailboxItem::new(3, 1u8), MailboxItem::new(3, 2u8)]);
        });

        mailbox.wait_until_nonempty();
        assert_eq!(mailbox.size(), 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let mailbox = Mailbox::shared();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || {
                    for i in 0..250u32 {
                        mailbox.push_tagged(p, i);
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < 1000 {
            if mailbox.pop_blocking(Duration::from_secs(5)).is_some() {
                received += 1;
                received += mailbox.pop_batch(16).len();
            } else {
                break;
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(received, 1000);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_completion_signal() {
        let completion = Completion::new();
        let mailbox = Mailbox::shared();
        mailbox.push(MailboxItem::with_completion(1, 5u8, completion.clone()));

        let consumer = Arc::clone(&mailbox);
        let handle = thread::spawn(move || {
            let item = consumer.pop_blocking(Duration::from_secs(5)).unwrap();
            if let Some(done) = item.completion {
                done.complete();
            }
        });

        assert!(completion.wait_timeout(Duration::from_secs(5)));
        assert!(completion.is_complete());
        handle.join().unwrap();
    }
}
