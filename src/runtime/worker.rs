//! Out-of-band mailbox consumers.
//!
//! Each worker waits on the shared mailbox, drains it in batches and
//! signals any completion handle. Workers never touch the registry.

use crate::protocol::Frame;
use crate::runtime::{Mailbox, MailboxItem};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Per-worker tally of consumed items, by tag.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    pub consumed: u64,
    pub by_tag: HashMap<u32, u64>,
}

impl WorkerStats {
    fn record(&mut self, item: &MailboxItem<Frame>) {
        self.consumed += 1;
        *self.by_tag.entry(item.tag).or_default() += 1;
    }
}

/// Running worker threads.
pub struct MailboxWorkers {
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl MailboxWorkers {
    /// Spawn `count` workers. They exit once `shutdown` is set.
    pub fn spawn(
        count: usize,
        mailbox: &Arc<Mailbox<Frame>>,
        batch_size: usize,
        pop_timeout: Duration,
        shutdown: &Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(count);

        for worker_id in 0..count {
            let mailbox = Arc::clone(mailbox);
            let shutdown = Arc::clone(shutdown);

            let handle = thread::Builder::new()
                .name(format!("mailbox-{worker_id}"))
                .spawn(move || {
                    worker_loop(worker_id, &mailbox, batch_size, pop_timeout, &shutdown)
                })?;

            handles.push(handle);
        }

        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit and merge their stats.
    pub fn join(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for handle in self.handles {
            match handle.join() {
                Ok(stats) => {
                    total.consumed += stats.consumed;
                    for (tag, n) in stats.by_tag {
                        *total.by_tag.entry(tag).or_default() += n;
                    }
                }
                Err(_) => error!("Mailbox worker panicked"),
            }
        }
        total
    }
}

fn worker_loop(
    worker_id: usize,
    mailbox: &Mailbox<Frame>,
    batch_size: usize,
    pop_timeout: Duration,
    shutdown: &AtomicBool,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    debug!(worker = worker_id, "Mailbox worker started");

    while !shutdown.load(Ordering::Acquire) {
        let Some(first) = mailbox.pop_blocking(pop_timeout) else {
            continue;
        };

        let rest = mailbox.pop_batch(batch_size.saturating_sub(1));
        for item in std::iter::once(first).chain(rest) {
            trace!(
                worker = worker_id,
                tag = item.tag,
                payload_len = item.payload.payload().len(),
                "Mailbox item consumed"
            );
            stats.record(&item);
            if let Some(completion) = &item.completion {
                completion.complete();
            }
        }
    }

    debug!(worker = worker_id, consumed = stats.consumed, "Mailbox worker stopped");
    stats
}
