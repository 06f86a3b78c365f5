// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! The pending-reply table (C2): a process-shared keyed map from request
//! id to completed reply, with blocking `take` semantics. See spec.md 4.2.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::errors::ReplyTableError;
use crate::common::ReqId;

enum Slot<R> {
    /// Nobody has produced a reply yet; whoever is waiting registered this
    /// `Notify` so `put` can wake them without polling.
    Empty(Arc<Notify>),
    Filled(R),
}

/// Maps `reqId -> reply`, per spec.md 4.2's invariants: at most one entry
/// per id at a time, inserted exactly once by the aggregator that produced
/// it, removed exactly once by the sink that consumes it (or by `sweep`
/// once `replyTTL` has elapsed with nobody claiming it).
pub struct PendingReplyTable<R> {
    slots: DashMap<ReqId, (Slot<R>, std::time::Instant)>,
}

impl<R> PendingReplyTable<R> {
    pub fn new() -> Self { PendingReplyTable { slots: DashMap::new() } }

    /// Atomically inserts a reply for `req_id`. If a `take` call is
    /// already waiting on this id, wakes it; otherwise the reply sits in
    /// the table until `take` or `sweep` claims it.
    ///
    /// Fails with `DuplicateReply` only if a reply (not a waiter) is
    /// already present -- a waiting `take` is not a duplicate, it's the
    /// normal case.
    pub fn put(&self, req_id: ReqId, value: R) -> Result<(), ReplyTableError> {
        use dashmap::mapref::entry::Entry;

        match self.slots.entry(req_id) {
            Entry::Occupied(mut occ) => match &occ.get().0 {
                Slot::Filled(_) => Err(ReplyTableError::DuplicateReply(req_id)),
                Slot::Empty(notify) => {
                    let notify = notify.clone();
                    occ.insert((Slot::Filled(value), std::time::Instant::now()));
                    notify.notify_waiters();
                    Ok(())
                },
            },
            Entry::Vacant(vac) => {
                vac.insert((Slot::Filled(value), std::time::Instant::now()));
                Ok(())
            },
        }
    }

    /// Waits up to `deadline` for a reply to `req_id`, removing and
    /// returning it once available. Must wake promptly (spec.md 4.2) when
    /// a matching `put` lands -- the `Notify` registered in the `Empty`
    /// branch below is what makes that happen without spinning.
    pub async fn take(&self, req_id: ReqId, deadline: Duration) -> Result<R, ReplyTableError> {
        let start = std::time::Instant::now();
        loop {
            let notify = {
                use dashmap::mapref::entry::Entry;
                match self.slots.entry(req_id) {
                    Entry::Occupied(occ) => match &occ.get().0 {
                        Slot::Filled(_) => {
                            let (_, (slot, _)) = occ.remove_entry();
                            return match slot {
                                Slot::Filled(value) => Ok(value),
                                Slot::Empty(_) => unreachable!("checked Filled above"),
                            };
                        },
                        Slot::Empty(notify) => notify.clone(),
                    },
                    Entry::Vacant(vac) => {
                        let notify = Arc::new(Notify::new());
                        vac.insert((Slot::Empty(notify.clone()), std::time::Instant::now()));
                        notify
                    },
                }
            };

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return self.take_filled_or_timeout(req_id);
            }
            let remaining = deadline - elapsed;

            if tokio::time::timeout(remaining, notify.notified()).await.is_err() {
                // `notify_waiters()` stores no permit: a `put` landing
                // between this task dropping the entry guard above and its
                // first poll of `notified()` wakes nobody, and we'd
                // otherwise report `Timeout` despite the reply sitting
                // right there. Re-check the slot directly before giving up.
                return self.take_filled_or_timeout(req_id);
            }
            // Woken up (or spuriously) -- loop back around and check the slot again.
        }
    }

    /// Takes a reply that's already `Filled` for `req_id`, or removes a
    /// still-`Empty` slot and reports `Timeout`. Called once a `take`'s
    /// deadline has been reached or its wait on `notify` has elapsed.
    fn take_filled_or_timeout(&self, req_id: ReqId) -> Result<R, ReplyTableError> {
        use dashmap::mapref::entry::Entry;

        match self.slots.entry(req_id) {
            Entry::Occupied(occ) => match &occ.get().0 {
                Slot::Filled(_) => {
                    let (_, (slot, _)) = occ.remove_entry();
                    match slot {
                        Slot::Filled(value) => Ok(value),
                        Slot::Empty(_) => unreachable!("checked Filled above"),
                    }
                },
                Slot::Empty(_) => {
                    occ.remove();
                    Err(ReplyTableError::Timeout(req_id))
                },
            },
            Entry::Vacant(_) => Err(ReplyTableError::Timeout(req_id)),
        }
    }

    /// Removes entries inserted before `older_than` that were never
    /// claimed, preventing unbounded growth when a client disappears
    /// (spec.md 3).
    pub fn sweep(&self, older_than: std::time::Instant) {
        self.slots.retain(|_, (slot, inserted_at)| match slot {
            Slot::Filled(_) => *inserted_at >= older_than,
            Slot::Empty(_) => true,
        });
    }

    pub fn len(&self) -> usize { self.slots.len() }

    pub fn is_empty(&self) -> bool { self.slots.is_empty() }
}

impl<R> Default for PendingReplyTable<R> {
    fn default() -> Self { Self::new() }
}

/// Runs `sweep` on an interval, bounding the table's growth per spec.md
/// 3's garbage-collection contract. A `None` ttl disables sweeping
/// entirely (the default, per spec.md 9's open question about `replyTTL`).
pub async fn run_sweeper<R: Send + Sync + 'static>(
    table: Arc<PendingReplyTable<R>>, ttl: Option<Duration>, mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let Some(ttl) = ttl else {
        // No TTL configured: just wait for shutdown, we never sweep.
        let _ = shutdown.changed().await;
        return;
    };

    let mut interval = tokio::time::interval(ttl / 2);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let older_than = std::time::Instant::now() - ttl;
                table.sweep(older_than);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_take_returns_value() {
        let table = PendingReplyTable::new();
        let id = ReqId(1);
        table.put(id, "hello").unwrap();
        let value = table.take(id, Duration::from_millis(50)).await.unwrap();
        assert_eq!(value, "hello");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn take_wakes_promptly_on_put() {
        let table = Arc::new(PendingReplyTable::new());
        let id = ReqId(2);

        let table2 = table.clone();
        let waiter = tokio::spawn(async move { table2.take(id, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        table.put(id, 42).unwrap();

        let got = tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .expect("take should finish promptly")
            .unwrap()
            .unwrap();
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn take_times_out_with_no_reply() {
        let table: PendingReplyTable<i32> = PendingReplyTable::new();
        let id = ReqId(3);
        let err = table.take(id, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ReplyTableError::Timeout(_)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn take_recovers_a_reply_lost_to_the_notify_registration_race() {
        // Stands in for the window between `take` dropping the entry guard
        // and its first poll of `notify.notified()`: a `put` that lands
        // there calls `notify_waiters()` with nobody registered yet, so the
        // wakeup is lost and the wait would otherwise run out the clock.
        // `take_filled_or_timeout` must still find the real reply rather
        // than reporting `Timeout`.
        let table: PendingReplyTable<i32> = PendingReplyTable::new();
        let id = ReqId(99);
        table.slots.insert(id, (Slot::Empty(Arc::new(Notify::new())), std::time::Instant::now()));
        table.put(id, 123).unwrap();

        let value = table.take_filled_or_timeout(id).unwrap();
        assert_eq!(value, 123);
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let table = PendingReplyTable::new();
        let id = ReqId(4);
        table.put(id, 1).unwrap();
        let err = table.put(id, 2).unwrap_err();
        assert!(matches!(err, ReplyTableError::DuplicateReply(_)));
    }

    #[test]
    fn sweep_removes_only_stale_filled_entries() {
        let table = PendingReplyTable::new();
        table.put(ReqId(5), "stale").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let cutoff = std::time::Instant::now();
        table.put(ReqId(6), "fresh").unwrap();

        table.sweep(cutoff);
        assert_eq!(table.len(), 1);
    }
}
