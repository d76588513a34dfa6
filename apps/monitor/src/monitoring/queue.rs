//! The shared check queue: a min-heap of scheduled items keyed on their next
//! eligible run time. The key never depends on the current clock, so the heap
//! stays structurally valid while it sits idle.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::config::{Check, CheckType, Member, Service};

/// One scheduled (check, member, target) tuple.
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub check_type: CheckType,
    pub check: Check,
    pub member: Member,
    pub service: Option<Service>,
    pub domain: String,
    pub endpoint: String,
    /// `None` until the first run; such items are due immediately.
    pub last_executed: Option<DateTime<Utc>>,
    pub minimum_interval: Duration,
    /// Epoch of the config snapshot that produced this item.
    pub generation: u64,
}

impl CheckItem {
    /// The earliest instant this item may run again. This is the heap's
    /// ordering key.
    pub fn next_run(&self) -> DateTime<Utc> {
        match self.last_executed {
            Some(last) => last + self.minimum_interval,
            None => DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Identity under hot reload. Items whose identity survives a reload
    /// keep their `last_executed` stamp; editing a member's IP deliberately
    /// produces a fresh identity.
    pub fn identity(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.check_type,
            self.check.name,
            self.member.details.name,
            self.domain,
            self.endpoint,
            self.member.service.service_ipv4,
            self.member.service.service_ipv6
        )
    }
}

struct Entry(CheckItem);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.next_run() == other.0.next_run()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.next_run().cmp(&other.0.next_run())
    }
}

/// Thread-safe priority queue of outstanding checks, earliest next-run first.
#[derive(Default)]
pub struct CheckQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
}

impl CheckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, item: CheckItem) {
        self.heap.lock().await.push(Reverse(Entry(item)));
    }

    /// Pop the earliest due item, discarding stale generations at the root.
    /// Returns `None` when the earliest current item is not yet due, which
    /// by the ordering invariant means nothing is.
    pub async fn get_next(&self, current_generation: u64) -> Option<CheckItem> {
        let mut heap = self.heap.lock().await;
        let now = Utc::now();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.0.generation != current_generation {
                heap.pop();
                continue;
            }
            if now < entry.0.next_run() {
                return None;
            }
            return heap.pop().map(|Reverse(entry)| entry.0);
        }
        None
    }

    pub async fn clear(&self) {
        *self.heap.lock().await = BinaryHeap::new();
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemberDetails;

    fn item(name: &str, last_run_secs_ago: i64, interval_secs: i64, generation: u64) -> CheckItem {
        let mut check = Check::default();
        check.name = name.to_string();
        let mut member = Member::default();
        member.details = MemberDetails { name: "m1".to_string() };
        CheckItem {
            check_type: CheckType::Site,
            check,
            member,
            service: None,
            domain: String::new(),
            endpoint: String::new(),
            last_executed: Some(Utc::now() - Duration::seconds(last_run_secs_ago)),
            minimum_interval: Duration::seconds(interval_secs),
            generation,
        }
    }

    #[tokio::test]
    async fn pops_in_next_run_order() {
        let queue = CheckQueue::new();
        queue.add(item("third", 10, 9, 1)).await;
        queue.add(item("first", 30, 5, 1)).await;
        queue.add(item("second", 20, 10, 1)).await;

        let mut previous = DateTime::<Utc>::UNIX_EPOCH;
        let mut order = Vec::new();
        while let Some(popped) = queue.get_next(1).await {
            assert!(popped.next_run() >= previous);
            previous = popped.next_run();
            order.push(popped.check.name.clone());
        }
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn items_not_yet_due_are_held_back() {
        let queue = CheckQueue::new();
        queue.add(item("future", 0, 3600, 1)).await;

        assert!(queue.get_next(1).await.is_none());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn never_run_items_are_due_immediately() {
        let queue = CheckQueue::new();
        let mut fresh = item("fresh", 0, 3600, 1);
        fresh.last_executed = None;
        queue.add(fresh).await;

        let popped = queue.get_next(1).await.unwrap();
        assert_eq!(popped.check.name, "fresh");
    }

    #[tokio::test]
    async fn stale_generations_are_discarded_not_executed() {
        let queue = CheckQueue::new();
        queue.add(item("old-a", 100, 1, 1)).await;
        queue.add(item("old-b", 100, 1, 1)).await;
        queue.add(item("current", 100, 1, 2)).await;

        let popped = queue.get_next(2).await.unwrap();
        assert_eq!(popped.check.name, "current");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn clear_empties_the_queue() {
        let queue = CheckQueue::new();
        queue.add(item("a", 100, 1, 1)).await;
        queue.add(item("b", 100, 1, 1)).await;
        assert_eq!(queue.len().await, 2);

        queue.clear().await;
        assert!(queue.is_empty().await);
        assert!(queue.get_next(1).await.is_none());
    }

    #[test]
    fn identity_tracks_member_addresses() {
        let mut a = item("ping", 0, 60, 1);
        a.member.service.service_ipv4 = "192.0.2.10".to_string();
        let mut b = a.clone();
        assert_eq!(a.identity(), b.identity());

        b.member.service.service_ipv4 = "192.0.2.99".to_string();
        assert_ne!(a.identity(), b.identity());
    }
}
