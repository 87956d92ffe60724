#![forbid(unsafe_code)]

use std::collections::HashSet;

use subsync_core::QueueElement;
use subsync_store::{EventWindow, SubaccountPriorityQueue};

// Small deterministic generator so the interleavings are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn el(id: u64, at: i64) -> QueueElement {
    QueueElement { subaccount_id: format!("sa{id}").into(), beta_enabled: "true".into(), modified_at: at }
}

#[test]
fn size_bounded_by_distinct_ids_and_extracts_are_ordered() {
    for seed in 1..20u64 {
        let mut rng = Lcg(seed);
        let q = SubaccountPriorityQueue::with_capacity(4);
        let mut ids = HashSet::new();
        for _ in 0..400 {
            if rng.next() % 4 == 0 {
                if let Some(e) = q.extract() {
                    ids.remove(&e.subaccount_id);
                }
            } else {
                let id = rng.next() % 25;
                let at = (rng.next() % 1000) as i64;
                q.insert(el(id, at));
                ids.insert(el(id, at).subaccount_id);
            }
            assert!(q.len() <= ids.len());
        }
        let mut prev = i64::MIN;
        while let Some(e) = q.extract() {
            assert!(e.modified_at >= prev, "seed {seed}: {} < {prev}", e.modified_at);
            prev = e.modified_at;
        }
    }
}

#[test]
fn stored_value_keeps_the_newest_modification() {
    let q = SubaccountPriorityQueue::new();
    let mut rng = Lcg(7);
    let mut newest = i64::MIN;
    for _ in 0..100 {
        let at = (rng.next() % 500) as i64;
        newest = newest.max(at);
        q.insert(el(1, at));
        assert_eq!(q.len(), 1);
    }
    assert_eq!(q.extract().map(|e| e.modified_at), Some(newest));
}

#[test]
fn restart_recovers_overlap_from_last_event() {
    let now = 10_000_000;
    let size = std::time::Duration::from_secs(60);
    let mut before = EventWindow::new(size, Box::new(move || now));
    for t in [9_000_000, 9_990_000, 9_950_000] {
        before.update_to_time(t);
    }
    let last_processed = before.last_to();

    let mut after = EventWindow::new(size, Box::new(move || now + 3_600_000));
    after.update_to_time(last_processed);
    assert!(after.next_from_time() <= last_processed);
}
