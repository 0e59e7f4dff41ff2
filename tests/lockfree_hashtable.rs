//! Concurrent behavior of the dependency checker and its lock-free table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use ringrep::core::{Admission, DependencyChecker};

const LANES: u32 = 4;
const PER_LANE: u32 = 64;

fn live_key_count(checker: &DependencyChecker) -> usize {
    (0..checker.table().buckets())
        .map(|b| checker.table().live_keys(b).len())
        .sum()
}

#[test]
fn test_disjoint_keys_from_many_threads_all_insert() {
    let checker = Arc::new(DependencyChecker::new(16, LANES, PER_LANE));
    let handles: Vec<_> = (0..LANES)
        .map(|lane| {
            let checker = Arc::clone(&checker);
            thread::spawn(move || {
                (0..PER_LANE)
                    .map(|slot| {
                        let node = checker.node_for(lane, slot);
                        checker.try_insert(node, lane * 1000 + slot + 1)
                    })
                    .filter(|a| *a == Admission::Inserted)
                    .count()
            })
        })
        .collect();

    let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(inserted, (LANES * PER_LANE) as usize);
    assert_eq!(live_key_count(&checker), (LANES * PER_LANE) as usize);

    for bucket in 0..checker.table().buckets() {
        let keys = checker.table().live_keys(bucket);
        assert!(
            keys.windows(2).all(|w| w[0] < w[1]),
            "bucket {bucket} out of order: {keys:?}"
        );
    }
}

#[test]
fn test_racing_proposals_for_one_key_leave_one_survivor() {
    let checker = Arc::new(DependencyChecker::new(8, LANES, 1));
    let key_hash = DependencyChecker::hash(b"hot-account");
    let handles: Vec<_> = (0..LANES)
        .map(|lane| {
            let checker = Arc::clone(&checker);
            thread::spawn(move || checker.try_insert(checker.node_for(lane, 0), key_hash))
        })
        .collect();
    let admissions: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(admissions.contains(&Admission::Inserted));
    let survivors = (0..LANES)
        .filter(|&lane| !checker.is_superseded(checker.node_for(lane, 0)))
        .count();
    assert_eq!(survivors, 1);

    let bucket = checker.table().bucket_of(key_hash);
    assert_eq!(checker.table().live_keys(bucket), vec![key_hash]);
}

#[test]
fn test_second_proposal_supersedes_first() {
    let checker = DependencyChecker::new(32, 2, 8);
    let key_hash = DependencyChecker::hash(b"k");
    let first = checker.node_for(0, 0);
    let second = checker.node_for(1, 5);

    assert_eq!(checker.try_insert(first, key_hash), Admission::Inserted);
    assert_eq!(checker.try_insert(second, key_hash), Admission::Switched);
    assert!(checker.is_superseded(first));
    assert!(!checker.is_superseded(second));

    checker.delete(second);
    assert!(checker.is_superseded(second));
    assert_eq!(checker.try_insert(checker.node_for(0, 1), key_hash), Admission::Inserted);
}

#[test]
fn test_release_while_other_lane_inserts() {
    let checker = Arc::new(DependencyChecker::new(4, 2, PER_LANE));
    for slot in 0..PER_LANE {
        checker.try_insert(checker.node_for(0, slot), slot * 7 + 1);
    }

    let writer = {
        let checker = Arc::clone(&checker);
        thread::spawn(move || {
            for slot in 0..PER_LANE {
                checker.try_insert(checker.node_for(1, slot), 100_000 + slot);
            }
        })
    };
    let lane: Vec<_> = (0..PER_LANE).map(|s| checker.node_for(0, s)).collect();
    checker.release(&lane);
    writer.join().unwrap();

    for bucket in 0..checker.table().buckets() {
        let reachable = checker.table().reachable(bucket);
        assert!(lane.iter().all(|n| !reachable.contains(n)));
    }
    assert_eq!(live_key_count(&checker), PER_LANE as usize);

    // Released nodes take new keys straight away.
    assert_eq!(checker.try_insert(lane[0], 1), Admission::Inserted);
}

#[test]
fn test_recycled_nodes_stay_in_their_own_bucket() {
    const ROUNDS: u32 = 2_000;
    // Two buckets: keys 2 and 4 share bucket 0, key 3 sits in bucket 1.
    let checker = Arc::new(DependencyChecker::new(2, 2, 2));
    let misplaced = Arc::new(AtomicU32::new(0));

    let recycler = {
        let checker = Arc::clone(&checker);
        let misplaced = Arc::clone(&misplaced);
        thread::spawn(move || {
            let lane = [checker.node_for(0, 0), checker.node_for(0, 1)];
            for _ in 0..ROUNDS {
                checker.try_insert(lane[0], 2);
                checker.try_insert(lane[1], 3);
                if !lane.iter().all(|&n| checker.is_linked(n)) {
                    misplaced.fetch_add(1, Ordering::Relaxed);
                }
                checker.release(&lane);
            }
        })
    };
    let searcher = {
        let checker = Arc::clone(&checker);
        let misplaced = Arc::clone(&misplaced);
        thread::spawn(move || {
            let node = checker.node_for(1, 0);
            for _ in 0..ROUNDS {
                assert_eq!(checker.try_insert(node, 4), Admission::Inserted);
                if !checker.is_linked(node) {
                    misplaced.fetch_add(1, Ordering::Relaxed);
                }
                checker.release(&[node]);
            }
        })
    };

    recycler.join().unwrap();
    searcher.join().unwrap();
    assert_eq!(misplaced.load(Ordering::Relaxed), 0);

    for bucket in 0..checker.table().buckets() {
        assert!(checker.table().live_keys(bucket).is_empty());
    }
    assert_eq!(checker.try_insert(checker.node_for(1, 1), 4), Admission::Inserted);
    assert!(checker.is_linked(checker.node_for(1, 1)));
}
