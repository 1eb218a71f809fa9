//! Integration tests for ordering, batch formation and the starvation guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use kv_cache_sched::config::SchedulerConfig;
use kv_cache_sched::scheduler::batch::{step_cost, Scheduler, StepCost};
use kv_cache_sched::scheduler::queue::QueuedRequest;
use kv_cache_sched::sequence::{Priority, Request, RequestId};

fn prefill(entry: &QueuedRequest) -> StepCost {
    step_cost(entry, 16, 16, 0)
}

#[test]
fn test_fifo_within_tier_under_concurrent_admission() {
    for trial in 0..20u64 {
        let sched = Arc::new(Mutex::new(Scheduler::new(&SchedulerConfig {
            max_batch_size: 1000,
            ..SchedulerConfig::default()
        })));

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let sched = Arc::clone(&sched);
                thread::spawn(move || {
                    let mut arrivals = Vec::new();
                    for i in 0..25u64 {
                        // Ids deliberately unrelated to arrival order.
                        let id = RequestId(((i * 7 + t * 13 + trial) % 100) * 1000 + t * 100 + i);
                        let tier = if (i + t) % 2 == 0 { Priority::Normal } else { Priority::Low };
                        let arrival = sched
                            .lock()
                            .unwrap()
                            .enqueue(id, Request::generate(4, 0).with_priority(tier))
                            .unwrap();
                        arrivals.push((id, tier, arrival));
                        if i % 5 == 0 {
                            thread::yield_now();
                        }
                    }
                    arrivals
                })
            })
            .collect();

        let mut arrival_of = HashMap::new();
        for handle in handles {
            for (id, tier, arrival) in handle.join().unwrap() {
                arrival_of.insert(id, (tier, arrival));
            }
        }

        let mut sched = sched.lock().unwrap();
        let batch = sched.form_batch(usize::MAX, usize::MAX, prefill).batch;
        assert_eq!(batch.len(), 100);

        let mut last: HashMap<Priority, u64> = HashMap::new();
        let mut seen_low = false;
        for id in batch.sequence_ids() {
            let (tier, arrival) = arrival_of[&id];
            if tier == Priority::Low {
                seen_low = true;
            } else {
                assert!(!seen_low, "normal request batched after a low one");
            }
            if let Some(prev) = last.insert(tier, arrival) {
                assert!(prev < arrival, "tier {tier} out of arrival order");
            }
        }
    }
}

#[test]
fn test_low_then_high_with_room_for_both() {
    let mut sched = Scheduler::new(&SchedulerConfig::default());
    let low = RequestId(1);
    let high = RequestId(2);
    sched
        .enqueue(low, Request::generate(64, 0).with_priority(Priority::Low))
        .unwrap();
    sched
        .enqueue(high, Request::generate(64, 0).with_priority(Priority::High))
        .unwrap();

    let out = sched.form_batch(128, 100, prefill);
    assert_eq!(out.batch.sequence_ids(), vec![high, low]);
}

#[test]
fn test_low_then_high_with_room_for_one() {
    let mut sched = Scheduler::new(&SchedulerConfig::default());
    let low = RequestId(1);
    let high = RequestId(2);
    sched
        .enqueue(low, Request::generate(64, 0).with_priority(Priority::Low))
        .unwrap();
    sched
        .enqueue(high, Request::generate(64, 0).with_priority(Priority::High))
        .unwrap();

    let first = sched.form_batch(100, 100, prefill);
    assert_eq!(first.batch.sequence_ids(), vec![high]);
    assert_eq!(first.deferred, vec![low]);
    assert!(sched.contains(low));

    let second = sched.form_batch(100, 100, prefill);
    assert_eq!(second.batch.sequence_ids(), vec![low]);
}

fn rounds_until_low_batched(rounds: u32) -> Option<u32> {
    let mut sched = Scheduler::new(&SchedulerConfig {
        max_batch_size: 2,
        starvation_rounds: rounds,
        deferral_boost_after: 1000,
        ..SchedulerConfig::default()
    });
    let low = RequestId(0);
    sched
        .enqueue(low, Request::generate(16, 0).with_priority(Priority::Low))
        .unwrap();

    let mut next = 1;
    for round in 1..=rounds * 2 {
        // Continuous high-priority pressure: more critical work than fits.
        for _ in 0..3 {
            sched
                .enqueue(
                    RequestId(next),
                    Request::generate(16, 0).with_priority(Priority::Critical),
                )
                .unwrap();
            next += 1;
        }
        let out = sched.form_batch(10_000, 10_000, prefill);
        if out.batch.sequence_ids().contains(&low) {
            return Some(round);
        }
    }
    None
}

#[test]
fn test_starvation_guard_bounds_wait() {
    for rounds in [1, 2, 4, 8, 16] {
        let served = rounds_until_low_batched(rounds).expect("low request starved");
        assert!(served <= rounds, "R = {rounds}, served in round {served}");
    }
}

/// Round in which each of High, Normal and Low was first batched, under more
/// critical work per round than fits in a batch of one.
fn rounds_until_each_lower_tier_batched(rounds: u32) -> HashMap<Priority, u32> {
    let mut sched = Scheduler::new(&SchedulerConfig {
        max_batch_size: 1,
        starvation_rounds: rounds,
        deferral_boost_after: 1000,
        ..SchedulerConfig::default()
    });
    let waiting = [Priority::High, Priority::Normal, Priority::Low];
    for (i, tier) in waiting.iter().enumerate() {
        sched
            .enqueue(RequestId(i as u64), Request::generate(16, 0).with_priority(*tier))
            .unwrap();
    }

    let mut served = HashMap::new();
    let mut next = 100;
    for round in 1..=rounds * 3 {
        for _ in 0..3 {
            sched
                .enqueue(
                    RequestId(next),
                    Request::generate(16, 0).with_priority(Priority::Critical),
                )
                .unwrap();
            next += 1;
        }
        let out = sched.form_batch(10_000, 10_000, prefill);
        for id in out.batch.sequence_ids() {
            if id.0 < 3 {
                served.entry(waiting[id.0 as usize]).or_insert(round);
            }
        }
    }
    served
}

#[test]
fn test_starvation_guard_bounds_wait_for_every_starving_tier() {
    for rounds in [1, 2, 3, 5, 8] {
        let served = rounds_until_each_lower_tier_batched(rounds);
        for tier in [Priority::High, Priority::Normal, Priority::Low] {
            let round = served.get(&tier).copied().unwrap_or_else(|| panic!("{tier} starved at R = {rounds}"));
            assert!(round <= rounds, "R = {rounds}: {tier} served in round {round}");
        }
    }
}

#[test]
fn test_formation_is_deterministic() {
    let build = || {
        let mut sched = Scheduler::new(&SchedulerConfig {
            max_batch_size: 5,
            ..SchedulerConfig::default()
        });
        for i in 0..40u64 {
            let tier = Priority::from_level((i * 7 % 4) as u8);
            sched
                .enqueue(RequestId(i), Request::generate(8 + (i as usize * 13) % 90, 0).with_priority(tier))
                .unwrap();
        }
        sched
    };

    let mut a = build();
    let mut b = build();
    for _ in 0..12 {
        let x = a.form_batch(160, 20, prefill);
        let y = b.form_batch(160, 20, prefill);
        assert_eq!(x.batch.sequence_ids(), y.batch.sequence_ids());
        assert_eq!(x.deferred, y.deferred);
    }
}

#[test]
fn test_cancelled_request_never_batched() {
    let mut sched = Scheduler::new(&SchedulerConfig::default());
    for i in 0..5 {
        sched.enqueue(RequestId(i), Request::generate(8, 0)).unwrap();
    }
    assert!(sched.cancel(RequestId(2)).is_some());
    assert!(sched.cancel(RequestId(2)).is_none());

    let out = sched.form_batch(1000, 1000, prefill);
    assert_eq!(
        out.batch.sequence_ids(),
        vec![RequestId(0), RequestId(1), RequestId(3), RequestId(4)]
    );
}
