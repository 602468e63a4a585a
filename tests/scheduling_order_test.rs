//! Integration tests for task selection order.
//!
//! Validates:
//! 1. Highest effective priority wins among eligible tasks
//! 2. Equal priorities dequeue FIFO
//! 3. Aging lets long waiters overtake, bounded by `max_boost`
//! 4. Dependency-gated entries become eligible only when ready
//! 5. Unaffordable entries are skipped in favor of cheaper eligible ones

use std::sync::Arc;

use taskloom::core::{
    AgingPolicy, DependencySource, PrioritySource, ResourceCost, ScheduledTask, TaskMetadata,
    TaskSource,
};
use taskloom::util::{Clock, ManualClock};

fn task(id: u64, priority: f64, cost: ResourceCost) -> ScheduledTask<String> {
    ScheduledTask {
        meta: TaskMetadata {
            id,
            cost,
            priority,
            created_at_ms: 0,
        },
        payload: format!("job-{id}"),
    }
}

#[test]
fn highest_priority_wins() {
    let source = PrioritySource::new(AgingPolicy::NONE, Arc::new(ManualClock::new(0)));
    source.enqueue(task(1, 1.0, ResourceCost::new())).unwrap();
    source.enqueue(task(2, 5.0, ResourceCost::new())).unwrap();
    source.enqueue(task(3, 3.0, ResourceCost::new())).unwrap();

    assert_eq!(source.next().unwrap().meta.id, 2);
    assert_eq!(source.next().unwrap().meta.id, 3);
    assert_eq!(source.next().unwrap().meta.id, 1);
}

#[test]
fn equal_priorities_dequeue_in_enqueue_order() {
    let clock = Arc::new(ManualClock::new(0));
    let source = PrioritySource::new(AgingPolicy::NONE, Arc::clone(&clock) as Arc<dyn Clock>);
    for id in [10, 11, 12] {
        source.enqueue(task(id, 2.0, ResourceCost::new())).unwrap();
        clock.advance(1);
    }
    assert_eq!(source.next().unwrap().meta.id, 10);
    assert_eq!(source.next().unwrap().meta.id, 11);
    assert_eq!(source.next().unwrap().meta.id, 12);
}

#[test]
fn aging_lets_long_waiters_overtake() {
    let clock = Arc::new(ManualClock::new(0));
    let aging = AgingPolicy {
        rate_per_ms: 0.01,
        max_boost: 10.0,
    };
    let source = PrioritySource::new(aging, Arc::clone(&clock) as Arc<dyn Clock>);
    source.enqueue(task(1, 1.0, ResourceCost::new())).unwrap();
    clock.advance(1_000);
    source.enqueue(task(2, 5.0, ResourceCost::new())).unwrap();

    // 1 waited 1000ms: effective 1.0 + 10.0 beats the fresh 5.0.
    assert_eq!(source.next().unwrap().meta.id, 1);
}

#[test]
fn aging_boost_never_exceeds_max_boost() {
    let clock = Arc::new(ManualClock::new(0));
    let aging = AgingPolicy {
        rate_per_ms: 1.0,
        max_boost: 2.0,
    };
    let source = PrioritySource::new(aging, Arc::clone(&clock) as Arc<dyn Clock>);
    source.enqueue(task(1, 0.0, ResourceCost::new())).unwrap();
    clock.advance(1_000_000);
    source.enqueue(task(2, 5.0, ResourceCost::new())).unwrap();

    // However long 1 waits, its effective priority caps at 2.0.
    assert_eq!(source.peek().unwrap().id, 2);
    assert!((source.peek().unwrap().effective_priority - 5.0).abs() < f64::EPSILON);
    assert_eq!(source.next().unwrap().meta.id, 2);
}

#[test]
fn diamond_dependencies_gate_eligibility() {
    let source = DependencySource::new(AgingPolicy::NONE, Arc::new(ManualClock::new(0)));
    source.enqueue(task(1, 0.0, ResourceCost::new()), &[]).unwrap();
    source.enqueue(task(2, 5.0, ResourceCost::new()), &[1]).unwrap();
    source.enqueue(task(3, 1.0, ResourceCost::new()), &[1]).unwrap();
    source
        .enqueue(task(4, 9.0, ResourceCost::new()), &[2, 3])
        .unwrap();

    assert_eq!(source.next().unwrap().meta.id, 1);
    assert!(source.next().is_none());
    source.complete(1).unwrap();

    // Both branches ready; priority decides, not enqueue order.
    assert_eq!(source.next().unwrap().meta.id, 2);
    assert_eq!(source.next().unwrap().meta.id, 3);
    assert!(source.next().is_none());
    source.complete(2).unwrap();
    source.complete(3).unwrap();
    assert_eq!(source.next().unwrap().meta.id, 4);
    source.complete(4).unwrap();
    assert!(source.is_done());
}

#[test]
fn unaffordable_head_is_skipped_for_cheaper_work() {
    let source = PrioritySource::new(AgingPolicy::NONE, Arc::new(ManualClock::new(0)));
    source
        .enqueue(task(1, 10.0, ResourceCost::new().with("cpu", 8)))
        .unwrap();
    source
        .enqueue(task(2, 1.0, ResourceCost::new().with("cpu", 2)))
        .unwrap();

    let budget = |cost: &ResourceCost| cost.get("cpu") <= 4;
    assert_eq!(source.next_affordable(&budget).unwrap().meta.id, 2);
    // The expensive head stays queued, unconsumed.
    assert!(source.next_affordable(&budget).is_none());
    assert_eq!(source.len(), 1);
}

#[test]
fn drained_after_close_and_settlement() {
    let source = DependencySource::new(AgingPolicy::NONE, Arc::new(ManualClock::new(0)));
    source.enqueue(task(1, 0.0, ResourceCost::new()), &[]).unwrap();
    source.close();
    assert!(source
        .enqueue(task(2, 0.0, ResourceCost::new()), &[])
        .is_err());

    assert!(!source.is_drained());
    let consumed = source.next().unwrap();
    assert!(!source.is_drained());
    source.complete(consumed.meta.id).unwrap();
    assert!(source.is_drained());
}

#[test]
fn abort_cascade_removes_dependents_from_the_queue() {
    let source = DependencySource::new(AgingPolicy::NONE, Arc::new(ManualClock::new(0)));
    source.enqueue(task(1, 0.0, ResourceCost::new()), &[]).unwrap();
    source.enqueue(task(2, 0.0, ResourceCost::new()), &[1]).unwrap();
    source.enqueue(task(3, 0.0, ResourceCost::new()), &[2]).unwrap();
    source.enqueue(task(4, 0.0, ResourceCost::new()), &[]).unwrap();

    let mut aborted = source.abort(1).unwrap();
    aborted.sort_unstable();
    assert_eq!(aborted, vec![1, 2, 3]);
    assert!(source.was_aborted(2));

    // The independent task is untouched.
    assert_eq!(source.next().unwrap().meta.id, 4);
    assert!(source.next().is_none());
}
