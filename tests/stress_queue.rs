//! Stress tests for the deferred command queue.
//! Run with: cargo test --test stress_queue -- --ignored

use std::time::Duration;

use serde_json::json;
use session_relay::delivery::{Command, CommandQueue};
use tokio::time::Instant;

fn cmd(id: usize) -> Command {
    Command::new(
        format!("cmd-{id}"),
        json!({"type": "session.input", "payload": {"session_id": format!("s-{}", id % 7), "data": id.to_string()}}),
    )
    .for_session(format!("s-{}", id % 7))
}

#[test]
#[ignore]
fn queue_10k_pushes_keeps_newest_in_order() {
    let capacity = 50;
    let mut queue = CommandQueue::new(capacity, Duration::from_secs(60));
    let now = Instant::now();

    let mut evicted = 0;
    for i in 0..10_000 {
        if queue.push(cmd(i), now).is_some() {
            evicted += 1;
        }
        assert!(queue.len() <= capacity, "queue exceeded capacity at push {i}");
    }
    assert_eq!(evicted, 10_000 - capacity);

    let (live, expired) = queue.take_live(now);
    assert_eq!(expired, 0);
    let labels: Vec<_> = live.iter().map(|entry| entry.command.label.clone()).collect();
    let expected: Vec<_> = (10_000 - capacity..10_000).map(|i| format!("cmd-{i}")).collect();
    assert_eq!(labels, expected);
    assert!(queue.is_empty());
}

#[test]
#[ignore]
fn queue_expiry_under_churn() {
    let ttl = Duration::from_secs(60);
    let mut queue = CommandQueue::new(1_000, ttl);
    let start = Instant::now();

    for i in 0..1_000 {
        let _ = queue.push(cmd(i), start + Duration::from_millis(i as u64 * 100));
    }
    // Entries enqueued in the first 40s are past the TTL at t=100s.
    let (live, expired) = queue.take_live(start + Duration::from_secs(100));
    assert_eq!(expired, 400);
    assert_eq!(live.len(), 600);
    assert_eq!(live[0].command.label, "cmd-400");
}

#[test]
#[ignore]
fn cancel_session_across_large_queue() {
    let mut queue = CommandQueue::new(7_000, Duration::from_secs(60));
    let now = Instant::now();
    for i in 0..7_000 {
        let _ = queue.push(cmd(i), now);
    }
    assert_eq!(queue.cancel_session("s-3"), 1_000);
    assert_eq!(queue.len(), 6_000);
    let (live, _) = queue.take_live(now);
    assert!(live
        .iter()
        .all(|entry| entry.command.session_id.as_deref() != Some("s-3")));
}
