//! Command delivery: every command is sent, queued, or explicitly failed.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::{
    client::RelayClient, config::DeliveryConfig, error::Result, state::ConnectionState,
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The write side the delivery layer needs from a connection.
pub trait CommandTransport: Send + Sync + 'static {
    fn connection_state(&self) -> ConnectionState;
    fn send_message(&self, message: Value) -> impl Future<Output = Result<()>> + Send;
}

impl CommandTransport for RelayClient {
    fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    fn send_message(&self, message: Value) -> impl Future<Output = Result<()>> + Send {
        self.send(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub payload: Value,
    pub max_retries: u32,
    pub should_queue: bool,
    pub label: String,
    /// Owning session, used by [`CommandQueue::cancel_session`].
    pub session_id: Option<String>,
}

impl Command {
    pub fn new(label: impl Into<String>, payload: Value) -> Self {
        Self {
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
            should_queue: true,
            label: label.into(),
            session_id: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_queue(mut self) -> Self {
        self.should_queue = false;
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn session_input(session_id: &str, data: &str) -> Self {
        Self::new(
            "session.input",
            json!({"type": "session.input", "payload": {"session_id": session_id, "data": data}}),
        )
        .for_session(session_id)
    }

    pub fn session_resize(session_id: &str, cols: u16, rows: u16, device_id: &str) -> Self {
        Self::new(
            "session.resize",
            json!({
                "type": "session.resize",
                "payload": {"session_id": session_id, "cols": cols, "rows": rows, "device_id": device_id}
            }),
        )
        .for_session(session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    Failed(String),
}

impl SendOutcome {
    /// `Queued` counts as success for callers that only need eventual delivery.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    pub enqueued_at: Instant,
}

/// Bounded FIFO of deferred commands. Pushing past capacity evicts the
/// oldest entry; entries older than the TTL are dropped when taken.
#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    ttl: Duration,
    entries: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the evicted entry, if any.
    pub fn push(&mut self, command: Command, now: Instant) -> Option<QueuedCommand> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(QueuedCommand {
            command,
            enqueued_at: now,
        });
        evicted
    }

    /// Put commands back at the head, preserving their order.
    fn requeue_front(&mut self, commands: Vec<QueuedCommand>) {
        for entry in commands.into_iter().rev() {
            self.entries.push_front(entry);
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Remove everything, returning live entries in order plus the number of
    /// expired ones that were discarded.
    pub fn take_live(&mut self, now: Instant) -> (Vec<QueuedCommand>, usize) {
        let ttl = self.ttl;
        let (live, expired): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|entry| now.saturating_duration_since(entry.enqueued_at) <= ttl);
        (live, expired.len())
    }

    pub fn cancel_session(&mut self, session_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.command.session_id.as_deref() != Some(session_id));
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub expired: usize,
    pub deferred: usize,
}

/// Clears the draining flag on early exit. A drain that empties the queue
/// clears it itself, under the queue lock, and disarms the guard.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::Release);
        }
    }
}

pub struct CommandSender<T> {
    transport: T,
    config: DeliveryConfig,
    queue: Mutex<CommandQueue>,
    draining: AtomicBool,
}

impl<T: CommandTransport> CommandSender<T> {
    pub fn new(transport: T, config: DeliveryConfig) -> Self {
        let queue = CommandQueue::new(config.queue_capacity, config.queue_ttl);
        Self {
            transport,
            config,
            queue: Mutex::new(queue),
            draining: AtomicBool::new(false),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn cancel_session(&self, session_id: &str) -> usize {
        let dropped = self.queue.lock().cancel_session(session_id);
        if dropped > 0 {
            tracing::debug!(target = "session_relay::delivery", session_id, dropped, "cancelled queued commands");
        }
        dropped
    }

    pub fn clear(&self) -> usize {
        self.queue.lock().clear()
    }

    /// `min(base * 2^attempt, cap)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .retry_base
            .checked_mul(factor)
            .unwrap_or(self.config.retry_cap)
            .min(self.config.retry_cap)
    }

    pub async fn send(&self, command: Command) -> SendOutcome {
        let state = self.transport.connection_state();
        if !state.can_send() {
            return self.defer(command, format!("not connected ({state})"));
        }
        // Older queued commands go first; the running drain picks this one up.
        // The flag is read under the queue lock so the drain cannot finish
        // between the check and the push.
        if command.should_queue {
            let mut queue = self.queue.lock();
            if self.draining.load(Ordering::Acquire) {
                tracing::debug!(target = "session_relay::delivery", label = %command.label, "queued behind drain");
                if let Some(evicted) = queue.push(command, Instant::now()) {
                    tracing::warn!(
                        target = "session_relay::delivery",
                        evicted = %evicted.command.label,
                        capacity = queue.capacity(),
                        "command queue full; evicted oldest"
                    );
                }
                return SendOutcome::Queued;
            }
        }

        let mut attempt = 0;
        loop {
            // The state may have changed since the first check or while backing off.
            let state = self.transport.connection_state();
            if !state.can_send() {
                return self.defer(command, format!("connection lost before write ({state})"));
            }
            match self.transport.send_message(command.payload.clone()).await {
                Ok(()) => {
                    tracing::trace!(target = "session_relay::delivery", label = %command.label, attempt, "command sent");
                    return SendOutcome::Sent;
                }
                Err(error) if attempt >= command.max_retries => {
                    return self.defer(command, error.to_string());
                }
                Err(error) => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        target = "session_relay::delivery",
                        label = %command.label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "command send failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn defer(&self, command: Command, reason: String) -> SendOutcome {
        if !command.should_queue {
            tracing::warn!(target = "session_relay::delivery", label = %command.label, reason = %reason, "command failed");
            return SendOutcome::Failed(reason);
        }
        let label = command.label.clone();
        let mut queue = self.queue.lock();
        if let Some(evicted) = queue.push(command, Instant::now()) {
            tracing::warn!(
                target = "session_relay::delivery",
                evicted = %evicted.command.label,
                capacity = queue.capacity(),
                "command queue full; evicted oldest"
            );
        }
        tracing::debug!(target = "session_relay::delivery", label = %label, reason = %reason, queued = queue.len(), "command queued");
        SendOutcome::Queued
    }

    /// Send everything queued, oldest first, including commands queued while
    /// the drain runs. Drained commands are never re-queued on failure; if
    /// the connection drops mid-drain the untouched remainder goes back to
    /// the head of the queue.
    pub async fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }
        let mut guard = DrainGuard {
            flag: &self.draining,
            armed: true,
        };

        let mut report = DrainReport::default();
        let mut first = true;
        loop {
            let (pending, expired) = {
                let mut queue = self.queue.lock();
                let (pending, expired) = queue.take_live(Instant::now());
                if pending.is_empty() {
                    self.draining.store(false, Ordering::Release);
                    guard.armed = false;
                }
                (pending, expired)
            };
            if expired > 0 {
                tracing::info!(target = "session_relay::delivery", expired, "dropped expired commands");
            }
            report.expired += expired;
            if pending.is_empty() {
                break;
            }

            let mut pending = VecDeque::from(pending);
            while let Some(entry) = pending.pop_front() {
                if !first {
                    tokio::time::sleep(self.config.drain_spacing).await;
                }
                first = false;

                if !self.transport.connection_state().can_send() {
                    pending.push_front(entry);
                    report.deferred = pending.len();
                    self.queue.lock().requeue_front(pending.into_iter().collect());
                    return report;
                }

                let mut command = entry.command;
                command.should_queue = false;
                match self.send(command).await {
                    SendOutcome::Sent => report.sent += 1,
                    SendOutcome::Queued | SendOutcome::Failed(_) => report.failed += 1,
                }
            }
        }
        report
    }

    /// Drain whenever the connection becomes authenticated.
    pub fn spawn_drain_on_connect(
        self: &Arc<Self>,
        mut states: watch::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        let sender = Arc::clone(self);
        tokio::spawn(async move {
            let mut was_live = states.borrow_and_update().is_authenticated();
            if was_live {
                sender.drain().await;
            }
            while states.changed().await.is_ok() {
                let live = states.borrow_and_update().is_authenticated();
                if live && !was_live {
                    let report = sender.drain().await;
                    tracing::info!(
                        target = "session_relay::delivery",
                        sent = report.sent,
                        failed = report.failed,
                        expired = report.expired,
                        deferred = report.deferred,
                        "drained command queue"
                    );
                }
                was_live = live;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        future::Future,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::{sync::watch, time::Instant};

    use super::*;
    use crate::{config::DeliveryConfig, error::ClientError};

    #[derive(Default)]
    struct FakeConnection {
        scripted_states: Mutex<VecDeque<ConnectionState>>,
        state: Mutex<Option<ConnectionState>>,
        failures_left: AtomicU32,
        sent: Mutex<Vec<(Value, Instant)>>,
    }

    impl FakeConnection {
        fn in_state(state: ConnectionState) -> Arc<Self> {
            let fake = Self::default();
            *fake.state.lock() = Some(state);
            Arc::new(fake)
        }

        fn set_state(&self, state: ConnectionState) {
            *self.state.lock() = Some(state);
        }

        fn sent_payloads(&self) -> Vec<Value> {
            self.sent.lock().iter().map(|(v, _)| v.clone()).collect()
        }
    }

    impl CommandTransport for Arc<FakeConnection> {
        fn connection_state(&self) -> ConnectionState {
            if let Some(next) = self.scripted_states.lock().pop_front() {
                return next;
            }
            self.state
                .lock()
                .clone()
                .unwrap_or(ConnectionState::Disconnected)
        }

        fn send_message(&self, message: Value) -> impl Future<Output = Result<()>> + Send {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !failing {
                self.sent.lock().push((message, Instant::now()));
            }
            async move {
                if failing {
                    Err(ClientError::TransportClosed("write refused".into()))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn sender(conn: &Arc<FakeConnection>) -> CommandSender<Arc<FakeConnection>> {
        CommandSender::new(conn.clone(), DeliveryConfig::default())
    }

    fn cmd(n: u32) -> Command {
        Command::new(format!("cmd-{n}"), json!({"type": "session.input", "payload": {"n": n}}))
    }

    #[tokio::test]
    async fn sends_immediately_when_authenticated() {
        let conn = FakeConnection::in_state(ConnectionState::Authenticated);
        let sender = sender(&conn);
        assert_eq!(sender.send(cmd(1)).await, SendOutcome::Sent);
        assert_eq!(conn.sent_payloads().len(), 1);
        assert_eq!(sender.queued(), 0);
    }

    #[tokio::test]
    async fn degraded_connection_still_attempts_send() {
        let conn = FakeConnection::in_state(ConnectionState::Degraded("slow host".into()));
        let sender = sender(&conn);
        assert_eq!(sender.send(cmd(1)).await, SendOutcome::Sent);
    }

    #[tokio::test]
    async fn queues_while_disconnected() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = sender(&conn);
        let outcome = sender.send(cmd(1)).await;
        assert_eq!(outcome, SendOutcome::Queued);
        assert!(outcome.is_success());
        assert_eq!(sender.queued(), 1);
        assert!(conn.sent_payloads().is_empty());
    }

    #[tokio::test]
    async fn unqueueable_command_fails_while_disconnected() {
        let conn = FakeConnection::in_state(ConnectionState::Connecting);
        let sender = sender(&conn);
        let outcome = sender.send(cmd(1).without_queue()).await;
        assert!(matches!(outcome, SendOutcome::Failed(reason) if reason.contains("connecting")));
        assert_eq!(sender.queued(), 0);
    }

    #[tokio::test]
    async fn state_is_rechecked_right_before_the_write() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        conn.scripted_states
            .lock()
            .extend([ConnectionState::Authenticated, ConnectionState::Disconnected]);
        let sender = sender(&conn);
        assert_eq!(sender.send(cmd(1)).await, SendOutcome::Queued);
        assert!(conn.sent_payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let conn = FakeConnection::in_state(ConnectionState::Verified);
        conn.failures_left.store(2, Ordering::SeqCst);
        let sender = sender(&conn);
        let start = Instant::now();
        assert_eq!(sender.send(cmd(1)).await, SendOutcome::Sent);
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert_eq!(conn.sent_payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_queue_or_failure() {
        let conn = FakeConnection::in_state(ConnectionState::Verified);
        conn.failures_left.store(100, Ordering::SeqCst);
        let sender = sender(&conn);
        assert_eq!(
            sender.send(cmd(1).with_max_retries(2)).await,
            SendOutcome::Queued
        );
        let outcome = sender.send(cmd(2).with_max_retries(0).without_queue()).await;
        assert!(matches!(outcome, SendOutcome::Failed(reason) if reason.contains("write refused")));
        assert_eq!(sender.queued(), 1);
    }

    #[test]
    fn retry_delay_is_capped() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = sender(&conn);
        let delays: Vec<u128> = (0..6).map(|n| sender.retry_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 4000, 4000]);
        assert_eq!(sender.retry_delay(u32::MAX), Duration::from_secs(4));
    }

    #[test]
    fn queue_evicts_exactly_the_oldest() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(3, Duration::from_secs(60));
        for n in 0..3 {
            assert!(queue.push(cmd(n), now).is_none());
        }
        let evicted = queue.push(cmd(3), now).unwrap();
        assert_eq!(evicted.command.label, "cmd-0");
        assert_eq!(queue.len(), 3);
        let (live, _) = queue.take_live(now);
        let labels: Vec<_> = live.iter().map(|e| e.command.label.as_str()).collect();
        assert_eq!(labels, vec!["cmd-1", "cmd-2", "cmd-3"]);
    }

    #[test]
    fn expired_entries_are_dropped_on_take() {
        let start = Instant::now();
        let mut queue = CommandQueue::new(10, Duration::from_secs(60));
        queue.push(cmd(1), start);
        queue.push(cmd(2), start + Duration::from_secs(30));
        let (live, expired) = queue.take_live(start + Duration::from_secs(61));
        assert_eq!(expired, 1);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].command.label, "cmd-2");
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_session_only_drops_that_session() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(10, Duration::from_secs(60));
        queue.push(Command::session_input("s1", "ls\n"), now);
        queue.push(Command::session_input("s2", "pwd\n"), now);
        queue.push(Command::session_resize("s1", 80, 24, "phone"), now);
        assert_eq!(queue.cancel_session("s1"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.clear(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_sends_in_order_with_spacing() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = sender(&conn);
        for n in 0..3 {
            sender.send(cmd(n)).await;
        }
        conn.set_state(ConnectionState::Authenticated);
        let report = sender.drain().await;
        assert_eq!(report.sent, 3);
        let sent = conn.sent.lock().clone();
        let order: Vec<_> = sent.iter().map(|(v, _)| v["payload"]["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(50));
        assert_eq!(sender.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_sent_during_a_drain_wait_their_turn() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = Arc::new(sender(&conn));
        for n in 0..3 {
            sender.send(cmd(n)).await;
        }
        conn.set_state(ConnectionState::Authenticated);

        let draining = Arc::clone(&sender);
        let drain = tokio::spawn(async move { draining.drain().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn.sent_payloads().len(), 1);
        assert_eq!(sender.send(cmd(9)).await, SendOutcome::Queued);

        let report = drain.await.unwrap();
        assert_eq!(report.sent, 4);
        let order: Vec<_> = conn
            .sent_payloads()
            .iter()
            .map(|v| v["payload"]["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(9)]);
        assert_eq!(sender.queued(), 0);

        assert_eq!(sender.send(cmd(10)).await, SendOutcome::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_command_that_fails_is_not_requeued() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = sender(&conn);
        sender.send(cmd(1).with_max_retries(0)).await;
        conn.set_state(ConnectionState::Authenticated);
        conn.failures_left.store(1, Ordering::SeqCst);
        let report = sender.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(sender.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_commands_are_not_sent_on_drain() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = sender(&conn);
        sender.send(cmd(1)).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        sender.send(cmd(2)).await;
        conn.set_state(ConnectionState::Authenticated);
        let report = sender.drain().await;
        assert_eq!(report.expired, 1);
        assert_eq!(conn.sent_payloads(), vec![cmd(2).payload]);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_drop_mid_drain_keeps_the_rest_queued() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = sender(&conn);
        for n in 0..3 {
            sender.send(cmd(n)).await;
        }
        conn.set_state(ConnectionState::Authenticated);
        // drain check, send check, recheck, then the second drain check sees the drop
        conn.scripted_states.lock().extend([
            ConnectionState::Authenticated,
            ConnectionState::Authenticated,
            ConnectionState::Authenticated,
            ConnectionState::Disconnected,
        ]);
        let report = sender.drain().await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(sender.queued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_when_connection_authenticates() {
        let conn = FakeConnection::in_state(ConnectionState::Disconnected);
        let sender = Arc::new(sender(&conn));
        sender.send(cmd(7)).await;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let task = sender.spawn_drain_on_connect(state_rx);

        conn.set_state(ConnectionState::Authenticated);
        state_tx.send_replace(ConnectionState::Connecting);
        state_tx.send_replace(ConnectionState::Authenticated);
        for _ in 0..10 {
            if !conn.sent_payloads().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.sent_payloads(), vec![cmd(7).payload]);
        drop(state_tx);
        task.await.unwrap();
    }
}
