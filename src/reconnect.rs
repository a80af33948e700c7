use std::time::Duration;

use tokio::time::Instant;

use crate::state::ConnectionState;

/// Backoff bookkeeping for reconnect attempts. At most one attempt is ever
/// scheduled; the connection actor owns the timer and asks this controller
/// whether to arm or fire it.
#[derive(Debug)]
pub struct ReconnectController {
    min_delay: Duration,
    max_delay: Duration,
    attempts: u32,
    scheduled_at: Option<Instant>,
}

impl ReconnectController {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            attempts: 0,
            scheduled_at: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.scheduled_at
    }

    /// `min(min_delay * 2^attempts, max_delay)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts);
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Arm the reconnect timer. No-op (returns `None`) if an attempt is
    /// already scheduled, a handshake is in flight, or the client is connected.
    pub fn schedule(&mut self, state: &ConnectionState, now: Instant) -> Option<Duration> {
        if self.scheduled_at.is_some() || state.is_handshaking() || state.is_authenticated() {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.scheduled_at = Some(now + delay);
        Some(delay)
    }

    /// Called when the timer fires. Re-validates before committing to an
    /// attempt; on success the attempt counter is incremented and the new
    /// attempt number returned.
    pub fn fire(&mut self, state: &ConnectionState, has_credentials: bool) -> Option<u32> {
        self.scheduled_at.take()?;
        if !matches!(state, ConnectionState::Disconnected) || !has_credentials {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Drop any pending timer without touching the attempt counter.
    pub fn cancel(&mut self) {
        self.scheduled_at = None;
    }

    /// A handshake succeeded.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.scheduled_at = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::ReconnectController;
    use crate::state::ConnectionState;

    fn controller() -> ReconnectController {
        ReconnectController::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    #[test]
    fn delay_grows_then_caps() {
        let rc = controller();
        let delays: Vec<Duration> = (0..12).map(|n| rc.delay_for(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[3], Duration::from_secs(4));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
        assert_eq!(rc.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn only_one_attempt_scheduled() {
        let mut rc = controller();
        let now = Instant::now();
        let state = ConnectionState::Disconnected;
        assert_eq!(rc.schedule(&state, now), Some(Duration::from_millis(500)));
        assert_eq!(rc.schedule(&state, now), None);
    }

    #[test]
    fn schedule_is_noop_while_connecting_or_connected() {
        let mut rc = controller();
        let now = Instant::now();
        assert!(rc.schedule(&ConnectionState::Connecting, now).is_none());
        assert!(rc.schedule(&ConnectionState::Verified, now).is_none());
        assert!(!rc.is_scheduled());
    }

    #[test]
    fn fire_revalidates_state() {
        let mut rc = controller();
        let now = Instant::now();
        rc.schedule(&ConnectionState::Disconnected, now);
        assert_eq!(rc.fire(&ConnectionState::Connecting, true), None);
        assert_eq!(rc.attempts(), 0);

        rc.schedule(&ConnectionState::Disconnected, now);
        assert_eq!(rc.fire(&ConnectionState::Disconnected, false), None);

        rc.schedule(&ConnectionState::Disconnected, now);
        assert_eq!(rc.fire(&ConnectionState::Disconnected, true), Some(1));
    }

    #[test]
    fn failures_keep_growing_until_reset() {
        let mut rc = controller();
        let now = Instant::now();
        let state = ConnectionState::Disconnected;
        let mut observed = Vec::new();
        for _ in 0..4 {
            observed.push(rc.schedule(&state, now).unwrap());
            rc.fire(&state, true);
        }
        assert_eq!(
            observed,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        rc.reset();
        assert_eq!(rc.schedule(&state, now), Some(Duration::from_millis(500)));
    }

    #[test]
    fn cancel_stops_pending_timer() {
        let mut rc = controller();
        rc.schedule(&ConnectionState::Disconnected, Instant::now());
        rc.cancel();
        assert!(rc.deadline().is_none());
        assert_eq!(rc.fire(&ConnectionState::Disconnected, true), None);
    }
}
