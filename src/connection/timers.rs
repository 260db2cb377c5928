//! Connection Timers
//!
//! Single responsibility: keep the deadlines of the connection-level timers
//! and say which one is due. The driver sleeps until the earliest deadline,
//! then asks [`Timers::take_due`] what fired.
//!
//! | Timer       | Armed when                     | On expiry                       |
//! |-------------|--------------------------------|---------------------------------|
//! | connect     | a connect attempt starts       | teardown with `ConnectTimeout`  |
//! | heartbeat   | connected, and on every pong   | send a ping                     |
//! | idle        | idleness observed (two phases) | debug note, then idle teardown  |
//! | cooldown    | after a teardown that retries  | reconnect unless idle           |

use std::time::Duration;
use tokio::time::Instant;

use crate::config::IdlePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Connect,
    Heartbeat,
    IdleMidpoint,
    IdleDisconnect,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdlePhase {
    Midpoint { remaining: Duration },
    Disconnect,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    connect: Option<Instant>,
    heartbeat: Option<Instant>,
    idle: Option<(IdlePhase, Instant)>,
    cooldown: Option<Instant>,
}

/// Split an idle timeout into its quiet first half and disconnecting second half.
pub(crate) fn split_idle(timeout: Duration) -> (Duration, Duration) {
    let first = timeout / 2;
    (first, timeout - first)
}

/// How long to wait before reconnecting, given how long the last connection
/// stayed up. Keeps one connect-plus-cooldown cycle close to `cooldown`.
pub(crate) fn cooldown_after(cooldown: Duration, connected_for: Option<Duration>) -> Duration {
    cooldown.saturating_sub(connected_for.unwrap_or_default())
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_connect(&mut self, now: Instant, timeout: Duration) {
        self.connect = Some(now + timeout);
    }

    pub fn clear_connect(&mut self) {
        self.connect = None;
    }

    pub fn arm_heartbeat(&mut self, now: Instant, period: Duration) {
        self.heartbeat = Some(now + period);
    }

    /// Clear and re-arm the idle timer from its first phase.
    pub fn schedule_idle(&mut self, now: Instant, policy: IdlePolicy) {
        self.idle = match policy {
            IdlePolicy::Never => None,
            IdlePolicy::After(timeout) => {
                let (first, remaining) = split_idle(timeout);
                Some((IdlePhase::Midpoint { remaining }, now + first))
            }
        };
    }

    pub fn clear_idle(&mut self) {
        self.idle = None;
    }

    #[cfg(test)]
    pub fn idle_armed(&self) -> bool {
        self.idle.is_some()
    }

    pub fn arm_cooldown(&mut self, now: Instant, wait: Duration) {
        self.cooldown = Some(now + wait);
    }

    pub fn clear_cooldown(&mut self) {
        self.cooldown = None;
    }

    pub fn cooldown_pending(&self) -> bool {
        self.cooldown.is_some()
    }

    /// Everything tied to one connection. The cooldown outlives it.
    pub fn clear_connection(&mut self) {
        self.connect = None;
        self.heartbeat = None;
        self.idle = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect,
            self.heartbeat,
            self.idle.map(|(_, at)| at),
            self.cooldown,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Pop the earliest timer that is due at `now`.
    ///
    /// Firing the idle midpoint arms the disconnect phase in its place.
    pub fn take_due(&mut self, now: Instant) -> Option<TimerKind> {
        let due = |at: Option<Instant>| at.filter(|at| *at <= now);

        let candidates = [
            (TimerKind::Connect, due(self.connect)),
            (TimerKind::Heartbeat, due(self.heartbeat)),
            (TimerKind::IdleMidpoint, due(self.idle.map(|(_, at)| at))),
            (TimerKind::Cooldown, due(self.cooldown)),
        ];
        let (kind, _) = candidates
            .into_iter()
            .filter_map(|(kind, at)| at.map(|at| (kind, at)))
            .min_by_key(|(_, at)| *at)?;

        match kind {
            TimerKind::Connect => self.connect = None,
            TimerKind::Heartbeat => self.heartbeat = None,
            TimerKind::Cooldown => self.cooldown = None,
            TimerKind::IdleMidpoint | TimerKind::IdleDisconnect => {
                return match self.idle.take() {
                    Some((IdlePhase::Midpoint { remaining }, at)) => {
                        self.idle = Some((IdlePhase::Disconnect, at + remaining));
                        Some(TimerKind::IdleMidpoint)
                    }
                    Some((IdlePhase::Disconnect, _)) => Some(TimerKind::IdleDisconnect),
                    None => None,
                };
            }
        }
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_reduction() {
        let cooldown = Duration::from_secs(5);
        assert_eq!(cooldown_after(cooldown, None), cooldown);
        assert_eq!(
            cooldown_after(cooldown, Some(Duration::from_secs(2))),
            Duration::from_secs(3)
        );
        assert_eq!(
            cooldown_after(cooldown, Some(Duration::from_secs(9))),
            Duration::ZERO
        );
    }

    #[test]
    fn test_split_idle() {
        assert_eq!(
            split_idle(Duration::from_millis(101)),
            (Duration::from_millis(50), Duration::from_millis(51))
        );
        assert_eq!(split_idle(Duration::ZERO), (Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn test_idle_two_phases() {
        let start = Instant::now();
        let mut timers = Timers::new();
        timers.schedule_idle(start, IdlePolicy::After(Duration::from_millis(100)));

        assert_eq!(timers.take_due(start + Duration::from_millis(49)), None);
        assert_eq!(
            timers.take_due(start + Duration::from_millis(50)),
            Some(TimerKind::IdleMidpoint)
        );
        assert_eq!(
            timers.next_deadline(),
            Some(start + Duration::from_millis(100))
        );
        assert_eq!(
            timers.take_due(start + Duration::from_millis(100)),
            Some(TimerKind::IdleDisconnect)
        );
        assert!(!timers.idle_armed());
    }

    #[test]
    fn test_never_policy_disarms_idle() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule_idle(now, IdlePolicy::After(Duration::ZERO));
        assert!(timers.idle_armed());
        timers.schedule_idle(now, IdlePolicy::Never);
        assert!(!timers.idle_armed());
    }

    #[test]
    fn test_earliest_fires_first() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm_connect(now, Duration::from_millis(30));
        timers.arm_heartbeat(now, Duration::from_millis(10));
        timers.arm_cooldown(now, Duration::from_millis(20));

        let later = now + Duration::from_millis(40);
        assert_eq!(timers.take_due(later), Some(TimerKind::Heartbeat));
        assert_eq!(timers.take_due(later), Some(TimerKind::Cooldown));
        assert_eq!(timers.take_due(later), Some(TimerKind::Connect));
        assert_eq!(timers.take_due(later), None);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_clear_connection_keeps_cooldown() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm_connect(now, Duration::from_secs(1));
        timers.arm_cooldown(now, Duration::from_secs(2));
        timers.clear_connection();
        assert!(timers.cooldown_pending());
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(2)));
    }
}
