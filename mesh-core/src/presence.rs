//! Presence channel: one broker session used for bootstrap heartbeats, with
//! fallback relay selection and fixed-backoff retry.

use std::time::{Duration, Instant};

use crate::config::MeshConfig;
use crate::core::{Action, Timer};
use crate::protocol::Packet;

/// Topic every node publishes heartbeats on.
pub const PRESENCE_TOPIC: &str = "meshchat/presence";

/// Reason code of an intentional disconnect; does not trigger a retry.
pub const CLEAN_DISCONNECT: &str = "none";

/// Which broker endpoint a session targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Primary,
    /// Alternate relay, same logical topic.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    Connecting,
    Connected,
}

/// Work for the host's broker adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    Connect {
        endpoint: Endpoint,
        timeout: Duration,
        session: u64,
    },
    Subscribe { topic: String },
    Publish { topic: String, packet: Packet },
    Disconnect { session: u64 },
}

pub struct PresenceChannel {
    state: PresenceState,
    failures: u32,
    session: u64,
    endpoint: Endpoint,
    last_pulse: Option<Instant>,
    timeout: Duration,
    timeout_fallback: Duration,
    retry: Duration,
    pulse: Duration,
    pulse_fallback: Duration,
}

impl PresenceChannel {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            state: PresenceState::Idle,
            failures: 0,
            session: 0,
            endpoint: Endpoint::Primary,
            last_pulse: None,
            timeout: Duration::from_millis(config.presence_timeout_ms),
            timeout_fallback: Duration::from_millis(config.presence_timeout_fallback_ms),
            retry: config.presence_retry(),
            pulse: Duration::from_millis(config.pulse_interval_ms),
            pulse_fallback: Duration::from_millis(config.pulse_interval_fallback_ms),
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == PresenceState::Connected
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// True when the live (or last attempted) session goes through the fallback relay.
    pub fn via_fallback(&self) -> bool {
        self.endpoint == Endpoint::Fallback
    }

    /// Open a session. No-op while connected or connecting.
    pub fn start(&mut self, out: &mut Vec<Action>) {
        if self.state != PresenceState::Idle {
            return;
        }
        self.session += 1;
        self.endpoint = if self.failures > 0 {
            Endpoint::Fallback
        } else {
            Endpoint::Primary
        };
        let timeout = match self.endpoint {
            Endpoint::Primary => self.timeout,
            Endpoint::Fallback => self.timeout_fallback,
        };
        self.state = PresenceState::Connecting;
        tracing::debug!(session = self.session, endpoint = ?self.endpoint, "presence connecting");
        out.push(Action::Presence(PresenceAction::Connect {
            endpoint: self.endpoint,
            timeout,
            session: self.session,
        }));
        out.push(Action::Schedule {
            after: timeout,
            timer: Timer::PresenceTimeout {
                session: self.session,
            },
        });
    }

    /// Session established. Returns false for stale sessions.
    pub fn on_connected(&mut self, session: u64, out: &mut Vec<Action>) -> bool {
        if session != self.session || self.state != PresenceState::Connecting {
            return false;
        }
        self.state = PresenceState::Connected;
        self.failures = 0;
        self.last_pulse = None;
        tracing::info!(session, fallback = self.via_fallback(), "presence connected");
        out.push(Action::Presence(PresenceAction::Subscribe {
            topic: PRESENCE_TOPIC.to_owned(),
        }));
        true
    }

    /// Session lost or connect failed. Anything but a clean disconnect schedules a retry.
    /// Only failed connect attempts count towards the fallback switch; a drop after a
    /// successful session retries the primary endpoint first.
    pub fn on_lost(&mut self, session: u64, reason: &str, out: &mut Vec<Action>) {
        if session != self.session || self.state == PresenceState::Idle {
            return;
        }
        let was_connecting = self.state == PresenceState::Connecting;
        self.state = PresenceState::Idle;
        if reason == CLEAN_DISCONNECT {
            tracing::debug!(session, "presence closed cleanly");
            return;
        }
        if was_connecting {
            self.failures = self.failures.saturating_add(1);
        }
        tracing::debug!(session, reason, failures = self.failures, "presence lost, retrying");
        out.push(Action::Schedule {
            after: self.retry,
            timer: Timer::PresenceRetry { session },
        });
    }

    /// Handshake timer fired: an attempt still connecting is a failure.
    pub fn on_timeout(&mut self, session: u64, out: &mut Vec<Action>) {
        if session != self.session || self.state != PresenceState::Connecting {
            return;
        }
        out.push(Action::Presence(PresenceAction::Disconnect { session }));
        self.on_lost(session, "handshake timeout", out);
    }

    /// Backoff elapsed for `session`.
    pub fn on_retry(&mut self, session: u64, out: &mut Vec<Action>) {
        if session == self.session {
            self.start(out);
        }
    }

    pub fn pulse_interval(&self) -> Duration {
        match self.endpoint {
            Endpoint::Primary => self.pulse,
            Endpoint::Fallback => self.pulse_fallback,
        }
    }

    /// Heartbeat due now? Marks it sent when true.
    pub fn take_pulse(&mut self, now: Instant) -> bool {
        if !self.is_connected() {
            return false;
        }
        let due = self
            .last_pulse
            .map_or(true, |t| now.saturating_duration_since(t) >= self.pulse_interval());
        if due {
            self.last_pulse = Some(now);
        }
        due
    }

    /// Send the next heartbeat at the next opportunity.
    pub fn reset_pulse(&mut self) {
        self.last_pulse = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connects(out: &[Action]) -> Vec<(Endpoint, Duration)> {
        out.iter()
            .filter_map(|a| match a {
                Action::Presence(PresenceAction::Connect { endpoint, timeout, .. }) => {
                    Some((*endpoint, *timeout))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_is_noop_while_busy() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        p.start(&mut out);
        p.start(&mut out);
        assert_eq!(connects(&out).len(), 1);
        assert!(p.on_connected(p.session(), &mut out));
        p.start(&mut out);
        assert_eq!(connects(&out).len(), 1);
    }

    #[test]
    fn failure_switches_to_fallback_with_longer_timeout() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        p.start(&mut out);
        let s1 = p.session();
        p.on_lost(s1, "broker unreachable", &mut out);
        assert!(out.iter().any(|a| matches!(
            a,
            Action::Schedule { timer: Timer::PresenceRetry { .. }, after } if *after == Duration::from_secs(3)
        )));
        p.on_retry(s1, &mut out);
        let c = connects(&out);
        assert_eq!(c[0], (Endpoint::Primary, Duration::from_secs(5)));
        assert_eq!(c[1], (Endpoint::Fallback, Duration::from_secs(10)));
        assert!(p.on_connected(p.session(), &mut out));
        assert_eq!(p.failures(), 0);
        assert!(p.via_fallback());
        assert_eq!(p.pulse_interval(), Duration::from_secs(10));
    }

    #[test]
    fn dropped_session_retries_primary_first() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        p.start(&mut out);
        p.on_lost(p.session(), "broker unreachable", &mut out);
        p.on_retry(p.session(), &mut out);
        assert!(p.on_connected(p.session(), &mut out));
        assert!(p.via_fallback());

        for _ in 0..3 {
            out.clear();
            let s = p.session();
            p.on_lost(s, "connection reset", &mut out);
            p.on_retry(s, &mut out);
            assert_eq!(connects(&out), vec![(Endpoint::Primary, Duration::from_secs(5))]);
            assert!(p.on_connected(p.session(), &mut out));
        }
        assert_eq!(p.failures(), 0);
    }

    #[test]
    fn failed_primary_after_drop_falls_back_again() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        p.start(&mut out);
        p.on_connected(p.session(), &mut out);
        let s = p.session();
        p.on_lost(s, "connection reset", &mut out);
        p.on_retry(s, &mut out);
        let s = p.session();
        p.on_timeout(s, &mut out);
        out.clear();
        p.on_retry(s, &mut out);
        assert_eq!(connects(&out), vec![(Endpoint::Fallback, Duration::from_secs(10))]);
    }

    #[test]
    fn clean_disconnect_does_not_retry() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        p.start(&mut out);
        p.on_connected(p.session(), &mut out);
        out.clear();
        p.on_lost(p.session(), CLEAN_DISCONNECT, &mut out);
        assert!(out.is_empty());
        assert_eq!(p.state(), PresenceState::Idle);
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        p.start(&mut out);
        let old = p.session();
        p.on_timeout(old, &mut out);
        p.on_retry(old, &mut out);
        assert!(!p.on_connected(old, &mut out));
        assert!(p.on_connected(p.session(), &mut out));
    }

    #[test]
    fn pulses_follow_cadence() {
        let mut p = PresenceChannel::new(&MeshConfig::default());
        let mut out = Vec::new();
        let t0 = Instant::now();
        assert!(!p.take_pulse(t0));
        p.start(&mut out);
        p.on_connected(p.session(), &mut out);
        assert!(p.take_pulse(t0));
        assert!(!p.take_pulse(t0 + Duration::from_secs(3)));
        assert!(p.take_pulse(t0 + Duration::from_secs(4)));
    }
}
