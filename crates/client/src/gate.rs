//! Rate/debounce gate in front of the channel.
//!
//! At most one turn is in flight. Submissions made while a turn is in flight
//! or during the cool-down after an answer are held in a single pending slot;
//! a newer submission replaces the held one.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use foliochat_protocol::word_count;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Quiet period after an answer before the next message goes out
    pub cooldown: Duration,
    pub max_words: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(1500),
            max_words: 120,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateRejection {
    #[error("Type a message first.")]
    Empty,
    #[error("That message is {count} words long. Please keep it under {max} words.")]
    TooManyWords { count: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Send this (trimmed) text now. The gate now counts a turn as in flight.
    Accepted(String),
    /// Held as the pending message, released by `poll`
    Queued,
    Rejected(GateRejection),
}

#[derive(Debug)]
pub struct RateGate {
    config: GateConfig,
    in_flight: bool,
    cooldown_until: Option<Instant>,
    pending: Option<String>,
}

impl RateGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            in_flight: false,
            cooldown_until: None,
            pending: None,
        }
    }

    pub fn try_send(&mut self, text: &str, now: Instant) -> GateOutcome {
        let text = text.trim();
        if text.is_empty() {
            return GateOutcome::Rejected(GateRejection::Empty);
        }
        let count = word_count(text);
        if count > self.config.max_words {
            return GateOutcome::Rejected(GateRejection::TooManyWords {
                count,
                max: self.config.max_words,
            });
        }

        if self.in_flight || self.cooling_down(now) {
            if let Some(replaced) = self.pending.replace(text.to_string()) {
                debug!(
                    component = "gate",
                    event = "gate.pending.replaced",
                    replaced_chars = replaced.chars().count(),
                );
            }
            return GateOutcome::Queued;
        }

        self.in_flight = true;
        GateOutcome::Accepted(text.to_string())
    }

    /// The in-flight turn ended (answered, failed or timed out). Starts the cool-down.
    pub fn turn_settled(&mut self, now: Instant) {
        self.in_flight = false;
        self.cooldown_until = Some(now + self.config.cooldown);
    }

    /// The accepted message never left (channel down). No cool-down.
    pub fn send_failed(&mut self) {
        self.in_flight = false;
    }

    /// Release the pending message once nothing is in flight and the cool-down is over.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        if self.in_flight || self.cooling_down(now) {
            return None;
        }
        let text = self.pending.take()?;
        self.in_flight = true;
        Some(text)
    }

    /// When `poll` should be tried next, if something is waiting on the cool-down.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.in_flight || self.pending.is_none() {
            return None;
        }
        self.cooldown_until
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RateGate {
        RateGate::new(GateConfig::default())
    }

    #[test]
    fn rejects_empty_and_long_messages_locally() {
        let now = Instant::now();
        let mut gate = gate();
        assert_eq!(
            gate.try_send("   ", now),
            GateOutcome::Rejected(GateRejection::Empty)
        );

        let long = vec!["word"; 121].join(" ");
        assert_eq!(
            gate.try_send(&long, now),
            GateOutcome::Rejected(GateRejection::TooManyWords {
                count: 121,
                max: 120
            })
        );
        assert!(!gate.is_in_flight());
    }

    #[test]
    fn only_the_latest_pending_message_survives() {
        let now = Instant::now();
        let mut gate = gate();
        assert_eq!(
            gate.try_send(" first ", now),
            GateOutcome::Accepted("first".to_string())
        );
        assert_eq!(gate.try_send("second", now), GateOutcome::Queued);
        assert_eq!(gate.try_send("third", now), GateOutcome::Queued);
        assert_eq!(gate.pending(), Some("third"));

        assert_eq!(gate.poll(now), None);
        gate.turn_settled(now);
        assert_eq!(gate.poll(now + Duration::from_millis(1499)), None);
        assert_eq!(
            gate.poll(now + Duration::from_millis(1500)),
            Some("third".to_string())
        );
        assert_eq!(gate.pending(), None);
        assert!(gate.is_in_flight());
    }

    #[test]
    fn cooldown_holds_new_submissions() {
        let now = Instant::now();
        let mut gate = gate();
        gate.try_send("one", now);
        gate.turn_settled(now);

        let soon = now + Duration::from_millis(200);
        assert_eq!(gate.try_send("two", soon), GateOutcome::Queued);
        assert_eq!(
            gate.next_deadline(),
            Some(now + Duration::from_millis(1500))
        );

        let later = now + Duration::from_secs(2);
        assert_eq!(gate.poll(later), Some("two".to_string()));
        gate.turn_settled(later);
        assert_eq!(
            gate.try_send("three", later + Duration::from_secs(2)),
            GateOutcome::Accepted("three".to_string())
        );
    }

    #[test]
    fn failed_send_frees_the_gate_without_cooldown() {
        let now = Instant::now();
        let mut gate = gate();
        gate.try_send("one", now);
        gate.send_failed();
        assert_eq!(
            gate.try_send("two", now),
            GateOutcome::Accepted("two".to_string())
        );
    }
}
