//! Daily point budget per visitor.
//!
//! On-topic turns are cheap, blocked turns are expensive. Once a visitor's
//! points for the current UTC day reach the limit, further turns are
//! answered with a canned message instead of calling the responder.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{Datelike, Utc};
use dashmap::DashMap;

/// Days since the common era, UTC
pub fn current_day() -> i32 {
    Utc::now().date_naive().num_days_from_ce()
}

#[derive(Debug)]
pub struct PointBudget {
    limit: u32,
    on_topic_cost: u32,
    off_topic_cost: u32,
    exempt: HashSet<String>,
    /// visitor_id -> (day, points spent that day)
    spent: DashMap<String, (i32, u32)>,
    /// Latest day seen by `charge`; entries from earlier days are pruned when it moves
    current: AtomicI32,
}

impl PointBudget {
    pub fn new(limit: u32, on_topic_cost: u32, off_topic_cost: u32, exempt: &[String]) -> Self {
        Self {
            limit,
            on_topic_cost,
            off_topic_cost,
            exempt: exempt.iter().cloned().collect(),
            spent: DashMap::new(),
            current: AtomicI32::new(i32::MIN),
        }
    }

    pub fn is_exhausted(&self, visitor_id: &str, day: i32) -> bool {
        if self.exempt.contains(visitor_id) {
            return false;
        }
        self.spent_on(visitor_id, day) >= self.limit
    }

    /// Charge a finished turn. Returns the points spent today after charging.
    pub fn charge(&self, visitor_id: &str, off_topic: bool, day: i32) -> u32 {
        let cost = if off_topic {
            self.off_topic_cost
        } else {
            self.on_topic_cost
        };
        if self.current.fetch_max(day, Ordering::Relaxed) < day {
            self.spent.retain(|_, (spent_day, _)| *spent_day >= day);
        }
        let mut entry = self.spent.entry(visitor_id.to_string()).or_insert((day, 0));
        if entry.0 != day {
            *entry = (day, 0);
        }
        entry.1 = entry.1.saturating_add(cost);
        entry.1
    }

    pub fn spent_on(&self, visitor_id: &str, day: i32) -> u32 {
        self.spent
            .get(visitor_id)
            .filter(|entry| entry.0 == day)
            .map(|entry| entry.1)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_topic_turns_cost_more() {
        let budget = PointBudget::new(100, 1, 10, &[]);
        assert_eq!(budget.charge("v1", false, 1), 1);
        assert_eq!(budget.charge("v1", true, 1), 11);
        assert_eq!(budget.spent_on("v2", 1), 0);
    }

    #[test]
    fn exhausts_at_limit_and_resets_next_day() {
        let budget = PointBudget::new(20, 1, 10, &[]);
        budget.charge("v1", true, 7);
        assert!(!budget.is_exhausted("v1", 7));
        budget.charge("v1", true, 7);
        assert!(budget.is_exhausted("v1", 7));

        assert!(!budget.is_exhausted("v1", 8));
        assert_eq!(budget.charge("v1", false, 8), 1);
    }

    #[test]
    fn day_rollover_forgets_earlier_days() {
        let budget = PointBudget::new(20, 1, 10, &[]);
        budget.charge("v1", true, 7);
        budget.charge("v2", false, 7);
        assert_eq!(budget.spent.len(), 2);

        budget.charge("v3", false, 8);
        assert_eq!(budget.spent.len(), 1);
        assert_eq!(budget.spent_on("v1", 7), 0);
        assert_eq!(budget.spent_on("v3", 8), 1);
    }

    #[test]
    fn exempt_visitors_never_exhaust() {
        let budget = PointBudget::new(1, 1, 10, &["owner".to_string()]);
        budget.charge("owner", true, 1);
        assert!(!budget.is_exhausted("owner", 1));
    }
}
