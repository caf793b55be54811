//! Per-call work budget: an item ceiling and a wall-clock ceiling.

use std::time::{Duration, Instant};

use teleport_core::Config;

#[derive(Debug, Clone)]
pub struct Budget {
    started: Instant,
    time_limit: Duration,
    max_items: usize,
    items: usize,
}

impl Budget {
    #[must_use]
    pub fn new(time_limit: Duration, max_items: usize) -> Self {
        Self {
            started: Instant::now(),
            time_limit,
            max_items: max_items.max(1),
            items: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.batch_time_limit, config.batch_max_items)
    }

    /// Record one unit of work.
    pub const fn tick(&mut self) {
        self.items += 1;
    }

    #[must_use]
    pub const fn items(&self) -> usize {
        self.items
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.items >= self.max_items || self.started.elapsed() >= self.time_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_ceiling() {
        let mut budget = Budget::new(Duration::from_secs(60), 2);
        assert!(!budget.exhausted());
        budget.tick();
        assert!(!budget.exhausted());
        budget.tick();
        assert!(budget.exhausted());
        assert_eq!(budget.items(), 2);
    }

    #[test]
    fn time_ceiling() {
        let budget = Budget::new(Duration::ZERO, 100);
        assert!(budget.exhausted());
    }
}
