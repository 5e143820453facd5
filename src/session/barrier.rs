//! Counted-completion barrier for fan-out operations.

use tokio::time::Instant;

/// Tracks which clients an operation is still waiting for.
///
/// Ids settle one by one as the session task observes their status; the
/// barrier is complete when none are pending, or gives up at its deadline.
#[derive(Debug, Clone)]
pub struct Barrier {
    pending: Vec<String>,
    deadline: Option<Instant>,
}

impl Barrier {
    pub fn new(ids: Vec<String>, deadline: Option<Instant>) -> Self {
        Self { pending: ids, deadline }
    }

    /// Settles every pending id for which `is_settled` holds.
    pub fn settle_where(&mut self, mut is_settled: impl FnMut(&str) -> bool) {
        self.pending.retain(|id| !is_settled(id));
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending(&self) -> &[String] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_settles_incrementally() {
        let mut barrier = Barrier::new(ids(&["a", "b", "c"]), None);
        barrier.settle_where(|id| id == "b");
        assert_eq!(barrier.pending(), &ids(&["a", "c"])[..]);
        assert!(!barrier.is_complete());

        barrier.settle_where(|id| id == "a");
        assert_eq!(barrier.pending(), &ids(&["c"])[..]);

        barrier.settle_where(|_| true);
        assert!(barrier.is_complete());
    }

    #[test]
    fn test_empty_barrier_is_complete() {
        assert!(Barrier::new(Vec::new(), None).is_complete());
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let barrier = Barrier::new(ids(&["a"]), Some(now + Duration::from_millis(10)));
        assert!(!barrier.is_expired(now));
        assert!(barrier.is_expired(now + Duration::from_millis(10)));
        assert!(!Barrier::new(ids(&["a"]), None).is_expired(now));
    }
}
