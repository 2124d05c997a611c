//! Per-team concurrency limits.

use std::collections::HashMap;

use crate::kernel::jobs::JobPool;

/// Concurrency limits by team and pool. Teams without an override get the
/// pool default.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimits {
    pub default_limit: usize,
    pub extract_default_limit: usize,
    pub overrides: HashMap<(String, JobPool), usize>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            default_limit: 10,
            extract_default_limit: 5,
            overrides: HashMap::new(),
        }
    }
}

impl ConcurrencyLimits {
    pub fn with_override(mut self, team_id: impl Into<String>, pool: JobPool, limit: usize) -> Self {
        self.overrides.insert((team_id.into(), pool), limit);
        self
    }

    pub fn limit_for(&self, team_id: &str, pool: JobPool) -> usize {
        if let Some(limit) = self.overrides.get(&(team_id.to_string(), pool)) {
            return *limit;
        }
        match pool {
            JobPool::Scrape => self.default_limit,
            JobPool::Extract => self.extract_default_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults_and_overrides() {
        let limits = ConcurrencyLimits::default().with_override("big", JobPool::Scrape, 50);
        assert_eq!(limits.limit_for("small", JobPool::Scrape), 10);
        assert_eq!(limits.limit_for("small", JobPool::Extract), 5);
        assert_eq!(limits.limit_for("big", JobPool::Scrape), 50);
        assert_eq!(limits.limit_for("big", JobPool::Extract), 5);
    }
}
