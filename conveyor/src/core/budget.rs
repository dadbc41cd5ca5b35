//! Cost accounting for one pipeline run.

/// Running total of agent spend checked against an optional ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBudget {
    limit_usd: Option<f64>,
    spent_usd: f64,
}

impl CostBudget {
    pub fn new(limit_usd: Option<f64>) -> Self {
        Self {
            limit_usd,
            spent_usd: 0.0,
        }
    }

    /// Add one invocation's cost. Negative or NaN costs are ignored so the
    /// total never decreases.
    pub fn charge(&mut self, cost_usd: f64) {
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.spent_usd += cost_usd;
        }
    }

    pub fn spent(&self) -> f64 {
        self.spent_usd
    }

    pub fn limit(&self) -> Option<f64> {
        self.limit_usd
    }

    /// Strictly greater than the limit; spending exactly the limit is allowed.
    pub fn exceeded(&self) -> bool {
        self.limit_usd.is_some_and(|limit| self.spent_usd > limit)
    }
}
