//! Token-bucket budget bookkeeping.
//!
//! The kernel sampler enforces one budget at a time; user space tracks both
//! arms plus the hard-drop window and decides, per update, whether the
//! kernel needs reprogramming. Raising the sentinel budget without touching
//! the diagnostic arm lifts diagnostic to at least sentinel, so promotion
//! can never reduce the sampling rate.

use super::AgentMode;

/// Partial budget update from the control plane; absent fields are left
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketUpdateRequest {
    pub sentinel_budget: Option<u64>,
    pub diagnostic_budget: Option<u64>,
    pub hard_drop_ns: Option<u64>,
}

/// Both budget arms plus the hard inter-sample drop window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketState {
    pub sentinel_budget: u64,
    pub diagnostic_budget: u64,
    pub hard_drop_ns: u64,
}

impl BucketState {
    pub fn active_budget(&self, mode: AgentMode) -> u64 {
        match mode {
            AgentMode::Sentinel => self.sentinel_budget,
            AgentMode::Diagnostic => self.diagnostic_budget,
        }
    }
}

/// What an update changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketUpdateOutcome {
    /// The active arm's budget or the hard-drop window changed, so the
    /// kernel token bucket must be reprogrammed.
    pub reprogram_required: bool,
    pub active_budget: u64,
}

/// Merge a partial update into the state under the current mode.
pub fn apply_bucket_update(
    req: &BucketUpdateRequest,
    mode: AgentMode,
    state: &mut BucketState,
) -> BucketUpdateOutcome {
    let mut sentinel_changed = false;
    let mut diagnostic_changed = false;
    let mut drop_changed = false;

    if let Some(budget) = req.sentinel_budget {
        if budget > 0 {
            state.sentinel_budget = budget;
            sentinel_changed = true;
        }
    }

    let mut diag_auto_lifted = false;
    match req.diagnostic_budget {
        Some(budget) if budget > 0 => {
            state.diagnostic_budget = budget;
            diagnostic_changed = true;
        }
        _ => {
            if sentinel_changed && state.diagnostic_budget < state.sentinel_budget {
                state.diagnostic_budget = state.sentinel_budget;
                diag_auto_lifted = true;
            }
        }
    }

    if let Some(ns) = req.hard_drop_ns {
        if ns > 0 {
            state.hard_drop_ns = ns;
            drop_changed = true;
        }
    }

    let active_budget_changed = match mode {
        AgentMode::Sentinel => sentinel_changed,
        AgentMode::Diagnostic => diagnostic_changed || diag_auto_lifted,
    };

    BucketUpdateOutcome {
        reprogram_required: drop_changed || active_budget_changed,
        active_budget: state.active_budget(mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial() -> BucketState {
        BucketState {
            sentinel_budget: 1000,
            diagnostic_budget: 4000,
            hard_drop_ns: 8000,
        }
    }

    #[test]
    fn test_sentinel_update_under_sentinel() {
        let mut state = initial();
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                sentinel_budget: Some(1500),
                ..Default::default()
            },
            AgentMode::Sentinel,
            &mut state,
        );
        assert!(outcome.reprogram_required);
        assert_eq!(outcome.active_budget, 1500);
        assert_eq!(state.diagnostic_budget, 4000);
    }

    #[test]
    fn test_diagnostic_update_under_sentinel_needs_no_reprogram() {
        let mut state = initial();
        state.sentinel_budget = 1500;
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                diagnostic_budget: Some(6000),
                ..Default::default()
            },
            AgentMode::Sentinel,
            &mut state,
        );
        assert!(!outcome.reprogram_required);
        assert_eq!(outcome.active_budget, 1500);
        assert_eq!(state.diagnostic_budget, 6000);
    }

    #[test]
    fn test_diagnostic_update_under_diagnostic() {
        let mut state = initial();
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                diagnostic_budget: Some(6000),
                ..Default::default()
            },
            AgentMode::Diagnostic,
            &mut state,
        );
        assert!(outcome.reprogram_required);
        assert_eq!(outcome.active_budget, 6000);
    }

    #[test]
    fn test_hard_drop_update_always_reprograms() {
        let mut state = initial();
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                hard_drop_ns: Some(2000),
                ..Default::default()
            },
            AgentMode::Sentinel,
            &mut state,
        );
        assert!(outcome.reprogram_required);
        assert_eq!(state.hard_drop_ns, 2000);
    }

    #[test]
    fn test_sentinel_raise_lifts_diagnostic() {
        let mut state = initial();
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                sentinel_budget: Some(9000),
                ..Default::default()
            },
            AgentMode::Sentinel,
            &mut state,
        );
        assert!(outcome.reprogram_required);
        assert_eq!(state.diagnostic_budget, 9000);
        assert!(state.diagnostic_budget >= state.sentinel_budget);
    }

    #[test]
    fn test_auto_lift_reprograms_under_diagnostic() {
        let mut state = initial();
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                sentinel_budget: Some(9000),
                ..Default::default()
            },
            AgentMode::Diagnostic,
            &mut state,
        );
        assert!(outcome.reprogram_required);
        assert_eq!(outcome.active_budget, 9000);
    }

    #[test]
    fn test_zero_fields_ignored() {
        let mut state = initial();
        let outcome = apply_bucket_update(
            &BucketUpdateRequest {
                sentinel_budget: Some(0),
                diagnostic_budget: Some(0),
                hard_drop_ns: Some(0),
            },
            AgentMode::Sentinel,
            &mut state,
        );
        assert!(!outcome.reprogram_required);
        assert_eq!(state, initial());
    }

    #[test]
    fn test_invariant_diag_at_least_sentinel_after_sentinel_only_updates() {
        let mut state = initial();
        for budget in [1500u64, 4500, 2000, 10_000] {
            apply_bucket_update(
                &BucketUpdateRequest {
                    sentinel_budget: Some(budget),
                    ..Default::default()
                },
                AgentMode::Sentinel,
                &mut state,
            );
            assert!(state.diagnostic_budget >= state.sentinel_budget);
        }
    }
}
