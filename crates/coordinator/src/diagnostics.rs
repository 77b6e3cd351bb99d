//! Operator-visible bootstrap diagnostics

use serde::Serialize;

use crate::error::{Error, ErrorKind};
use crate::state::ReconcilerState;

/// Snapshot of what the reconciler last saw.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapDiagnostics {
    /// Reconciler phase
    pub state: ReconcilerState,
    /// Configured expected cluster size
    pub expected: u32,
    /// Servers that agree with us, self included
    pub candidates_seen: usize,
    /// Local-region servers declaring a different expected size
    pub mismatched_expect: usize,
    /// Groups of those servers large enough to bootstrap on their own
    pub competing_groups: usize,
    /// Members whose tags do not parse
    pub inconsistent_tags: usize,
    /// Local-region servers on another protocol version
    pub incompatible_version: usize,
    /// Bootstrap write failures so far
    pub write_failures: u32,
    /// Number of evaluations run
    pub evaluations: u64,
    /// Most recent bootstrap failure, if any
    pub last_error: Option<String>,
}

impl BootstrapDiagnostics {
    /// The liveness condition where bootstrap cannot proceed because peers
    /// disagree on the expected cluster size: either too few agree, or
    /// another group could bootstrap separately.
    pub fn stall(&self) -> Option<Error> {
        if self.state == ReconcilerState::Bootstrapped
            || self.expected == 0
            || self.mismatched_expect == 0
        {
            return None;
        }

        if self.competing_groups > 0 {
            Some(Error::with_context(
                ErrorKind::ConfigMismatchStall,
                format!(
                    "{} group(s) declaring a different expected count could bootstrap separately; \
                     {} servers disagree with expect {}",
                    self.competing_groups, self.mismatched_expect, self.expected
                ),
            ))
        } else if self.candidates_seen < self.expected as usize {
            Some(Error::with_context(
                ErrorKind::ConfigMismatchStall,
                format!(
                    "{} of {} expected servers agree; {} declare a different expected count",
                    self.candidates_seen, self.expected, self.mismatched_expect
                ),
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_requires_mismatch_and_shortfall() {
        let mut diag = BootstrapDiagnostics {
            expected: 2,
            candidates_seen: 1,
            ..BootstrapDiagnostics::default()
        };
        assert!(diag.stall().is_none());

        diag.mismatched_expect = 1;
        let stall = diag.stall().unwrap();
        assert_eq!(stall.kind(), ErrorKind::ConfigMismatchStall);

        diag.state = ReconcilerState::Bootstrapped;
        assert!(diag.stall().is_none());
    }

    #[test]
    fn competing_group_stalls_even_at_threshold() {
        let mut diag = BootstrapDiagnostics {
            expected: 2,
            candidates_seen: 2,
            mismatched_expect: 3,
            ..BootstrapDiagnostics::default()
        };
        assert!(diag.stall().is_none());

        diag.competing_groups = 1;
        let stall = diag.stall().unwrap();
        assert_eq!(stall.kind(), ErrorKind::ConfigMismatchStall);
        assert!(stall.to_string().contains("could bootstrap separately"));
    }
}
