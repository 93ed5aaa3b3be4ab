//! Shadow mode: compute and log everything, enact nothing.
//!
//! The override only touches the enacted `arm` and the
//! `shadow_mode_applied` flag. Reason, bounds and `underlying_arm` keep
//! describing what the rule actually chose, so those decisions remain usable
//! as training data.

use crate::bandit::Arm;
use crate::decision::Decision;

/// Force `escalate` when `enabled`; otherwise return the decision unchanged.
pub fn apply_shadow(mut decision: Decision, enabled: bool) -> Decision {
    if enabled {
        if decision.arm == Arm::Automate {
            log::info!(
                "shadow mode: suppressing automate for {} ({})",
                decision.assessment_id,
                decision.reason
            );
        }
        decision.arm = Arm::Escalate;
        decision.shadow_mode_applied = true;
    }
    decision
}
