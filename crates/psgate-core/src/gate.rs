use tracing::warn;

use crate::config::ConfigSnapshot;
use crate::types::{SecurityAssessment, Tier};

/// Flags supplied by the caller on a tool invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerFlags {
    pub confirmed: bool,
    pub override_requested: bool,
    /// True only when the session authenticated with the operator key.
    pub operator_authenticated: bool,
}

/// Gate verdict for one command.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Proceed,
    Reject(GateRejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    Blocked { category: String, reason: String },
    ConfirmationRequired { level: Tier, reason: String },
}

/// Decide execute / require-confirm / block from an assessment plus
/// caller flags.
///
/// `override` only lifts a block when operator override is enabled in
/// config AND the session is operator-authenticated; any other use of
/// the flag is logged and has no effect.
pub fn decide(
    assessment: &SecurityAssessment,
    flags: CallerFlags,
    snapshot: &ConfigSnapshot,
) -> GateDecision {
    if assessment.blocked {
        if flags.override_requested {
            if snapshot.security.allow_operator_override && flags.operator_authenticated {
                warn!(
                    category = %assessment.category,
                    "Operator override accepted for blocked command"
                );
                return GateDecision::Proceed;
            }
            warn!(
                category = %assessment.category,
                authenticated = flags.operator_authenticated,
                "Override requested but not authorized; ignoring"
            );
        }
        return GateDecision::Reject(GateRejection::Blocked {
            category: assessment.category.clone(),
            reason: assessment.reason.clone(),
        });
    }

    if assessment.requires_confirmation && !flags.confirmed {
        return GateDecision::Reject(GateRejection::ConfirmationRequired {
            level: assessment.level,
            reason: assessment.reason.clone(),
        });
    }

    GateDecision::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigSnapshot, EnvOverrides};

    fn snapshot(allow_override: bool) -> ConfigSnapshot {
        let mut config = AppConfig::default();
        config.security.allow_operator_override = allow_override;
        ConfigSnapshot::build(&config, EnvOverrides::default(), 1).unwrap()
    }

    fn blocked_assessment() -> SecurityAssessment {
        SecurityAssessment::new(Tier::Critical, "VCS_DESTRUCTIVE", "force push")
    }

    #[test]
    fn safe_proceeds() {
        let a = SecurityAssessment::new(Tier::Safe, "READ_ONLY", "get");
        assert_eq!(
            decide(&a, CallerFlags::default(), &snapshot(false)),
            GateDecision::Proceed
        );
    }

    #[test]
    fn blocked_rejects() {
        let d = decide(&blocked_assessment(), CallerFlags::default(), &snapshot(false));
        assert!(matches!(d, GateDecision::Reject(GateRejection::Blocked { .. })));
    }

    #[test]
    fn risky_needs_confirmation() {
        let a = SecurityAssessment::new(Tier::Risky, "FS_DELETE", "remove");
        let d = decide(&a, CallerFlags::default(), &snapshot(false));
        assert!(matches!(
            d,
            GateDecision::Reject(GateRejection::ConfirmationRequired { level: Tier::Risky, .. })
        ));
    }

    #[test]
    fn confirmed_risky_proceeds() {
        let a = SecurityAssessment::new(Tier::Risky, "FS_DELETE", "remove");
        let flags = CallerFlags { confirmed: true, ..Default::default() };
        assert_eq!(decide(&a, flags, &snapshot(false)), GateDecision::Proceed);
    }

    #[test]
    fn confirmation_does_not_unblock() {
        let flags = CallerFlags { confirmed: true, ..Default::default() };
        let d = decide(&blocked_assessment(), flags, &snapshot(false));
        assert!(matches!(d, GateDecision::Reject(GateRejection::Blocked { .. })));
    }

    #[test]
    fn override_ignored_by_default() {
        let flags = CallerFlags {
            override_requested: true,
            operator_authenticated: true,
            ..Default::default()
        };
        let d = decide(&blocked_assessment(), flags, &snapshot(false));
        assert!(matches!(d, GateDecision::Reject(GateRejection::Blocked { .. })));
    }

    #[test]
    fn override_requires_authentication() {
        let flags = CallerFlags {
            override_requested: true,
            operator_authenticated: false,
            ..Default::default()
        };
        let d = decide(&blocked_assessment(), flags, &snapshot(true));
        assert!(matches!(d, GateDecision::Reject(GateRejection::Blocked { .. })));
    }

    #[test]
    fn authorized_override_proceeds() {
        let flags = CallerFlags {
            override_requested: true,
            operator_authenticated: true,
            ..Default::default()
        };
        assert_eq!(decide(&blocked_assessment(), flags, &snapshot(true)), GateDecision::Proceed);
    }
}
