//! Child supervision decision table
//!
//! Children of a connection (consumers, the publisher, the tunnel) report
//! failures to the owning state machine, which asks [`decide`] what to do:
//!
//! | child   | error                                  | directive  |
//! |---------|----------------------------------------|------------|
//! | tunnel  | any                                    | `Restart`  |
//! | other   | internal bug, known domain error       | `Resume`   |
//! | other   | fatal infrastructure, unknown          | `Escalate` |
//!
//! `Escalate` turns into a connection failure and goes through the backoff
//! routing like any other failure.

use crate::core::errors::{ConnectionError, FailureKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

/// Supervised collaborator of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    Consumer,
    Publisher,
    Tunnel,
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Consumer => "consumer",
            Self::Publisher => "publisher",
            Self::Tunnel => "tunnel",
        };
        f.write_str(s)
    }
}

/// What the owner does about a failed child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorDirective {
    /// Keep the child running, state untouched
    Resume,
    /// Start the child again in place
    Restart,
    /// Fail the whole connection
    Escalate,
}

/// Classify a child failure
pub fn decide(child: ChildKind, err: &ConnectionError) -> SupervisorDirective {
    if child == ChildKind::Tunnel {
        warn!(child = %child, error = %err, "Restarting tunnel after failure");
        return SupervisorDirective::Restart;
    }

    match err.kind() {
        FailureKind::InternalBug => {
            error!(child = %child, error = %err, "Internal error in child, resuming");
            SupervisorDirective::Resume
        }
        FailureKind::Configuration | FailureKind::Transient | FailureKind::Timeout => {
            warn!(child = %child, error = %err, "Child reported a domain error, resuming");
            SupervisorDirective::Resume
        }
        FailureKind::FatalInfrastructure | FailureKind::Unknown => {
            error!(child = %child, error = %err, "Escalating child failure to connection");
            SupervisorDirective::Escalate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tunnel_is_always_restarted() {
        for err in [
            ConnectionError::Transient("ssh reset".into()),
            ConnectionError::FatalInfrastructure("bus down".into()),
            ConnectionError::Unknown("?".into()),
        ] {
            assert_eq!(decide(ChildKind::Tunnel, &err), SupervisorDirective::Restart);
        }
    }

    #[test]
    fn test_known_errors_resume() {
        let errors = [
            ConnectionError::InternalBug("missing aggregator header".into()),
            ConnectionError::Configuration("bad topic".into()),
            ConnectionError::Transient("nack".into()),
            ConnectionError::timeout("publish", Duration::from_secs(1)),
        ];
        for err in &errors {
            assert_eq!(decide(ChildKind::Consumer, err), SupervisorDirective::Resume);
            assert_eq!(decide(ChildKind::Publisher, err), SupervisorDirective::Resume);
        }
    }

    #[test]
    fn test_fatal_and_unknown_escalate() {
        assert_eq!(
            decide(
                ChildKind::Publisher,
                &ConnectionError::FatalInfrastructure("cluster unreachable".into())
            ),
            SupervisorDirective::Escalate
        );
        assert_eq!(
            decide(ChildKind::Consumer, &ConnectionError::Unknown("boom".into())),
            SupervisorDirective::Escalate
        );
    }
}
