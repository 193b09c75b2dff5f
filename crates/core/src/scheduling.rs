//! Job scheduling state machine.
//!
//! Lives in `core` so the engine, the HTTP layer, and tests agree on which
//! status changes are legal.

pub mod state_machine {
    use crate::job::JobStatus;

    /// Returns the set of statuses reachable from `from`.
    ///
    /// `Failed` is listed with outgoing edges because a failed job waiting on
    /// retry backoff can still be re-enqueued, canceled, or expire. Once its
    /// retries are exhausted no caller attempts those edges.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        use JobStatus::*;
        match from {
            // Enqueued -> Running (dispatch), Expired (deadline or stale), Canceled
            Enqueued => &[Running, Expired, Canceled],
            // Running -> Succeeded, Failed (handler error or shutdown), Canceled (cooperative)
            Running => &[Succeeded, Failed, Canceled],
            // Failed (retry pending) -> Enqueued (re-admitted), Canceled, Expired
            Failed => &[Enqueued, Canceled, Expired],
            // Absorbing states
            Succeeded | Expired | Canceled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use crate::job::JobStatus::*;

    // -----------------------------------------------------------------------
    // Valid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn enqueued_to_running() {
        assert!(can_transition(Enqueued, Running));
    }

    #[test]
    fn enqueued_to_expired() {
        assert!(can_transition(Enqueued, Expired));
    }

    #[test]
    fn enqueued_to_canceled() {
        assert!(can_transition(Enqueued, Canceled));
    }

    #[test]
    fn running_to_succeeded() {
        assert!(can_transition(Running, Succeeded));
    }

    #[test]
    fn running_to_failed() {
        assert!(can_transition(Running, Failed));
    }

    #[test]
    fn running_to_canceled() {
        assert!(can_transition(Running, Canceled));
    }

    #[test]
    fn failed_to_enqueued_for_retry() {
        assert!(can_transition(Failed, Enqueued));
    }

    // -----------------------------------------------------------------------
    // Absorbing states have no outgoing transitions
    // -----------------------------------------------------------------------

    #[test]
    fn succeeded_has_no_transitions() {
        assert!(valid_transitions(Succeeded).is_empty());
    }

    #[test]
    fn expired_has_no_transitions() {
        assert!(valid_transitions(Expired).is_empty());
    }

    #[test]
    fn canceled_has_no_transitions() {
        assert!(valid_transitions(Canceled).is_empty());
    }

    // -----------------------------------------------------------------------
    // Invalid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn enqueued_to_succeeded_invalid() {
        assert!(!can_transition(Enqueued, Succeeded));
    }

    #[test]
    fn running_to_enqueued_invalid() {
        assert!(!can_transition(Running, Enqueued));
    }

    #[test]
    fn canceled_to_running_invalid() {
        assert!(!can_transition(Canceled, Running));
    }

    #[test]
    fn validate_transition_err() {
        let err = validate_transition(Succeeded, Running).unwrap_err();
        assert!(err.contains("succeeded"));
        assert!(err.contains("running"));
    }

    #[test]
    fn validate_transition_ok() {
        assert!(validate_transition(Enqueued, Running).is_ok());
    }
}
