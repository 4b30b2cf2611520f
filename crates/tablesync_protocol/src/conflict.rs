//! Push failure classification and conflict resolutions.

use crate::operation::OperationAction;
use std::fmt;

/// HTTP status a server answers with when the record version it holds
/// does not match the one the client sent.
pub const HTTP_PRECONDITION_FAILED: u16 = 412;

/// How a failed push of one operation is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Version precondition failed; offered to the conflict handler.
    Conflict,
    /// Anything else (network, auth, server errors); offered to the
    /// error handler.
    Error,
}

impl FailureKind {
    /// Classifies a failure by the HTTP status it carried, if any.
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(HTTP_PRECONDITION_FAILED) => FailureKind::Conflict,
            _ => FailureKind::Error,
        }
    }
}

/// The way a push handler settled a failed operation.
///
/// Recording any resolution marks the failure as handled, which means
/// the engine retries the operation instead of aborting the push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The local record was replaced by a handler-chosen value.
    UpdatedClientRecord,
    /// The local record was removed.
    DeletedClientRecord,
    /// The logged action was changed before retrying.
    ChangedAction(OperationAction),
    /// The operation was dropped from the log without being pushed.
    CancelledPush,
}

impl ConflictResolution {
    /// Returns true if the operation leaves the log as a result.
    pub fn cancels_push(&self) -> bool {
        matches!(self, ConflictResolution::CancelledPush)
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictResolution::UpdatedClientRecord => f.write_str("updated client record"),
            ConflictResolution::DeletedClientRecord => f.write_str("deleted client record"),
            ConflictResolution::ChangedAction(action) => write!(f, "changed action to {action}"),
            ConflictResolution::CancelledPush => f.write_str("cancelled push"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_412_is_a_conflict() {
        assert_eq!(FailureKind::from_status(Some(412)), FailureKind::Conflict);
        assert_eq!(FailureKind::from_status(Some(409)), FailureKind::Error);
        assert_eq!(FailureKind::from_status(Some(500)), FailureKind::Error);
        assert_eq!(FailureKind::from_status(None), FailureKind::Error);
    }

    #[test]
    fn resolution_display() {
        assert_eq!(
            ConflictResolution::ChangedAction(OperationAction::Update).to_string(),
            "changed action to update"
        );
        assert!(ConflictResolution::CancelledPush.cancels_push());
        assert!(!ConflictResolution::DeletedClientRecord.cancels_push());
    }
}
