//! Cooperative cancellation for in-flight DIMSE operations.
//!
//! A C-CANCEL-RQ flips the flag for its (session, message id) pair;
//! long-running handlers check the flag at safe points:
//! before emitting each C-FIND pending response
//! and before each C-MOVE sub-operation.
//! A cancelled operation completes with the Cancel status
//! rather than failing.

use std::collections::HashSet;
use std::sync::Mutex;

/// The per-(session, message id) cancel flags.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    flags: Mutex<HashSet<(u64, u16)>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry::default()
    }

    /// Request cancellation of one operation.
    pub fn cancel(&self, session_id: u64, message_id: u16) {
        self.flags
            .lock()
            .expect("cancel registry lock poisoned")
            .insert((session_id, message_id));
    }

    /// Whether the operation was asked to stop.
    pub fn is_cancelled(&self, session_id: u64, message_id: u16) -> bool {
        self.flags
            .lock()
            .expect("cancel registry lock poisoned")
            .contains(&(session_id, message_id))
    }

    /// Drop the flag once the operation has acknowledged it.
    pub fn clear(&self, session_id: u64, message_id: u16) {
        self.flags
            .lock()
            .expect("cancel registry lock poisoned")
            .remove(&(session_id, message_id));
    }

    /// Drop every flag of a session, e.g. when it closes.
    pub fn clear_session(&self, session_id: u64) {
        self.flags
            .lock()
            .expect("cancel registry lock poisoned")
            .retain(|(session, _)| *session != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_set_check_clear() {
        let registry = CancelRegistry::new();
        assert!(!registry.is_cancelled(1, 10));

        registry.cancel(1, 10);
        assert!(registry.is_cancelled(1, 10));
        assert!(!registry.is_cancelled(1, 11));
        assert!(!registry.is_cancelled(2, 10));

        registry.clear(1, 10);
        assert!(!registry.is_cancelled(1, 10));
    }

    #[test]
    fn clear_session_drops_all_of_it() {
        let registry = CancelRegistry::new();
        registry.cancel(1, 10);
        registry.cancel(1, 11);
        registry.cancel(2, 10);

        registry.clear_session(1);
        assert!(!registry.is_cancelled(1, 10));
        assert!(!registry.is_cancelled(1, 11));
        assert!(registry.is_cancelled(2, 10));
    }
}
