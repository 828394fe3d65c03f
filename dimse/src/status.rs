//! DIMSE status codes, as specified in DICOM PS3.7 Annex C.
//!
//! Status codes are returned in response messages to indicate
//! the result of a DIMSE operation.
//! The high nibble indicates the status type.

/// A DIMSE status code.
pub type StatusCode = u16;

/// Operation completed successfully
pub const SUCCESS: StatusCode = 0x0000;

/// Operation pending (more results available)
pub const PENDING: StatusCode = 0xFF00;

/// Pending with optional keys not supported
pub const PENDING_WARNING: StatusCode = 0xFF01;

/// Operation was canceled
pub const CANCEL: StatusCode = 0xFE00;

/// Refused: out of resources
pub const REFUSED_OUT_OF_RESOURCES: StatusCode = 0xA700;

/// Refused: out of resources, unable to calculate number of matches
pub const REFUSED_OUT_OF_RESOURCES_MATCHES: StatusCode = 0xA701;

/// Refused: out of resources, unable to perform sub-operations
pub const REFUSED_OUT_OF_RESOURCES_SUBOPS: StatusCode = 0xA702;

/// Refused: move destination unknown
pub const REFUSED_MOVE_DESTINATION_UNKNOWN: StatusCode = 0xA801;

/// Refused: SOP class not supported
pub const REFUSED_SOP_CLASS_NOT_SUPPORTED: StatusCode = 0x0122;

/// Error: data set does not match SOP class
pub const ERROR_DATASET_MISMATCH: StatusCode = 0xA900;

/// Error: cannot understand
pub const ERROR_CANNOT_UNDERSTAND: StatusCode = 0xC000;

/// Error: unable to process
pub const ERROR_UNABLE_TO_PROCESS: StatusCode = 0xC001;

/// Error: duplicate SOP instance
pub const ERROR_DUPLICATE_SOP_INSTANCE: StatusCode = 0x0111;

/// Error: missing attribute
pub const ERROR_MISSING_ATTRIBUTE: StatusCode = 0x0120;

/// Error: missing attribute value
pub const ERROR_MISSING_ATTRIBUTE_VALUE: StatusCode = 0x0121;

/// Error: invalid attribute value
pub const ERROR_INVALID_ATTRIBUTE_VALUE: StatusCode = 0x0106;

/// Warning: sub-operations complete, one or more failures
pub const WARNING_SUBOPS_COMPLETE_FAILURES: StatusCode = 0xB000;

/// Whether the status indicates success.
pub fn is_success(status: StatusCode) -> bool {
    status == SUCCESS
}

/// Whether the status indicates that more results are pending.
pub fn is_pending(status: StatusCode) -> bool {
    status == PENDING || status == PENDING_WARNING
}

/// Whether the status indicates cancellation.
pub fn is_cancel(status: StatusCode) -> bool {
    status == CANCEL
}

/// Whether the status indicates a warning.
pub fn is_warning(status: StatusCode) -> bool {
    status & 0xF000 == 0xB000
}

/// Whether the status indicates a failure.
///
/// Failure statuses start with 0xA or 0xC in the high nibble,
/// or fall in the 0x01xx range.
pub fn is_failure(status: StatusCode) -> bool {
    let high_nibble = (status & 0xF000) >> 12;
    high_nibble == 0xA || high_nibble == 0xC || (0x0100..=0x01FF).contains(&status)
}

/// Whether this is a final status (the operation is complete).
pub fn is_final(status: StatusCode) -> bool {
    !is_pending(status)
}

/// A human readable category name for the status.
pub fn category(status: StatusCode) -> &'static str {
    if is_success(status) {
        "Success"
    } else if is_pending(status) {
        "Pending"
    } else if is_cancel(status) {
        "Cancel"
    } else if is_warning(status) {
        "Warning"
    } else if is_failure(status) {
        "Failure"
    } else {
        "Unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(category(SUCCESS), "Success");
        assert_eq!(category(PENDING), "Pending");
        assert_eq!(category(PENDING_WARNING), "Pending");
        assert_eq!(category(CANCEL), "Cancel");
        assert_eq!(category(WARNING_SUBOPS_COMPLETE_FAILURES), "Warning");
        assert_eq!(category(REFUSED_OUT_OF_RESOURCES), "Failure");
        assert_eq!(category(ERROR_CANNOT_UNDERSTAND), "Failure");
        assert_eq!(category(ERROR_DUPLICATE_SOP_INSTANCE), "Failure");
    }

    #[test]
    fn pending_is_not_final() {
        assert!(!is_final(PENDING));
        assert!(is_final(SUCCESS));
        assert!(is_final(CANCEL));
        assert!(is_final(ERROR_UNABLE_TO_PROCESS));
    }
}
