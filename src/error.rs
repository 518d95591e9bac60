//! Backend error types.
//!
//! Fixup-time failures are collected across the whole resolution sweep so a
//! single build reports every unresolved reference, not just the first.

use thiserror::Error;

/// Errors produced by the native backend
#[derive(Error, Debug)]
pub enum BackendError {
    /// A fixup's target was never defined and is not a registered
    /// statically-linked symbol. The placeholder bytes are left zeroed.
    #[error("unresolved label `{label}` referenced at code offset {offset:#x}")]
    UnresolvedLabel { label: String, offset: usize },

    /// A resolved displacement does not fit the instruction's field.
    #[error("{kind} displacement out of range at code offset {offset:#x}: {value}")]
    OutOfRange {
        kind: &'static str,
        offset: usize,
        value: i64,
    },

    /// A float width conversion the encoder does not implement.
    #[error("unsupported float conversion: {from} -> {to}")]
    UnsupportedConversion { from: &'static str, to: &'static str },

    /// Register id or immediate outside the representable range.
    /// A defect in the calling code generator, not a user-facing condition.
    #[error("invalid operand: {message}")]
    InvalidOperand { message: String },

    /// One or more fixups failed during `fixup_all`; carries every failure.
    #[error("{} fixup(s) failed to resolve", .errors.len())]
    FixupFailed { errors: Vec<BackendError> },
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_unresolved() {
        let err = BackendError::UnresolvedLabel {
            label: "loop.head".to_string(),
            offset: 0x40,
        };
        assert_eq!(
            err.to_string(),
            "unresolved label `loop.head` referenced at code offset 0x40"
        );
    }

    #[test]
    fn test_display_fixup_failed() {
        let err = BackendError::FixupFailed {
            errors: vec![
                BackendError::UnresolvedLabel {
                    label: "a".to_string(),
                    offset: 0,
                },
                BackendError::UnresolvedLabel {
                    label: "b".to_string(),
                    offset: 4,
                },
            ],
        };
        assert_eq!(err.to_string(), "2 fixup(s) failed to resolve");
    }
}
