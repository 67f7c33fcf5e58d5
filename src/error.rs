use thiserror::Error;

/// Why a dispatch ended up in method-missing escalation.
///
/// The reason selects the message of the default `NoMethod` error and is
/// visible to a guest `method_missing` handler through
/// [`CallStack::method_missing_reason`](crate::vm::CallStack::method_missing_reason).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum MissingReason {
    Default,
    /// Bare-word lookup (`foo` with no receiver and no arguments).
    VCall,
    /// A super call found no ancestor implementation.
    Super,
    /// A private method was called with an explicit receiver.
    Private,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("wrong number of arguments ({given} for {expected})")]
    Arity { given: usize, expected: String },

    #[error("{0}")]
    Argument(String),

    #[error("{}", no_method_message(.name, .class_name, .reason))]
    NoMethod {
        name: String,
        class_name: String,
        reason: MissingReason,
    },

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    LocalJump(String),

    #[error("native bridge failed: {0}")]
    Bridge(#[from] BridgeError),
}

fn no_method_message(name: &str, class_name: &str, reason: &MissingReason) -> String {
    match reason {
        MissingReason::Default => format!("undefined method `{name}' for {class_name}"),
        MissingReason::VCall => {
            format!("undefined local variable or method `{name}' for {class_name}")
        }
        MissingReason::Super => format!("super: no superclass method `{name}' for {class_name}"),
        MissingReason::Private => format!("private method `{name}' called for {class_name}"),
    }
}

impl DispatchError {
    pub fn arity(given: usize, min: i32, max: i32) -> Self {
        let expected = if max == -1 {
            format!("{min}+")
        } else if min == max {
            min.to_string()
        } else {
            format!("{min}..{max}")
        };
        DispatchError::Arity { given, expected }
    }

    pub fn no_method(name: impl Into<String>, class_name: impl Into<String>, reason: MissingReason) -> Self {
        DispatchError::NoMethod {
            name: name.into(),
            class_name: class_name.into(),
            reason,
        }
    }

    /// True for the `ArgumentError` family.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, DispatchError::Arity { .. } | DispatchError::Argument(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Unable to find library '{0}'")]
    LibraryNotFound(String),
    #[error("Unable to find entry point '{1}' in library '{0}'")]
    SymbolNotFound(String, String),
    #[error("Failed to load library '{0}': {1}")]
    LoadError(String, String),
    #[error("Invalid type signature '{0}': {1}")]
    BadSignature(String, String),
    #[error("signature '{signature}' takes {expected} arguments, called with {given}")]
    ArgumentCount {
        signature: String,
        expected: usize,
        given: usize,
    },
    #[error("can't convert {value} into {target}")]
    Marshal { value: String, target: &'static str },
    #[error("native code returned unknown object handle {0:#x}")]
    UnknownHandle(u64),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_messages() {
        assert_eq!(
            DispatchError::arity(1, 2, 2).to_string(),
            "wrong number of arguments (1 for 2)"
        );
        assert_eq!(
            DispatchError::arity(0, 1, -1).to_string(),
            "wrong number of arguments (0 for 1+)"
        );
        assert_eq!(
            DispatchError::arity(4, 1, 3).to_string(),
            "wrong number of arguments (4 for 1..3)"
        );
    }

    #[test]
    fn test_no_method_reasons() {
        let e = DispatchError::no_method("foo", "Bar", MissingReason::Private);
        assert_eq!(e.to_string(), "private method `foo' called for Bar");
        let e = DispatchError::no_method("foo", "Bar", MissingReason::VCall);
        assert!(e.to_string().starts_with("undefined local variable or method"));
    }
}
