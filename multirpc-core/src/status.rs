//! Canonical call status, shared by caller and responder sides.

use std::fmt;

/// A gRPC-style status code.
///
/// Only the subset named by the external interface (spec §6) is given a
/// named constant; any other decimal value round-trips through
/// [`Code`] unchanged (e.g. a peer using a code this crate doesn't name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u32);

impl Code {
    pub const OK: Code = Code(0);
    pub const CANCELLED: Code = Code(1);
    pub const UNKNOWN: Code = Code(2);
    pub const INVALID_ARGUMENT: Code = Code(3);
    pub const DEADLINE_EXCEEDED: Code = Code(4);
    pub const RESOURCE_EXHAUSTED: Code = Code(8);
    pub const UNIMPLEMENTED: Code = Code(12);
    pub const INTERNAL: Code = Code(13);
    pub const UNAVAILABLE: Code = Code(14);

    pub fn is_ok(self) -> bool {
        self == Code::OK
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Code::OK => "OK",
            Code::CANCELLED => "CANCELLED",
            Code::UNKNOWN => "UNKNOWN",
            Code::INVALID_ARGUMENT => "INVALID_ARGUMENT",
            Code::DEADLINE_EXCEEDED => "DEADLINE_EXCEEDED",
            Code::RESOURCE_EXHAUSTED => "RESOURCE_EXHAUSTED",
            Code::UNIMPLEMENTED => "UNIMPLEMENTED",
            Code::INTERNAL => "INTERNAL",
            Code::UNAVAILABLE => "UNAVAILABLE",
            _ => return write!(f, "CODE({})", self.0),
        };
        f.write_str(name)
    }
}

/// The trailer's terminal status: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            code: Code::OK,
            message: String::new(),
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status_has_ok_code() {
        assert!(Status::ok().is_ok());
    }

    #[test]
    fn non_ok_status_is_not_ok() {
        let s = Status::new(Code::INTERNAL, "boom");
        assert!(!s.is_ok());
        assert_eq!(s.to_string(), "INTERNAL: boom");
    }

    #[test]
    fn unnamed_code_displays_numerically() {
        assert_eq!(Code(42).to_string(), "CODE(42)");
    }
}
