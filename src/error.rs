// File: src/error.rs
//
// Structured error reporting for the Leonie execution core. Mirrors the
// teacher's split between a machine-checkable `kind` and a human-readable
// message, without the source-snippet pretty-printing a language front end
// would add — that concerns the compiler/parser this crate doesn't include.

use colored::Colorize;
use std::fmt;

/// The kinds of failure the execution core can raise. Every opcode failure
/// is surfaced identically: write to `ctx.err` and clear `keepRunning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    /// The opcode id at `current` exceeds the dispatch table.
    UnknownInstruction,
    /// A value couldn't be coerced to a number.
    CantMakeNumber,
    /// A value couldn't be coerced to a boolean.
    CantMakeBoolean,
    /// `Pop`, or a pop-after-branch, would cross `stack_base`.
    StackUnderflow,
    /// A push would exceed the value stack's fixed capacity.
    StackOverflow,
    /// A `return` (or its equivalent) was executed with no call-stack frame.
    CallStackUnderflow,
    /// A script's `(owner_id, owner_seed)` no longer matches its owner.
    DanglingOwner,
    /// A relative jump target falls outside the handler's instruction array.
    JumpOutOfRange,
}

impl fmt::Display for VmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VmErrorKind::UnknownInstruction => "Unknown Instruction",
            VmErrorKind::CantMakeNumber => "Can't Make Number",
            VmErrorKind::CantMakeBoolean => "Can't Make Boolean",
            VmErrorKind::StackUnderflow => "Stack Underflow",
            VmErrorKind::StackOverflow => "Stack Overflow",
            VmErrorKind::CallStackUnderflow => "Call Stack Underflow",
            VmErrorKind::DanglingOwner => "Dangling Owner",
            VmErrorKind::JumpOutOfRange => "Jump Out Of Range",
        };
        write!(f, "{}", text)
    }
}

/// A structured execution error: what went wrong, and a human-readable
/// message. There is no local recovery and no exception propagation —
/// `ctx.err` holds at most one of these at a time.
#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub message: String,
}

impl VmError {
    pub fn new(kind: VmErrorKind, message: impl Into<String>) -> Self {
        VmError { kind, message: message.into() }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.to_string().red().bold(), self.message)
    }
}

impl std::error::Error for VmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = VmError::new(VmErrorKind::UnknownInstruction, "Unknown instruction 9999");
        let rendered = format!("{}", err);
        assert!(rendered.contains("Unknown instruction 9999"));
    }
}
