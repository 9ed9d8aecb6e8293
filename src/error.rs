//! Host-side failures of the execution engine.
//!
//! Guest exceptions (the ones a Java program can catch) are never reported
//! through this type, they live in the thread state as pending exceptions.
//! A `RuntimeError` means the interpreter or the method body it was given is
//! broken and there is no safe way to keep executing.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// `RuntimeError` represents the possible execution failures that can't be
/// turned into a guest exception.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("unknown opcode 0x{opcode:02x} at pc {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("unsupported opcode {mnemonic} at pc {pc}")]
    UnsupportedOpcode { mnemonic: &'static str, pc: usize },
    #[error("code segment exhausted at pc {pc} (length {len})")]
    CodeSegmentExhausted { pc: usize, len: usize },
    #[error("constant pool entry {index} is not a {expected}")]
    InvalidConstant { index: u16, expected: &'static str },
    #[error("local variable {index} out of range (max {max})")]
    LocalOutOfRange { index: usize, max: usize },
    #[error("no active frame")]
    NoActiveFrame,
    #[error("invalid descriptor {0:?}")]
    InvalidDescriptor(String),
    #[error("unresolved method {class}.{name}{descriptor}")]
    UnresolvedMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("unresolved field {class}.{name}")]
    UnresolvedField { class: String, name: String },
    #[error("class {0} is not available to the class library")]
    ClassNotFound(String),
    #[error("dangling heap handle {0}")]
    InvalidHandle(u32),
    #[error("heap exhausted ({capacity} entries)")]
    OutOfMemory { capacity: usize },
    #[error("cannot allocate an array of {length} elements")]
    ArrayAllocation { length: usize },
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl RuntimeError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Failures the guest sees as `OutOfMemoryError`.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::ArrayAllocation { .. })
    }
}
