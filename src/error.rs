//! Error types for container decoding and VM execution.
use std::fmt;

/// Errors raised while parsing a DXB container into a [`crate::binary::Binary`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The leading 3 bytes were not `"DNX"`.
    InvalidSignature,
    /// The version byte was not 3 (or 4, which is partially supported).
    UnsupportedVersion(u8),
    /// A read ran past the end of the buffer. Carries the section name for context.
    Truncated(&'static str),
    /// The zlib payload failed to inflate.
    DecompressionFailure(String),
    /// A symbol/reference index pointed outside its table.
    IndexOutOfBounds {
        table: &'static str,
        index: u32,
        len: usize,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidSignature => write!(f, "invalid DXB signature"),
            DecodeError::UnsupportedVersion(v) => {
                write!(f, "binary not for this version (found version {v})")
            }
            DecodeError::Truncated(section) => {
                write!(f, "truncated buffer while reading {section}")
            }
            DecodeError::DecompressionFailure(msg) => {
                write!(f, "decompression failure: {msg}")
            }
            DecodeError::IndexOutOfBounds { table, index, len } => write!(
                f,
                "index {index} out of bounds for {table} (len {len})"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised during VM execution.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// `run_scene` was called with a name absent from the binary's scene table.
    SceneNotFound(String),
    /// `call`/`call_external` referenced a function name absent from the binary.
    FunctionNotFound(String),
    /// `get_definition` referenced a symbol absent from the definitions table.
    DefinitionNotFound(String),
    /// A symbol index did not resolve to a string in `string_table`.
    StringNotFound(u32),
    /// The operand stack was popped while empty.
    StackUnderflow,
    /// An instruction referenced a call frame but none was active.
    NoActiveFrame,
    /// `choice_begin` was executed while already inside a choice.
    ChoiceAlreadyActive,
    /// A choice opcode executed outside of an active choice.
    NoActiveChoice,
    /// `choice_select` executed with no accumulated choices.
    EmptyChoiceSet,
    /// `choose_choice` received an index beyond `choices.len()`.
    ChoiceIndexOutOfRange { index: usize, len: usize },
    /// The weighted-chance callback returned an index outside `choose_options`.
    ChooseIndexOutOfRange { index: i64, len: usize },
    /// The instruction pointer left the bounds of the instruction stream.
    InstructionPointerOutOfBounds(i32),
    /// An unrecognized opcode byte was encountered.
    UnknownOpcode(u8),
    /// Strict-arithmetic mode rejected a type mismatch (see `VmOptions::strict_arithmetic`).
    TypeMismatch { op: &'static str },
    /// Propagated verbatim from the host's `FunctionHandler::invoke`.
    HostFunction(String),
    /// A flag-initializer or definition sub-program attempted a host pause
    /// (`text_run` or `choice_select`) instead of terminating in `exit`.
    DefinitionSideEffect,
    /// I/O failure loading a translation file.
    Io(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::SceneNotFound(name) => write!(f, "scene not found: {name}"),
            VmError::FunctionNotFound(name) => write!(f, "function not found: {name}"),
            VmError::DefinitionNotFound(name) => write!(f, "definition not found: {name}"),
            VmError::StringNotFound(idx) => write!(f, "string index {idx} not found"),
            VmError::StackUnderflow => write!(f, "operand stack underflow"),
            VmError::NoActiveFrame => write!(f, "no active call frame"),
            VmError::ChoiceAlreadyActive => write!(f, "choice_begin while already in a choice"),
            VmError::NoActiveChoice => write!(f, "choice opcode outside an active choice"),
            VmError::EmptyChoiceSet => write!(f, "choice_select with no accumulated choices"),
            VmError::ChoiceIndexOutOfRange { index, len } => write!(
                f,
                "choose_choice index {index} out of range (have {len} choices)"
            ),
            VmError::ChooseIndexOutOfRange { index, len } => write!(
                f,
                "weighted chance callback returned {index}, out of range for {len} options"
            ),
            VmError::InstructionPointerOutOfBounds(ip) => {
                write!(f, "instruction pointer {ip} out of bounds")
            }
            VmError::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02x}"),
            VmError::TypeMismatch { op } => write!(f, "type mismatch in strict mode for {op}"),
            VmError::HostFunction(msg) => write!(f, "external function error: {msg}"),
            VmError::DefinitionSideEffect => write!(
                f,
                "sub-program attempted text_run or choice_select instead of exiting"
            ),
            VmError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for VmError {}
