//! A decoder and stack-machine interpreter for Diannex compiled dialogue
//! binaries (`.dxb` files).
#![allow(dead_code)]

pub mod binary;
pub mod chance;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod function_handler;
pub mod instruction;
pub mod interpolation;
pub mod local_store;
pub mod opcode;
pub mod value;
pub mod vm;

pub use binary::Binary;
pub use decoder::decode;
pub use error::{DecodeError, VmError};
pub use function_handler::{FunctionHandler, NullFunctionHandler};
pub use value::Value;
pub use vm::{Vm, VmOptions};
