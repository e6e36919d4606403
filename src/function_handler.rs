//! Host-facing trait the VM dispatches `call_external` through.
use crate::error::VmError;
use crate::value::Value;

/// Implemented by the embedding application. The VM never registers or
/// enumerates functions itself (that registry is host-owned); it only calls
/// `invoke` with the resolved external-function name and the popped
/// argument list.
pub trait FunctionHandler {
    fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, VmError>;
}

/// A `FunctionHandler` that rejects every call. Useful as a default for
/// binaries that declare no external functions, and in tests that don't
/// exercise `call_external`.
pub struct NullFunctionHandler;

impl FunctionHandler for NullFunctionHandler {
    fn invoke(&mut self, name: &str, _args: Vec<Value>) -> Result<Value, VmError> {
        Err(VmError::HostFunction(format!(
            "no external function registered for {name}"
        )))
    }
}
