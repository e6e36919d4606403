//! Per-frame local variable storage, with an overlay aliasing certain
//! indices to named global "flags".
use indexmap::IndexMap;

use crate::value::Value;

/// Dense local-variable storage for one call frame.
///
/// Chosen as a dense `Vec<Value>` with explicit length rather than a sparse
/// map: a map keyed by index develops gaps on deletion that silently
/// misalign subsequent appends.
///
/// `flag_map` records, per local index, the name of the global flag that
/// index aliases (populated by the call convention's flag-initializer
/// step). Reads/writes to an aliased index pass through the VM's `flags`
/// table instead of the local slot — callers provide that table explicitly
/// rather than `LocalStore` holding a back-reference to the VM, avoiding an
/// ownership cycle.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    values: Vec<Value>,
    flag_map: IndexMap<usize, String>,
}

impl LocalStore {
    pub fn new() -> Self {
        LocalStore::default()
    }

    /// Seeds the store with positional call arguments (locals 0..argc-1).
    pub fn with_args(args: Vec<Value>) -> Self {
        LocalStore {
            values: args,
            flag_map: IndexMap::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn register_flag_alias(&mut self, index: usize, flag_name: String) {
        self.flag_map.insert(index, flag_name);
    }

    pub fn get(&self, index: usize, flags: &IndexMap<String, Value>) -> Value {
        if let Some(name) = self.flag_map.get(&index) {
            return flags.get(name).cloned().unwrap_or(Value::Undefined);
        }
        self.values.get(index).cloned().unwrap_or(Value::Undefined)
    }

    pub fn set(&mut self, index: usize, value: Value, flags: &mut IndexMap<String, Value>) {
        if let Some(name) = self.flag_map.get(&index) {
            flags.insert(name.clone(), value);
            return;
        }
        if index < self.values.len() {
            self.values[index] = value;
        } else {
            self.values.resize(index, Value::Undefined);
            self.values.push(value);
        }
    }

    /// `free_local i`: discards locals from `i` onward. Compiled DXB only ever
    /// frees the most-recently-declared locals (LIFO), so truncation is
    /// sufficient.
    pub fn free_local(&mut self, index: i32) {
        if index >= 0 {
            let idx = index as usize;
            if idx < self.values.len() {
                self.values.truncate(idx);
            }
        }
    }
}
