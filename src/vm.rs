//! The stack machine: instruction dispatch, call convention, choice/choose
//! state machines, definition resolution, and the host-facing pause/resume API.
use std::rc::Rc;
use std::cell::RefCell;

use indexmap::IndexMap;

use crate::binary::{Binary, CodeEntry, DefinitionsCache};
use crate::chance::{default_chance_callback, default_weighted_chance_callback, Rand, RandMode};
use crate::error::VmError;
use crate::function_handler::FunctionHandler;
use crate::instruction::{Instruction, Operand};
use crate::interpolation::interpolate;
use crate::local_store::LocalStore;
use crate::opcode::Opcode;
use crate::value::{promote, Numeric, Value};

pub type ChanceCallback = Box<dyn FnMut(f64) -> bool>;
pub type WeightedChanceCallback = Box<dyn FnMut(&[f64]) -> i64>;

/// VM tunables, supplied at construction rather than through a config file.
pub struct VmOptions {
    /// When true, arithmetic/comparison/bitwise type mismatches become
    /// `VmError::TypeMismatch` instead of silently discarding the operands.
    pub strict_arithmetic: bool,
    /// Seeds the default chance/choose RNG for reproducible tests. `None`
    /// uses true randomness (`rand::thread_rng`).
    pub rng_seed: Option<u64>,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            strict_arithmetic: false,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ChoiceOption {
    address: i32,
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ChooseOption {
    weight: f64,
    pointer: i32,
}

#[derive(Debug, Clone)]
struct Frame {
    return_ip: i32,
    saved_stack: Vec<Value>,
    saved_locals: LocalStore,
}

/// The Diannex bytecode interpreter. Constructed over an owned [`Binary`] and
/// a host-supplied [`FunctionHandler`]; drives one scene at a time via the
/// `update`/`resume`/`choose_choice` pause protocol.
pub struct Vm {
    binary: Binary,
    function_handler: Box<dyn FunctionHandler>,
    options: VmOptions,
    chance_cb: ChanceCallback,
    weighted_chance_cb: WeightedChanceCallback,

    instruction_pointer: i32,
    stack: Vec<Value>,
    save_register: Value,
    local_store: LocalStore,
    call_stack: Vec<Frame>,
    global_store: IndexMap<String, Value>,
    flags: IndexMap<String, Value>,
    choices: Vec<ChoiceOption>,
    choose_options: Vec<ChooseOption>,
    definitions_cache: DefinitionsCache,

    pub in_choice: bool,
    pub select_choice: bool,
    pub running_text: bool,
    pub paused: bool,
    pub scene_completed: bool,

    pub current_scene: Option<String>,
    pub current_text: Option<String>,
}

impl Vm {
    pub fn new(
        binary: Binary,
        function_handler: Box<dyn FunctionHandler>,
        options: VmOptions,
        chance_cb: Option<ChanceCallback>,
        weighted_chance_cb: Option<WeightedChanceCallback>,
    ) -> Result<Vm, VmError> {
        let mode = match options.rng_seed {
            Some(seed) => RandMode::Predictable(seed),
            None => RandMode::RandomUniform,
        };
        let rand = Rc::new(RefCell::new(Rand::new(mode)));

        let chance_cb = chance_cb.unwrap_or_else(|| {
            let rand = rand.clone();
            Box::new(move |c| default_chance_callback(&mut rand.borrow_mut(), c))
        });
        let weighted_chance_cb = weighted_chance_cb.unwrap_or_else(|| {
            let rand = rand.clone();
            Box::new(move |w: &[f64]| default_weighted_chance_callback(&mut rand.borrow_mut(), w))
        });

        let translation_loaded = binary.translation_loaded;
        let mut vm = Vm {
            binary,
            function_handler,
            options,
            chance_cb,
            weighted_chance_cb,
            instruction_pointer: -1,
            stack: Vec::new(),
            save_register: Value::Undefined,
            local_store: LocalStore::new(),
            call_stack: Vec::new(),
            global_store: IndexMap::new(),
            flags: IndexMap::new(),
            choices: Vec::new(),
            choose_options: Vec::new(),
            definitions_cache: DefinitionsCache::new(),
            in_choice: false,
            select_choice: false,
            running_text: false,
            paused: false,
            scene_completed: false,
            current_scene: None,
            current_text: None,
        };

        if translation_loaded {
            vm.rebuild_definitions_cache()?;
        }
        Ok(vm)
    }

    // ---- host-facing API ----

    pub fn run_scene(&mut self, name: &str) -> Result<(), VmError> {
        let scene = self
            .binary
            .find_scene(name)
            .cloned()
            .ok_or_else(|| VmError::SceneNotFound(name.to_string()))?;

        self.stack.clear();
        self.call_stack.clear();
        self.local_store = LocalStore::new();
        self.choices.clear();
        self.choose_options.clear();
        self.in_choice = false;
        self.select_choice = false;
        self.running_text = false;
        self.paused = false;
        self.scene_completed = false;
        self.current_text = None;
        self.current_scene = Some(name.to_string());

        log::debug!("run_scene({name}): running flag initializers");
        let aliases = self.run_flag_initializers(&scene)?;
        for (flag_index, name) in aliases {
            self.local_store.register_flag_alias(flag_index, name);
        }
        self.instruction_pointer = scene.entry_point();
        Ok(())
    }

    pub fn update(&mut self) -> Result<(), VmError> {
        if self.paused {
            return Ok(());
        }
        self.step()
    }

    pub fn resume(&mut self) {
        self.running_text = false;
        if self.select_choice {
            return;
        }
        self.paused = false;
    }

    pub fn choose_choice(&mut self, index: usize) -> Result<(), VmError> {
        if index >= self.choices.len() {
            return Err(VmError::ChoiceIndexOutOfRange {
                index,
                len: self.choices.len(),
            });
        }
        self.instruction_pointer = self.choices[index].address;
        self.select_choice = false;
        self.paused = false;
        self.in_choice = false;
        self.choices.clear();
        Ok(())
    }

    pub fn choices(&self) -> Vec<&str> {
        self.choices.iter().map(|c| c.text.as_str()).collect()
    }

    pub fn get_flag(&self, name: &str) -> Value {
        self.flags.get(name).cloned().unwrap_or(Value::Undefined)
    }

    pub fn set_flag(&mut self, name: &str, value: Value) {
        self.flags.insert(name.to_string(), value);
    }

    pub fn get_definition(&mut self, name: &str) -> Result<String, VmError> {
        if let Some(cached) = self.definitions_cache.get(name) {
            return Ok(cached.clone());
        }
        let entry = self
            .binary
            .find_definition(name)
            .cloned()
            .ok_or_else(|| VmError::DefinitionNotFound(name.to_string()))?;
        let raw = self
            .binary
            .resolve_reference(entry.reference)
            .ok_or(VmError::StringNotFound(entry.reference))?
            .to_string();
        let resolved = self.resolve_definition_interpolation(&raw, entry.instruction_index)?;
        self.definitions_cache
            .insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    pub fn load_translation_file(&mut self, path: &str) -> Result<(), VmError> {
        let contents = std::fs::read_to_string(path).map_err(|e| VmError::Io(e.to_string()))?;
        let lines = crate::binary::parse_translation_file(&contents);
        self.binary.load_translation_strings(lines);
        self.rebuild_definitions_cache()
    }

    fn rebuild_definitions_cache(&mut self) -> Result<(), VmError> {
        self.definitions_cache.clear();
        let names: Vec<String> = self
            .binary
            .definitions
            .iter()
            .filter_map(|d| self.binary.string_table.get(d.symbol as usize).cloned())
            .collect();
        for name in names {
            self.get_definition(&name)?;
        }
        Ok(())
    }

    /// Runs the interpolation sub-program for a definition. Must not be
    /// reached from inside a definition sub-program itself (enforced at the
    /// call site by `get_definition`/`rebuild_definitions_cache`, not
    /// recursively - a definition program is expected to `exit` cleanly).
    fn resolve_definition_interpolation(
        &mut self,
        raw: &str,
        instruction_index: i32,
    ) -> Result<String, VmError> {
        if instruction_index == -1 {
            return Ok(raw.to_string());
        }
        let saved_ip = self.instruction_pointer;
        self.run_until_paused(instruction_index)?;

        let mut values = Vec::new();
        while let Ok(v) = self.pop() {
            values.push(v);
        }
        self.instruction_pointer = saved_ip;
        Ok(interpolate(raw, &values))
    }

    // ---- call convention ----

    /// Runs flag-initializer pairs in declaration order, returning the
    /// flag-name each local index should alias.
    ///
    /// Each sub-program run ends in its own `exit`, which resets
    /// `local_store` (including its flag-alias map) as a side effect. Aliases
    /// are therefore accumulated and returned rather than written into
    /// `local_store` as each pair resolves - otherwise every pair but the
    /// last would have its alias wiped by the next pair's `exit` before the
    /// call body ever executes. The caller applies the returned aliases to
    /// whichever `local_store` the call body will actually run against.
    fn run_flag_initializers(&mut self, entry: &CodeEntry) -> Result<Vec<(usize, String)>, VmError> {
        let mut aliases = Vec::new();
        for (flag_index, (value_ip, name_ip)) in entry.flag_initializers().enumerate() {
            let value = self.run_subprogram_value(value_ip)?;
            let name = self.run_subprogram_value(name_ip)?;
            if let Value::Str(name) = name {
                if !self.flags.contains_key(&name) {
                    self.flags.insert(name.clone(), value);
                }
                aliases.push((flag_index, name));
            }
        }
        Ok(aliases)
    }

    fn run_subprogram_value(&mut self, start_ip: i32) -> Result<Value, VmError> {
        self.run_until_paused(start_ip)?;
        self.pop()
    }

    /// Executes instructions starting at `start_ip` until the VM pauses
    /// (`exit` at an empty call stack, `text_run`, or `choice_select`), then
    /// restores the pause-related booleans the caller had before this call -
    /// these sub-program runs are host-invisible to whatever triggered them.
    /// A sub-program that pauses via `text_run`/`choice_select` instead of
    /// `exit` is rejected with `VmError::DefinitionSideEffect`.
    fn run_until_paused(&mut self, start_ip: i32) -> Result<(), VmError> {
        let saved_running_text = self.running_text;
        let saved_select_choice = self.select_choice;
        let saved_scene_completed = self.scene_completed;
        let saved_paused = self.paused;

        self.paused = false;
        self.instruction_pointer = start_ip;
        while !self.paused {
            self.step()?;
        }

        let side_effect = (self.running_text && !saved_running_text)
            || (self.select_choice && !saved_select_choice);

        self.running_text = saved_running_text;
        self.select_choice = saved_select_choice;
        self.scene_completed = saved_scene_completed;
        self.paused = saved_paused;

        if side_effect {
            return Err(VmError::DefinitionSideEffect);
        }
        Ok(())
    }

    // ---- instruction dispatch ----

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn step(&mut self) -> Result<(), VmError> {
        let ip = self.instruction_pointer;
        if ip < 0 {
            self.paused = true;
            return Ok(());
        }
        let inst = Instruction::decode(&self.binary.instructions, ip as usize)?;
        let next_ip = ip + inst.size as i32;
        self.instruction_pointer = next_ip;
        self.dispatch(inst.opcode, &inst.operands, next_ip)
    }

    fn dispatch(&mut self, op: Opcode, operands: &[Operand], next_ip: i32) -> Result<(), VmError> {
        match op {
            Opcode::Nop => {}

            Opcode::PushUndefined => self.push(Value::Undefined),
            Opcode::PushInt => self.push(Value::Int(operands[0].as_i32())),
            Opcode::PushDouble => {
                let Operand::F64(d) = operands[0] else {
                    unreachable!("push_double operand is always F64")
                };
                self.push(Value::Double(d));
            }
            Opcode::PushString => {
                let idx = operands[0].as_i32() as usize;
                let s = self
                    .binary
                    .translation_table
                    .get(idx)
                    .cloned()
                    .ok_or(VmError::StringNotFound(idx as u32))?;
                self.push(Value::Str(s));
            }
            Opcode::PushBinaryString => {
                let idx = operands[0].as_i32() as usize;
                let s = self
                    .binary
                    .string_table
                    .get(idx)
                    .cloned()
                    .ok_or(VmError::StringNotFound(idx as u32))?;
                self.push(Value::Str(s));
            }
            Opcode::PushInterpolatedString => {
                self.op_push_interpolated(operands, true)?;
            }
            Opcode::PushBinaryInterpolatedString => {
                self.op_push_interpolated(operands, false)?;
            }

            Opcode::MakeArray => {
                let n = operands[0].as_i32().max(0) as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop()?);
                }
                items.reverse();
                self.push(Value::array(items));
            }
            Opcode::PushArrayIndex => {
                let index = self.pop()?;
                let array = self.pop()?;
                match (&array, &index) {
                    (Value::Array(cell), Value::Int(i)) => {
                        let items = cell.borrow();
                        let value = if *i >= 0 {
                            items.get(*i as usize).cloned().unwrap_or(Value::Undefined)
                        } else {
                            Value::Undefined
                        };
                        drop(items);
                        self.push(value);
                    }
                    _ => self.maybe_type_error("push_array_index")?,
                }
            }
            Opcode::SetArrayIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let array = self.pop()?;
                if let (Value::Array(cell), Value::Int(i)) = (&array, &index) {
                    if *i >= 0 {
                        let mut items = cell.borrow_mut();
                        let i = *i as usize;
                        if i < items.len() {
                            items[i] = value;
                        }
                    }
                } else {
                    self.maybe_type_error("set_array_index")?;
                }
                self.push(array);
            }

            Opcode::SetVarGlobal => {
                let idx = operands[0].as_i32() as usize;
                let name = self.symbol(idx)?;
                let v = self.pop()?;
                self.global_store.insert(name, v);
            }
            Opcode::PushVarGlobal => {
                let idx = operands[0].as_i32() as usize;
                let name = self.symbol(idx)?;
                let v = self
                    .global_store
                    .get(&name)
                    .cloned()
                    .unwrap_or(Value::Undefined);
                self.push(v);
            }
            Opcode::SetVarLocal => {
                let idx = operands[0].as_i32() as usize;
                let v = self.pop()?;
                self.local_store.set(idx, v, &mut self.flags);
            }
            Opcode::PushVarLocal => {
                let idx = operands[0].as_i32() as usize;
                let v = self.local_store.get(idx, &self.flags);
                self.push(v);
            }

            Opcode::Save => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.save_register = top;
            }
            Opcode::Load => self.push(self.save_register.clone()),

            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.push(top);
            }
            Opcode::Dup2 => {
                if self.stack.len() < 2 {
                    return Err(VmError::StackUnderflow);
                }
                let len = self.stack.len();
                let a = self.stack[len - 2].clone();
                let b = self.stack[len - 1].clone();
                self.push(a);
                self.push(b);
            }

            Opcode::Add => self.binary_arith("add", |a, b| a.wrapping_add(b), |a, b| a + b)?,
            Opcode::Sub => self.binary_arith("sub", |a, b| a.wrapping_sub(b), |a, b| a - b)?,
            Opcode::Mul => self.binary_arith("mul", |a, b| a.wrapping_mul(b), |a, b| a * b)?,
            Opcode::Div => self.op_div()?,
            Opcode::Mod => self.op_mod()?,
            Opcode::Power => self.op_power()?,

            Opcode::Neg => self.unary_arith("neg", |a: i32| a.wrapping_neg(), |a| -a)?,
            Opcode::Invert => {
                let v = self.pop()?;
                self.push(Value::Int(if v.is_truthy() { 0 } else { 1 }));
            }

            Opcode::BitLs => {
                self.binary_bitwise("bit_ls", |a, b| a.wrapping_shl((b as u32) & 31))?
            }
            Opcode::BitRs => {
                self.binary_bitwise("bit_rs", |a, b| a.wrapping_shr((b as u32) & 31))?
            }
            Opcode::BitAnd => self.binary_bitwise("bit_and", |a, b| a & b)?,
            Opcode::BitOr => self.binary_bitwise("bit_or", |a, b| a | b)?,
            Opcode::BitXor => self.binary_bitwise("bit_xor", |a, b| a ^ b)?,
            Opcode::BitNeg => {
                let v = self.pop()?;
                match v {
                    Value::Int(a) => self.push(Value::Int(!a)),
                    _ => self.maybe_type_error("bit_neg")?,
                }
            }

            Opcode::CmpEq => self.compare("cmp_eq", |o| o == std::cmp::Ordering::Equal)?,
            Opcode::CmpNeq => self.compare("cmp_neq", |o| o != std::cmp::Ordering::Equal)?,
            Opcode::CmpGt => self.compare("cmp_gt", |o| o == std::cmp::Ordering::Greater)?,
            Opcode::CmpLt => self.compare("cmp_lt", |o| o == std::cmp::Ordering::Less)?,
            Opcode::CmpGte => self.compare("cmp_gte", |o| o != std::cmp::Ordering::Less)?,
            Opcode::CmpLte => self.compare("cmp_lte", |o| o != std::cmp::Ordering::Greater)?,

            Opcode::Jump => {
                let off = operands[0].as_i32();
                self.instruction_pointer = next_ip + off;
            }
            Opcode::JumpTruthy => {
                let off = operands[0].as_i32();
                let v = self.pop()?;
                if v.is_truthy() {
                    self.instruction_pointer = next_ip + off;
                }
            }
            Opcode::JumpFalsey => {
                let off = operands[0].as_i32();
                let v = self.pop()?;
                if !v.is_truthy() {
                    self.instruction_pointer = next_ip + off;
                }
            }

            Opcode::Exit => self.op_exit()?,
            Opcode::Ret => self.op_ret()?,
            Opcode::Call => {
                let func_index = operands[0].as_i32();
                let argc = operands[1].as_i32();
                self.op_call(func_index, argc)?;
            }
            Opcode::CallExternal => {
                let name_index = operands[0].as_i32() as usize;
                let argc = operands[1].as_i32();
                self.op_call_external(name_index, argc)?;
            }

            Opcode::ChoiceBegin => {
                if self.in_choice {
                    return Err(VmError::ChoiceAlreadyActive);
                }
                self.in_choice = true;
                self.choices.clear();
            }
            Opcode::ChoiceAdd => {
                let off = operands[0].as_i32();
                self.op_choice_add(off, false, next_ip)?;
            }
            Opcode::ChoiceAddTruthy => {
                let off = operands[0].as_i32();
                self.op_choice_add(off, true, next_ip)?;
            }
            Opcode::ChoiceSelect => {
                if !self.in_choice {
                    return Err(VmError::NoActiveChoice);
                }
                if self.choices.is_empty() {
                    return Err(VmError::EmptyChoiceSet);
                }
                self.select_choice = true;
                self.paused = true;
            }

            Opcode::ChooseAdd => {
                let off = operands[0].as_i32();
                self.op_choose_add(off, false, next_ip)?;
            }
            Opcode::ChooseAddTruthy => {
                let off = operands[0].as_i32();
                self.op_choose_add(off, true, next_ip)?;
            }
            Opcode::ChooseSelect => self.op_choose_select()?,

            Opcode::TextRun => {
                let v = self.pop()?;
                if let Value::Str(s) = v {
                    self.current_text = Some(s);
                    self.running_text = true;
                    self.paused = true;
                }
            }

            Opcode::FreeLocal => {
                let idx = operands[0].as_i32();
                self.local_store.free_local(idx);
            }
        }
        Ok(())
    }

    fn symbol(&self, idx: usize) -> Result<String, VmError> {
        self.binary
            .string_table
            .get(idx)
            .cloned()
            .ok_or(VmError::StringNotFound(idx as u32))
    }

    fn maybe_type_error(&self, op: &'static str) -> Result<(), VmError> {
        if self.options.strict_arithmetic {
            Err(VmError::TypeMismatch { op })
        } else {
            log::trace!("type mismatch for {op}, discarding operands");
            Ok(())
        }
    }

    fn binary_arith(
        &mut self,
        op: &'static str,
        int_op: impl Fn(i32, i32) -> i32,
        double_op: impl Fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match promote(&left, &right) {
            Some(Numeric::Int(a, b)) => self.push(Value::Int(int_op(a, b))),
            Some(Numeric::Double(a, b)) => self.push(Value::Double(double_op(a, b))),
            None => self.maybe_type_error(op)?,
        }
        Ok(())
    }

    fn unary_arith(
        &mut self,
        op: &'static str,
        int_op: impl Fn(i32) -> i32,
        double_op: impl Fn(f64) -> f64,
    ) -> Result<(), VmError> {
        let v = self.pop()?;
        match v {
            Value::Int(a) => self.push(Value::Int(int_op(a))),
            Value::Double(a) => self.push(Value::Double(double_op(a))),
            _ => self.maybe_type_error(op)?,
        }
        Ok(())
    }

    fn binary_bitwise(
        &mut self,
        op: &'static str,
        f: impl Fn(i32, i32) -> i32,
    ) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => self.push(Value::Int(f(a, b))),
            _ => self.maybe_type_error(op)?,
        }
        Ok(())
    }

    /// Integer division/modulo by zero would panic in Rust; the spec is
    /// silent on the case, so it's folded into the existing type-mismatch
    /// no-op contract (no crash, optionally strict) rather than inventing a
    /// new error kind.
    fn op_div(&mut self) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match promote(&left, &right) {
            Some(Numeric::Int(a, b)) => {
                if b == 0 {
                    self.maybe_type_error("div")?;
                } else {
                    self.push(Value::Int(a / b));
                }
            }
            Some(Numeric::Double(a, b)) => self.push(Value::Double(a / b)),
            None => self.maybe_type_error("div")?,
        }
        Ok(())
    }

    fn op_mod(&mut self) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match promote(&left, &right) {
            Some(Numeric::Int(a, b)) => {
                if b == 0 {
                    self.maybe_type_error("mod")?;
                } else {
                    self.push(Value::Int(a % b));
                }
            }
            Some(Numeric::Double(a, b)) => self.push(Value::Double(a % b)),
            None => self.maybe_type_error("mod")?,
        }
        Ok(())
    }

    fn op_power(&mut self) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match promote(&left, &right) {
            Some(Numeric::Int(a, b)) => {
                let result = if b >= 0 {
                    a.checked_pow(b as u32).unwrap_or(0)
                } else {
                    0
                };
                self.push(Value::Int(result));
            }
            Some(Numeric::Double(a, b)) => self.push(Value::Double(a.powf(b))),
            None => self.maybe_type_error("power")?,
        }
        Ok(())
    }

    fn compare(
        &mut self,
        op: &'static str,
        pred: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match promote(&left, &right) {
            Some(Numeric::Int(a, b)) => self.push(Value::Int(pred(a.cmp(&b)) as i32)),
            Some(Numeric::Double(a, b)) => {
                if let Some(ord) = a.partial_cmp(&b) {
                    self.push(Value::Int(pred(ord) as i32));
                } else {
                    self.maybe_type_error(op)?;
                }
            }
            None => self.maybe_type_error(op)?,
        }
        Ok(())
    }

    fn op_push_interpolated(
        &mut self,
        operands: &[Operand],
        translated: bool,
    ) -> Result<(), VmError> {
        let idx = operands[0].as_i32() as usize;
        let k = operands[1].as_i32().max(0) as usize;
        let template = if translated {
            self.binary.translation_table.get(idx).cloned()
        } else {
            self.binary.string_table.get(idx).cloned()
        }
        .ok_or(VmError::StringNotFound(idx as u32))?;

        let mut values = Vec::with_capacity(k);
        for _ in 0..k {
            values.push(self.pop()?);
        }
        values.reverse();
        self.push(Value::Str(interpolate(&template, &values)));
        Ok(())
    }

    fn op_exit(&mut self) -> Result<(), VmError> {
        self.local_store = LocalStore::new();
        match self.call_stack.pop() {
            None => {
                log::debug!("scene completed");
                self.instruction_pointer = -1;
                self.paused = true;
                self.scene_completed = true;
            }
            Some(frame) => {
                self.instruction_pointer = frame.return_ip;
                self.stack = frame.saved_stack;
                self.local_store = frame.saved_locals;
                self.push(Value::Undefined);
            }
        }
        Ok(())
    }

    fn op_ret(&mut self) -> Result<(), VmError> {
        let result = self.pop()?;
        let frame = self.call_stack.pop().ok_or(VmError::NoActiveFrame)?;
        self.instruction_pointer = frame.return_ip;
        self.stack = frame.saved_stack;
        self.local_store = frame.saved_locals;
        self.push(result);
        Ok(())
    }

    fn op_call(&mut self, func_index: i32, argc: i32) -> Result<(), VmError> {
        let func = self
            .binary
            .functions
            .get(func_index as usize)
            .cloned()
            .ok_or_else(|| VmError::FunctionNotFound(format!("#{func_index}")))?;

        let argc = argc.max(0) as usize;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();

        log::debug!(
            "call #{func_index} argc={argc}, depth={}",
            self.call_stack.len() + 1
        );

        let frame = Frame {
            return_ip: self.instruction_pointer,
            saved_stack: std::mem::take(&mut self.stack),
            saved_locals: std::mem::take(&mut self.local_store),
        };
        self.call_stack.push(frame);
        self.local_store = LocalStore::new();

        let aliases = self.run_flag_initializers(&func)?;

        self.instruction_pointer = func.entry_point();
        self.local_store = LocalStore::with_args(args);
        for (flag_index, name) in aliases {
            self.local_store.register_flag_alias(flag_index, name);
        }
        Ok(())
    }

    fn op_call_external(&mut self, name_index: usize, argc: i32) -> Result<(), VmError> {
        let name = self.symbol(name_index)?;
        let argc = argc.max(0) as usize;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();

        log::debug!("call_external {name} argc={argc}");
        let result = self.function_handler.invoke(&name, args)?;
        self.push(result);
        Ok(())
    }

    fn op_choice_add(
        &mut self,
        off: i32,
        has_condition: bool,
        next_ip: i32,
    ) -> Result<(), VmError> {
        if !self.in_choice {
            return Err(VmError::NoActiveChoice);
        }
        let chance = self.pop()?;
        let text = self.pop()?;
        let gated = if has_condition {
            self.pop()?.is_truthy()
        } else {
            true
        };
        let chance_value = match chance {
            Value::Int(n) => n as f64,
            Value::Double(d) => d,
            _ => 1.0,
        };

        if gated && (self.chance_cb)(chance_value) {
            if let Value::Str(text) = text {
                self.choices.push(ChoiceOption {
                    address: next_ip + off,
                    text,
                });
            }
        }
        Ok(())
    }

    fn op_choose_add(&mut self, off: i32, has_condition: bool, next_ip: i32) -> Result<(), VmError> {
        let weight = self.pop()?;
        let gated = if has_condition {
            self.pop()?.is_truthy()
        } else {
            true
        };
        let weight_value = match weight {
            Value::Int(n) => n as f64,
            Value::Double(d) => d,
            _ => 0.0,
        };
        if gated {
            self.choose_options.push(ChooseOption {
                weight: weight_value,
                pointer: next_ip + off,
            });
        }
        Ok(())
    }

    fn op_choose_select(&mut self) -> Result<(), VmError> {
        let weights: Vec<f64> = self.choose_options.iter().map(|o| o.weight).collect();
        let selected = (self.weighted_chance_cb)(&weights);
        if selected < 0 || selected as usize >= self.choose_options.len() {
            return Err(VmError::ChooseIndexOutOfRange {
                index: selected,
                len: self.choose_options.len(),
            });
        }
        self.instruction_pointer = self.choose_options[selected as usize].pointer;
        self.choose_options.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_handler::NullFunctionHandler;

    fn vm_over(binary: Binary) -> Vm {
        Vm::new(
            binary,
            Box::new(NullFunctionHandler),
            VmOptions::default(),
            None,
            None,
        )
        .unwrap()
    }

    fn empty_binary() -> Binary {
        Binary {
            translation_loaded: false,
            string_table: vec![],
            translation_table: vec![],
            instructions: vec![],
            external_function_list: vec![],
            scenes: vec![],
            functions: vec![],
            definitions: vec![],
        }
    }

    #[test]
    fn dup_then_pop_preserves_top() {
        let mut vm = vm_over(empty_binary());
        vm.push(Value::Int(7));
        vm.dispatch(Opcode::Dup, &[], 0).unwrap();
        vm.dispatch(Opcode::Pop, &[], 0).unwrap();
        assert!(matches!(vm.pop().unwrap(), Value::Int(7)));
    }

    #[test]
    fn add_promotes_int_and_double() {
        let mut vm = vm_over(empty_binary());
        vm.push(Value::Int(2));
        vm.push(Value::Double(1.5));
        vm.dispatch(Opcode::Add, &[], 0).unwrap();
        assert!(matches!(vm.pop().unwrap(), Value::Double(d) if d == 3.5));
    }

    #[test]
    fn div_by_zero_no_ops_instead_of_panicking() {
        let mut vm = vm_over(empty_binary());
        vm.push(Value::Int(10));
        vm.push(Value::Int(0));
        vm.dispatch(Opcode::Div, &[], 0).unwrap();
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn strict_arithmetic_errors_on_type_mismatch() {
        let mut vm = vm_over(empty_binary());
        vm.options.strict_arithmetic = true;
        vm.push(Value::Str("x".into()));
        vm.push(Value::Int(1));
        assert!(vm.dispatch(Opcode::Add, &[], 0).is_err());
    }

    #[test]
    fn invert_flips_truthiness() {
        let mut vm = vm_over(empty_binary());
        vm.push(Value::Int(0));
        vm.dispatch(Opcode::Invert, &[], 0).unwrap();
        assert!(matches!(vm.pop().unwrap(), Value::Int(1)));
    }

    #[test]
    fn simple_text_scene_pauses_with_expected_text() {
        use crate::decoder::decode;

        let mut payload = Vec::new();
        payload.extend(1u32.to_le_bytes()); // scenes: 1
        payload.extend(0u32.to_le_bytes()); // symbol 0 ("intro")
        payload.extend(1u16.to_le_bytes()); // indices_count
        payload.extend(0i32.to_le_bytes()); // entry point 0
        payload.extend(0u32.to_le_bytes()); // functions: 0
        payload.extend(0u32.to_le_bytes()); // definitions: 0

        let mut code = Vec::new();
        code.push(Opcode::PushString.byte());
        code.extend(0i32.to_le_bytes());
        code.push(Opcode::TextRun.byte());
        code.push(Opcode::Exit.byte());
        payload.extend((code.len() as u32).to_le_bytes());
        payload.extend(&code);

        payload.extend(1u32.to_le_bytes()); // string table: 1
        payload.extend(b"intro\0");
        payload.extend(0u32.to_le_bytes()); // external fns: 0

        let mut container = Vec::new();
        container.extend(b"DNX");
        container.push(3);
        container.push(0);
        container.extend((payload.len() as u32).to_le_bytes());
        container.extend(&payload);

        let mut binary = decode(&container).unwrap();
        binary.translation_table = vec!["Welcome to the test introduction scene!".to_string()];

        let mut vm = vm_over(binary);
        vm.run_scene("intro").unwrap();
        while !vm.paused {
            vm.update().unwrap();
        }
        assert!(vm.running_text);
        assert_eq!(
            vm.current_text.as_deref(),
            Some("Welcome to the test introduction scene!")
        );
    }
}
