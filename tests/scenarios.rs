//! End-to-end scenarios from the dialogue-VM behavioral spec, each built as
//! a small in-memory DXB byte buffer (there is no compiler in this repo to
//! produce real fixtures) and driven through the public `run_scene` /
//! `update` / `resume` / `choose_choice` host API.
use diannex::opcode::Opcode;
use diannex::{decode, FunctionHandler, Value, Vm, VmError, VmOptions};

/// Assembles DXB instructions into a byte buffer, with support for patching
/// jump-style operands once their target offset is known.
struct Asm {
    code: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Asm { code: Vec::new() }
    }

    fn pos(&self) -> i32 {
        self.code.len() as i32
    }

    fn op0(&mut self, op: Opcode) {
        self.code.push(op.byte());
    }

    fn op_i32(&mut self, op: Opcode, v: i32) {
        self.code.push(op.byte());
        self.code.extend(v.to_le_bytes());
    }

    fn op_f64(&mut self, op: Opcode, v: f64) {
        self.code.push(op.byte());
        self.code.extend(v.to_le_bytes());
    }

    fn op_i32_i32(&mut self, op: Opcode, a: i32, b: i32) {
        self.code.push(op.byte());
        self.code.extend(a.to_le_bytes());
        self.code.extend(b.to_le_bytes());
    }

    /// Emits a placeholder i32-operand instruction, returning the operand's
    /// byte offset for a later `patch_i32` once the jump target is known.
    fn op_i32_placeholder(&mut self, op: Opcode) -> usize {
        self.code.push(op.byte());
        let at = self.code.len();
        self.code.extend(0i32.to_le_bytes());
        at
    }

    /// Patches an operand written by `op_i32_placeholder` with the offset
    /// from the byte immediately following the instruction to `target`.
    fn patch_i32(&mut self, at: usize, target: i32) {
        let next_ip = (at + 4) as i32;
        let offset = target - next_ip;
        self.code[at..at + 4].copy_from_slice(&offset.to_le_bytes());
    }
}

fn cstr_section(strings: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend((strings.len() as u32).to_le_bytes());
    for s in strings {
        out.extend(s.as_bytes());
        out.push(0);
    }
    out
}

/// Builds a minimal uncompressed v3 DXB container with a single scene named
/// `scene_name` whose entry point is `code`, the given string/translation
/// tables, optional definitions, and no functions/external functions.
fn container_with_scene(
    scene_name: &str,
    code: &[u8],
    string_table: &[&str],
    translation_table: &[&str],
    definitions: &[(u32, u32, i32)],
) -> Vec<u8> {
    let mut payload = Vec::new();

    let symbol = string_table
        .iter()
        .position(|s| *s == scene_name)
        .expect("scene_name must be in string_table") as u32;
    payload.extend(1u32.to_le_bytes()); // scenes: 1 entry
    payload.extend(symbol.to_le_bytes());
    payload.extend(1u16.to_le_bytes()); // indices_count
    payload.extend(0i32.to_le_bytes()); // entry point at instruction 0

    payload.extend(0u32.to_le_bytes()); // functions: none

    payload.extend((definitions.len() as u32).to_le_bytes());
    for (sym, reference, ip) in definitions {
        payload.extend(sym.to_le_bytes());
        payload.extend(reference.to_le_bytes());
        payload.extend(ip.to_le_bytes());
    }

    payload.extend((code.len() as u32).to_le_bytes());
    payload.extend_from_slice(code);

    payload.extend(cstr_section(string_table));

    let has_translation = !translation_table.is_empty();
    if has_translation {
        payload.extend(cstr_section(translation_table));
    }

    payload.extend(0u32.to_le_bytes()); // external function list: none

    let mut out = Vec::new();
    out.extend(b"DNX");
    out.push(3);
    out.push(if has_translation { 0x02 } else { 0x00 });
    out.extend((payload.len() as u32).to_le_bytes());
    out.extend(&payload);
    out
}

struct NullHandler;
impl FunctionHandler for NullHandler {
    fn invoke(&mut self, name: &str, _args: Vec<Value>) -> Result<Value, VmError> {
        Err(VmError::HostFunction(format!("unexpected call: {name}")))
    }
}

fn drain(vm: &mut Vm) {
    while !vm.paused {
        vm.update().unwrap();
    }
}

// ---- Scenario 1: simple text ----

#[test]
fn scenario_1_simple_text() {
    let mut asm = Asm::new();
    asm.op_i32(Opcode::PushString, 0);
    asm.op0(Opcode::TextRun);
    asm.op0(Opcode::Exit);

    let container = container_with_scene(
        "intro",
        &asm.code,
        &["intro"],
        &["Welcome to the test introduction scene!"],
        &[],
    );
    let binary = decode(&container).unwrap();
    let mut vm = Vm::new(binary, Box::new(NullHandler), VmOptions::default(), None, None).unwrap();

    vm.run_scene("intro").unwrap();
    drain(&mut vm);

    assert!(vm.running_text);
    assert_eq!(
        vm.current_text.as_deref(),
        Some("Welcome to the test introduction scene!")
    );
}

// ---- Scenario 2: sequential text across three pause/resume cycles ----

#[test]
fn scenario_2_sequential_text() {
    let mut asm = Asm::new();
    for i in 0..3i32 {
        asm.op_i32(Opcode::PushString, i);
        asm.op0(Opcode::TextRun);
    }
    asm.op0(Opcode::Exit);

    let container = container_with_scene(
        "sequence",
        &asm.code,
        &["sequence"],
        &["Line 1", "Line 2", "Line 3"],
        &[],
    );
    let binary = decode(&container).unwrap();
    let mut vm = Vm::new(binary, Box::new(NullHandler), VmOptions::default(), None, None).unwrap();

    vm.run_scene("sequence").unwrap();

    for expected in ["Line 1", "Line 2", "Line 3"] {
        drain(&mut vm);
        assert!(vm.running_text);
        assert_eq!(vm.current_text.as_deref(), Some(expected));
        vm.resume();
    }

    drain(&mut vm);
    assert!(vm.scene_completed);
}

// ---- Scenario 3: choice ----

#[test]
fn scenario_3_choice() {
    let mut asm = Asm::new();
    asm.op_i32(Opcode::PushString, 0); // "Line 1"
    asm.op0(Opcode::TextRun);

    asm.op0(Opcode::ChoiceBegin);

    asm.op_i32(Opcode::PushString, 1); // "Yes"
    asm.op_f64(Opcode::PushDouble, 1.0);
    let patch_yes = asm.op_i32_placeholder(Opcode::ChoiceAdd);

    asm.op_i32(Opcode::PushString, 2); // "No"
    asm.op_f64(Opcode::PushDouble, 1.0);
    let patch_no = asm.op_i32_placeholder(Opcode::ChoiceAdd);

    asm.op0(Opcode::ChoiceSelect);

    // Unreachable fallthrough if neither branch is taken: exit immediately.
    asm.op0(Opcode::Exit);

    let yes_target = asm.pos();
    asm.op_i32(Opcode::PushString, 1); // "Yes"
    asm.op0(Opcode::TextRun);
    asm.op0(Opcode::Exit);

    let no_target = asm.pos();
    asm.op_i32(Opcode::PushString, 2); // "No"
    asm.op0(Opcode::TextRun);
    asm.op0(Opcode::Exit);

    asm.patch_i32(patch_yes, yes_target);
    asm.patch_i32(patch_no, no_target);

    let container = container_with_scene(
        "branch",
        &asm.code,
        &["branch"],
        &["Line 1", "Yes", "No"],
        &[],
    );
    let binary = decode(&container).unwrap();
    let mut vm = Vm::new(
        binary,
        Box::new(NullHandler),
        VmOptions::default(),
        Some(Box::new(|_chance: f64| true)),
        None,
    )
    .unwrap();

    vm.run_scene("branch").unwrap();

    drain(&mut vm);
    assert_eq!(vm.current_text.as_deref(), Some("Line 1"));
    vm.resume();

    drain(&mut vm);
    assert!(vm.select_choice);
    assert_eq!(vm.choices(), vec!["Yes", "No"]);

    vm.choose_choice(1).unwrap();
    drain(&mut vm);
    assert_eq!(vm.current_text.as_deref(), Some("No"));
}

// ---- Scenario 4: weighted choose ----

#[test]
fn scenario_4_weighted_choose() {
    fn build_and_run(weighted_cb: Box<dyn FnMut(&[f64]) -> i64>) -> String {
        let mut asm = Asm::new();
        asm.op_f64(Opcode::PushDouble, 1.0);
        let patch_first = asm.op_i32_placeholder(Opcode::ChooseAdd);
        asm.op_f64(Opcode::PushDouble, 1.0);
        let patch_second = asm.op_i32_placeholder(Opcode::ChooseAdd);
        asm.op0(Opcode::ChooseSelect);
        asm.op0(Opcode::Exit);

        let first_target = asm.pos();
        asm.op_i32(Opcode::PushString, 0);
        asm.op0(Opcode::TextRun);
        asm.op0(Opcode::Exit);

        let second_target = asm.pos();
        asm.op_i32(Opcode::PushString, 1);
        asm.op0(Opcode::TextRun);
        asm.op0(Opcode::Exit);

        asm.patch_i32(patch_first, first_target);
        asm.patch_i32(patch_second, second_target);

        let container =
            container_with_scene("pick", &asm.code, &["pick"], &["first", "second"], &[]);
        let binary = decode(&container).unwrap();
        let mut vm = Vm::new(
            binary,
            Box::new(NullHandler),
            VmOptions::default(),
            None,
            Some(weighted_cb),
        )
        .unwrap();

        vm.run_scene("pick").unwrap();
        drain(&mut vm);
        vm.current_text.clone().unwrap()
    }

    assert_eq!(build_and_run(Box::new(|_w: &[f64]| 0)), "first");
    assert_eq!(build_and_run(Box::new(|_w: &[f64]| 1)), "second");
}

// ---- Scenario 5: external call and interpolation ----

struct PlayerNameHandler;
impl FunctionHandler for PlayerNameHandler {
    fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, VmError> {
        match name {
            "getPlayerName" => Ok(Value::Str("world".to_string())),
            other => Err(VmError::HostFunction(format!(
                "unexpected call: {other} with {} args",
                args.len()
            ))),
        }
    }
}

#[test]
fn scenario_5_external_call_and_interpolation() {
    let mut asm = Asm::new();
    asm.op_i32_i32(Opcode::CallExternal, 1, 0); // string_table[1] = "getPlayerName"
    asm.op_i32_i32(Opcode::PushBinaryInterpolatedString, 0, 1); // string_table[0] = "Hello, ${0}"
    asm.op0(Opcode::TextRun);
    asm.op0(Opcode::Exit);

    let container = container_with_scene(
        "greet",
        &asm.code,
        &["Hello, ${0}", "getPlayerName", "greet"],
        &[],
        &[],
    );
    let binary = decode(&container).unwrap();
    let mut vm = Vm::new(
        binary,
        Box::new(PlayerNameHandler),
        VmOptions::default(),
        None,
        None,
    )
    .unwrap();

    vm.run_scene("greet").unwrap();
    drain(&mut vm);
    assert_eq!(vm.current_text.as_deref(), Some("Hello, world"));
}

// ---- Scenario 6: definitions ----

#[test]
fn scenario_6_definition_resolution() {
    let mut asm = Asm::new();
    asm.op0(Opcode::Nop);
    asm.op0(Opcode::Exit);

    let string_table = ["scene_unused", "info.name", "world"];
    let world_index = 2u32;
    let name_symbol = 1u32;
    let reference = (1u32 << 31) | world_index;

    let container = container_with_scene(
        "scene_unused",
        &asm.code,
        &string_table,
        &[],
        &[(name_symbol, reference, -1)],
    );
    let binary = decode(&container).unwrap();
    let mut vm =
        Vm::new(binary, Box::new(NullHandler), VmOptions::default(), None, None).unwrap();

    assert_eq!(vm.get_definition("info.name").unwrap(), "world");
}
