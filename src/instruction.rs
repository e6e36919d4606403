//! Decodes a single instruction from the bytecode blob at a given offset.
use crate::error::VmError;
use crate::opcode::{Opcode, OperandLayout};

/// A decoded operand: either of the two little-endian operand widths DXB uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    I32(i32),
    F64(f64),
}

impl Operand {
    pub fn as_i32(self) -> i32 {
        match self {
            Operand::I32(v) => v,
            Operand::F64(v) => v as i32,
        }
    }
}

/// A decoded instruction: its opcode, operands, and total size in bytes.
/// Jump-style operands are relative to the byte immediately following the
/// fully decoded instruction, so the VM needs `size` to compute the next
/// `ip` before applying any branch offset.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub size: usize,
}

fn read_i32(bytes: &[u8], at: usize) -> Result<i32, VmError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or(VmError::InstructionPointerOutOfBounds(at as i32))?;
    Ok(i32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_f64(bytes: &[u8], at: usize) -> Result<f64, VmError> {
    let slice = bytes
        .get(at..at + 8)
        .ok_or(VmError::InstructionPointerOutOfBounds(at as i32))?;
    Ok(f64::from_le_bytes(slice.try_into().unwrap()))
}

impl Instruction {
    /// Decodes the instruction starting at byte offset `ip` in `bytes`.
    pub fn decode(bytes: &[u8], ip: usize) -> Result<Instruction, VmError> {
        let opcode_byte = *bytes
            .get(ip)
            .ok_or(VmError::InstructionPointerOutOfBounds(ip as i32))?;
        let opcode = Opcode::from_byte(opcode_byte)?;

        let mut offset = ip + 1;
        let mut operands = Vec::new();

        match opcode.layout() {
            OperandLayout::Zero => {}
            OperandLayout::OneI32 => {
                operands.push(Operand::I32(read_i32(bytes, offset)?));
                offset += 4;
            }
            OperandLayout::OneF64 => {
                operands.push(Operand::F64(read_f64(bytes, offset)?));
                offset += 8;
            }
            OperandLayout::TwoI32 => {
                operands.push(Operand::I32(read_i32(bytes, offset)?));
                offset += 4;
                operands.push(Operand::I32(read_i32(bytes, offset)?));
                offset += 4;
            }
        }

        Ok(Instruction {
            opcode,
            operands,
            size: offset - ip,
        })
    }
}
