//! Instruction stream model.
//!
//! Decoding turns a `Code` attribute's byte array into instructions whose
//! jump targets are *labels* (original code offsets). Encoding lays the
//! instructions out again, resolves every label to its new offset and
//! re-emits branch displacements and switch padding for the new positions.
//! Short branches pushed out of range by inserted code are widened first.

use std::collections::{HashMap, HashSet};

use crate::error::FormatError;
use crate::reader::{ByteReader, put_u16, put_u32};

pub mod opcodes {
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const ALOAD: u8 = 0x19;
    pub const LLOAD_0: u8 = 0x1e;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const ASTORE: u8 = 0x3a;
    pub const LSTORE_0: u8 = 0x3f;
    pub const POP: u8 = 0x57;
    pub const DUP: u8 = 0x59;
    pub const LSUB: u8 = 0x65;
    pub const IINC: u8 = 0x84;
    pub const IFEQ: u8 = 0x99;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

use opcodes::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Any instruction whose operands carry no code offsets. For `wide`,
    /// `operands` starts with the widened opcode.
    Plain { opcode: u8, operands: Vec<u8> },
    /// Conditional and unconditional jumps, `jsr`, and their `_w` forms.
    Branch { opcode: u8, target: u32 },
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Original code offset. Jumps, handlers, frames and debug tables that
    /// referred to it resolve to wherever the labelled instruction lands.
    pub label: Option<u32>,
    pub op: Op,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self { label: None, op }
    }
}

impl Op {
    pub fn opcode(&self) -> u8 {
        match self {
            Op::Plain { opcode, .. } | Op::Branch { opcode, .. } => *opcode,
            Op::TableSwitch { .. } => TABLESWITCH,
            Op::LookupSwitch { .. } => LOOKUPSWITCH,
        }
    }

    /// Returns and `athrow`: the instructions where control leaves the method.
    pub fn is_exit(&self) -> bool {
        matches!(self.opcode(), IRETURN..=RETURN | ATHROW)
    }

    pub fn simple(opcode: u8) -> Op {
        Op::Plain {
            opcode,
            operands: Vec::new(),
        }
    }

    fn with_index(opcode: u8, index: u16) -> Op {
        Op::Plain {
            opcode,
            operands: index.to_be_bytes().to_vec(),
        }
    }

    pub fn invoke_static(method_ref: u16) -> Op {
        Op::with_index(INVOKESTATIC, method_ref)
    }

    pub fn invoke_virtual(method_ref: u16) -> Op {
        Op::with_index(INVOKEVIRTUAL, method_ref)
    }

    pub fn invoke_special(method_ref: u16) -> Op {
        Op::with_index(INVOKESPECIAL, method_ref)
    }

    pub fn new_object(class: u16) -> Op {
        Op::with_index(NEW, class)
    }

    pub fn ldc(constant: u16) -> Op {
        match u8::try_from(constant) {
            Ok(small) => Op::Plain {
                opcode: LDC,
                operands: vec![small],
            },
            Err(_) => Op::with_index(LDC_W, constant),
        }
    }

    pub fn lload(slot: u16) -> Op {
        local_op(LLOAD, LLOAD_0, slot)
    }

    pub fn lstore(slot: u16) -> Op {
        local_op(LSTORE, LSTORE_0, slot)
    }

    fn encoded_len(&self, offset: u32) -> u32 {
        match self {
            Op::Plain { operands, .. } => 1 + operands.len() as u32,
            Op::Branch { opcode, .. } => {
                if is_wide_branch(*opcode) {
                    5
                } else {
                    3
                }
            }
            Op::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
            }
            Op::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
            }
        }
    }

    /// Every label this instruction can transfer control to.
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Op::Plain { .. } => Vec::new(),
            Op::Branch { target, .. } => vec![*target],
            Op::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Op::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, t)| *t))
                .collect(),
        }
    }
}

fn local_op(opcode: u8, short_base: u8, slot: u16) -> Op {
    if slot <= 3 {
        Op::simple(short_base + slot as u8)
    } else if let Ok(small) = u8::try_from(slot) {
        Op::Plain {
            opcode,
            operands: vec![small],
        }
    } else {
        let [hi, lo] = slot.to_be_bytes();
        Op::Plain {
            opcode: WIDE,
            operands: vec![opcode, hi, lo],
        }
    }
}

fn is_wide_branch(opcode: u8) -> bool {
    opcode == GOTO_W || opcode == JSR_W
}

/// The conditional jump that tests the opposite of `opcode`.
fn inverted_condition(opcode: u8) -> u8 {
    if opcode >= IFNULL {
        opcode ^ 1
    } else {
        ((opcode - IFEQ) ^ 1) + IFEQ
    }
}

fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

/// Operand bytes of fixed-length instructions that hold no code offsets.
fn operand_len(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 0,
        0x10 => 1,
        0x11 => 2,
        LDC => 1,
        LDC_W | LDC2_W => 2,
        ILOAD..=ALOAD => 1,
        0x1a..=0x35 => 0,
        ISTORE..=ASTORE => 1,
        0x3b..=0x83 => 0,
        IINC => 2,
        0x85..=0x98 => 0,
        RET => 1,
        IRETURN..=RETURN => 0,
        GETSTATIC..=INVOKESTATIC => 2,
        INVOKEINTERFACE | INVOKEDYNAMIC => 4,
        NEW => 2,
        0xbc => 1,
        0xbd => 2,
        0xbe | ATHROW => 0,
        0xc0 | 0xc1 => 2,
        0xc2 | 0xc3 => 0,
        MULTIANEWARRAY => 3,
        _ => return None,
    })
}

fn is_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=JSR | IFNULL | IFNONNULL | GOTO_W | JSR_W)
}

fn jump_label(pos: usize, delta: i64, code_len: usize) -> Result<u32, FormatError> {
    let target = pos as i64 + delta;
    if target < 0 || target >= code_len as i64 {
        return Err(FormatError::malformed(format!(
            "jump from {pos} to {target} leaves the code array"
        )));
    }
    Ok(target as u32)
}

pub fn decode_code(code: &[u8]) -> Result<Vec<Instruction>, FormatError> {
    let mut r = ByteReader::new(code);
    let mut instructions = Vec::new();

    while !r.is_empty() {
        let pos = r.position();
        let opcode = r.u8()?;
        let op = if let Some(len) = operand_len(opcode) {
            Op::Plain {
                opcode,
                operands: r.bytes(len)?.to_vec(),
            }
        } else if is_branch(opcode) {
            let delta = if is_wide_branch(opcode) {
                r.i32()? as i64
            } else {
                r.i16()? as i64
            };
            Op::Branch {
                opcode,
                target: jump_label(pos, delta, code.len())?,
            }
        } else if opcode == TABLESWITCH || opcode == LOOKUPSWITCH {
            r.bytes(switch_padding(pos as u32) as usize)?;
            let default = jump_label(pos, r.i32()? as i64, code.len())?;
            if opcode == TABLESWITCH {
                let low = r.i32()?;
                let high = r.i32()?;
                if high < low {
                    return Err(FormatError::malformed(format!(
                        "tableswitch at {pos} has high {high} < low {low}"
                    )));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count > code.len() {
                    return Err(FormatError::malformed("tableswitch larger than code"));
                }
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(jump_label(pos, r.i32()? as i64, code.len())?);
                }
                Op::TableSwitch {
                    default,
                    low,
                    targets,
                }
            } else {
                let npairs = r.i32()?;
                if npairs < 0 || npairs as usize > code.len() {
                    return Err(FormatError::malformed(format!(
                        "lookupswitch at {pos} has {npairs} pairs"
                    )));
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = r.i32()?;
                    pairs.push((key, jump_label(pos, r.i32()? as i64, code.len())?));
                }
                Op::LookupSwitch { default, pairs }
            }
        } else if opcode == WIDE {
            let widened = r.u8()?;
            let extra = match widened {
                IINC => 4,
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => 2,
                other => {
                    return Err(FormatError::malformed(format!(
                        "wide applied to opcode 0x{other:02x} at {pos}"
                    )));
                }
            };
            let mut operands = vec![widened];
            operands.extend_from_slice(r.bytes(extra)?);
            Op::Plain { opcode, operands }
        } else {
            return Err(FormatError::malformed(format!(
                "unknown opcode 0x{opcode:02x} at {pos}"
            )));
        };

        instructions.push(Instruction {
            label: Some(pos as u32),
            op,
        });
    }

    let boundaries: HashSet<u32> = instructions.iter().filter_map(|i| i.label).collect();
    for insn in &instructions {
        for target in insn.op.targets() {
            if !boundaries.contains(&target) {
                return Err(FormatError::malformed(format!(
                    "jump target {target} is not an instruction boundary"
                )));
            }
        }
    }

    Ok(instructions)
}

/// Positions of a re-laid-out instruction stream.
#[derive(Debug, Clone)]
pub struct Layout {
    pub offsets: Vec<u32>,
    labels: HashMap<u32, u32>,
    original_length: u32,
    pub code_length: u32,
}

impl Layout {
    pub fn compute(instructions: &[Instruction], original_length: u32) -> Self {
        let mut offsets = Vec::with_capacity(instructions.len());
        let mut labels = HashMap::with_capacity(instructions.len());
        let mut pos = 0u32;
        for insn in instructions {
            offsets.push(pos);
            if let Some(label) = insn.label {
                labels.insert(label, pos);
            }
            pos += insn.op.encoded_len(pos);
        }
        Self {
            offsets,
            labels,
            original_length,
            code_length: pos,
        }
    }

    /// New offset of an original offset; the original code length maps to
    /// the new code length.
    pub fn resolve(&self, label: u32) -> Option<u32> {
        if label == self.original_length {
            return Some(self.code_length);
        }
        self.labels.get(&label).copied()
    }

    fn resolve_or_err(&self, label: u32) -> Result<u32, FormatError> {
        self.resolve(label).ok_or_else(|| FormatError::Unencodable {
            method: String::new(),
            reason: format!("reference to offset {label}, which is not an instruction"),
        })
    }
}

/// Rewrites 16-bit branches whose displacement no longer fits, repeating
/// until the layout is stable. `goto` and `jsr` become `goto_w` and
/// `jsr_w`. A conditional jump becomes the opposite condition skipping
/// over a `goto_w` to the original target.
///
/// Returns the labels of the instructions that follow each such `goto_w`.
/// They are new jump targets; an instruction that had no label gets one
/// above `original_length`.
pub fn widen_branches(
    instructions: &mut Vec<Instruction>,
    original_length: u32,
) -> Result<Vec<u32>, FormatError> {
    let mut skips = Vec::new();
    let mut next_label = original_length + 1;
    loop {
        let layout = Layout::compute(instructions, original_length);
        let mut overflowing = Vec::new();
        for (i, (insn, &offset)) in instructions.iter().zip(&layout.offsets).enumerate() {
            if let Op::Branch { opcode, target } = &insn.op {
                let d = layout.resolve_or_err(*target)? as i64 - offset as i64;
                if !is_wide_branch(*opcode) && i16::try_from(d).is_err() {
                    overflowing.push((i, offset));
                }
            }
        }
        if overflowing.is_empty() {
            return Ok(skips);
        }

        for &(i, offset) in overflowing.iter().rev() {
            let Op::Branch { opcode, target } = instructions[i].op else {
                continue;
            };
            match opcode {
                GOTO => instructions[i].op = Op::Branch { opcode: GOTO_W, target },
                JSR => instructions[i].op = Op::Branch { opcode: JSR_W, target },
                _ => {
                    let next = instructions.get_mut(i + 1).ok_or_else(|| {
                        FormatError::Unencodable {
                            method: String::new(),
                            reason: format!("conditional branch at {offset} ends the code"),
                        }
                    })?;
                    let skip = match next.label {
                        Some(label) => label,
                        None => {
                            next.label = Some(next_label);
                            next_label += 1;
                            next_label - 1
                        }
                    };
                    instructions[i].op = Op::Branch {
                        opcode: inverted_condition(opcode),
                        target: skip,
                    };
                    let far = Instruction::new(Op::Branch {
                        opcode: GOTO_W,
                        target,
                    });
                    instructions.insert(i + 1, far);
                    skips.push(skip);
                }
            }
        }
    }
}

pub fn encode_code(instructions: &[Instruction], layout: &Layout) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(layout.code_length as usize);

    for (insn, &offset) in instructions.iter().zip(&layout.offsets) {
        let delta = |label: u32| -> Result<i64, FormatError> {
            Ok(layout.resolve_or_err(label)? as i64 - offset as i64)
        };
        out.push(insn.op.opcode());
        match &insn.op {
            Op::Plain { operands, .. } => out.extend_from_slice(operands),
            Op::Branch { opcode, target } => {
                let d = delta(*target)?;
                if is_wide_branch(*opcode) {
                    put_u32(&mut out, d as i32 as u32);
                } else {
                    let short = i16::try_from(d).map_err(|_| FormatError::Unencodable {
                        method: String::new(),
                        reason: format!("branch at {offset} needs displacement {d}"),
                    })?;
                    put_u16(&mut out, short as u16);
                }
            }
            Op::TableSwitch {
                default,
                low,
                targets,
            } => {
                out.resize(out.len() + switch_padding(offset) as usize, 0);
                put_u32(&mut out, delta(*default)? as i32 as u32);
                put_u32(&mut out, *low as u32);
                let high = *low as i64 + targets.len() as i64 - 1;
                put_u32(&mut out, high as i32 as u32);
                for t in targets {
                    put_u32(&mut out, delta(*t)? as i32 as u32);
                }
            }
            Op::LookupSwitch { default, pairs } => {
                out.resize(out.len() + switch_padding(offset) as usize, 0);
                put_u32(&mut out, delta(*default)? as i32 as u32);
                put_u32(&mut out, pairs.len() as u32);
                for (key, t) in pairs {
                    put_u32(&mut out, *key as u32);
                    put_u32(&mut out, delta(*t)? as i32 as u32);
                }
            }
        }
    }

    Ok(out)
}
