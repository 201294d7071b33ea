//! Forward verification-type simulation over straight-line code.
//!
//! Widening a conditional branch (see [`crate::bytecode::widen_branches`])
//! makes the instruction after the new `goto_w` a jump target, and with a
//! StackMapTable every jump target needs a frame. The frame is derived by
//! replaying the instructions between the nearest earlier frame and that
//! point.

use std::collections::HashMap;

use crate::bytecode::opcodes::*;
use crate::bytecode::{Instruction, Op};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::MethodDescriptor;
use crate::error::FormatError;
use crate::frames::{Frame, VerificationType};

/// Placeholder label for objects created by an inserted (unlabelled) `new`.
const UNLABELLED: u32 = u32::MAX;

fn unencodable(reason: impl Into<String>) -> FormatError {
    FormatError::Unencodable {
        method: String::new(),
        reason: reason.into(),
    }
}

fn cp_index(operands: &[u8]) -> Result<u16, FormatError> {
    match operands {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(FormatError::malformed("missing constant pool index")),
    }
}

fn is_category2(vt: &VerificationType) -> bool {
    vt.slots() == 2
}

/// One entry per slot: a long or double is followed by `Top`.
fn expand(types: &[VerificationType]) -> Vec<VerificationType> {
    let mut slots = Vec::with_capacity(types.len());
    for vt in types {
        slots.push(vt.clone());
        if is_category2(vt) {
            slots.push(VerificationType::Top);
        }
    }
    slots
}

fn compact(slots: &[VerificationType]) -> Vec<VerificationType> {
    let mut types = Vec::with_capacity(slots.len());
    let mut i = 0;
    while i < slots.len() {
        types.push(slots[i].clone());
        i += slots[i].slots() as usize;
    }
    types
}

struct State<'a> {
    pool: &'a ConstantPool,
    this_class: &'a str,
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

impl State<'_> {
    fn push(&mut self, vt: VerificationType) {
        let wide = is_category2(&vt);
        self.stack.push(vt);
        if wide {
            self.stack.push(VerificationType::Top);
        }
    }

    fn pop_slot(&mut self) -> Result<VerificationType, FormatError> {
        self.stack
            .pop()
            .ok_or_else(|| FormatError::malformed("operand stack underflow"))
    }

    /// Pops one value of either category.
    fn pop(&mut self) -> Result<VerificationType, FormatError> {
        let top = self.pop_slot()?;
        if top == VerificationType::Top && self.stack.last().is_some_and(is_category2) {
            return self.pop_slot();
        }
        Ok(top)
    }

    fn pop_values(&mut self, n: usize) -> Result<(), FormatError> {
        for _ in 0..n {
            self.pop()?;
        }
        Ok(())
    }

    fn load(&mut self, slot: u16) -> Result<(), FormatError> {
        let vt = self
            .locals
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| FormatError::malformed(format!("load from unset local {slot}")))?;
        self.push(vt);
        Ok(())
    }

    fn store(&mut self, slot: u16) -> Result<(), FormatError> {
        let vt = self.pop()?;
        let slot = slot as usize;
        let end = slot + vt.slots() as usize;
        if self.locals.len() < end {
            self.locals.resize(end, VerificationType::Top);
        }
        if slot > 0 && is_category2(&self.locals[slot - 1]) {
            self.locals[slot - 1] = VerificationType::Top;
        }
        if is_category2(&vt) {
            self.locals[slot + 1] = VerificationType::Top;
        }
        self.locals[slot] = vt;
        Ok(())
    }

    fn constant(&self, index: u16) -> Result<VerificationType, FormatError> {
        let object = |name: &str| VerificationType::Object(name.to_string());
        Ok(match self.pool.get(index)? {
            Constant::Integer(_) => VerificationType::Integer,
            Constant::Float(_) => VerificationType::Float,
            Constant::Long(_) => VerificationType::Long,
            Constant::Double(_) => VerificationType::Double,
            Constant::String(_) => object("java/lang/String"),
            Constant::Class(_) => object("java/lang/Class"),
            Constant::MethodType(_) => object("java/lang/invoke/MethodType"),
            Constant::MethodHandle { .. } => object("java/lang/invoke/MethodHandle"),
            Constant::Dynamic { .. } => {
                VerificationType::of_field(&self.pool.dynamic_descriptor(index)?)
            }
            other => {
                return Err(FormatError::malformed(format!(
                    "constant {index} cannot be loaded: {other:?}"
                )));
            }
        })
    }

    fn invoke(&mut self, opcode: u8, operands: &[u8]) -> Result<(), FormatError> {
        let index = cp_index(operands)?;
        if opcode == INVOKEDYNAMIC {
            let desc = MethodDescriptor::parse(&self.pool.dynamic_descriptor(index)?)?;
            self.pop_values(desc.params.len())?;
            if let Some(ret) = &desc.ret {
                self.push(VerificationType::of_field(ret));
            }
            return Ok(());
        }

        let method = self.pool.member_ref(index)?;
        let desc = MethodDescriptor::parse(&method.descriptor)?;
        self.pop_values(desc.params.len())?;
        if opcode != INVOKESTATIC {
            let receiver = self.pop()?;
            if opcode == INVOKESPECIAL && method.name == "<init>" {
                let initialized = match &receiver {
                    VerificationType::UninitializedThis => {
                        VerificationType::Object(self.this_class.to_string())
                    }
                    VerificationType::Uninitialized(_) => VerificationType::Object(method.owner),
                    _ => receiver.clone(),
                };
                for vt in self.locals.iter_mut().chain(self.stack.iter_mut()) {
                    if *vt == receiver {
                        *vt = initialized.clone();
                    }
                }
            }
        }
        if let Some(ret) = &desc.ret {
            self.push(VerificationType::of_field(ret));
        }
        Ok(())
    }

    fn step(&mut self, insn: &Instruction) -> Result<(), FormatError> {
        use VerificationType::{Double, Float, Integer, Long, Null};

        let opcode = insn.op.opcode();
        let operands: &[u8] = match &insn.op {
            Op::Plain { operands, .. } => operands,
            _ => &[],
        };
        let slot = || -> Result<u16, FormatError> {
            operands
                .first()
                .map(|s| *s as u16)
                .ok_or_else(|| FormatError::malformed("missing local index"))
        };

        match opcode {
            0x00 => {}
            0x01 => self.push(Null),
            0x02..=0x08 | 0x10 | 0x11 => self.push(Integer),
            0x09 | 0x0a => self.push(Long),
            0x0b..=0x0d => self.push(Float),
            0x0e | 0x0f => self.push(Double),
            LDC => {
                let index = operands.first().copied().unwrap_or_default() as u16;
                let vt = self.constant(index)?;
                self.push(vt);
            }
            LDC_W | LDC2_W => {
                let vt = self.constant(cp_index(operands)?)?;
                self.push(vt);
            }
            ILOAD => self.push(Integer),
            LLOAD => self.push(Long),
            0x17 => self.push(Float),
            0x18 => self.push(Double),
            ALOAD => self.load(slot()?)?,
            0x1a..=0x1d => self.push(Integer),
            0x1e..=0x21 => self.push(Long),
            0x22..=0x25 => self.push(Float),
            0x26..=0x29 => self.push(Double),
            0x2a..=0x2d => self.load((opcode - 0x2a) as u16)?,
            0x2e | 0x33..=0x35 => {
                self.pop_values(2)?;
                self.push(Integer);
            }
            0x2f => {
                self.pop_values(2)?;
                self.push(Long);
            }
            0x30 => {
                self.pop_values(2)?;
                self.push(Float);
            }
            0x31 => {
                self.pop_values(2)?;
                self.push(Double);
            }
            0x32 => {
                self.pop()?;
                let element = match self.pop()? {
                    VerificationType::Object(desc) if desc.starts_with('[') => {
                        VerificationType::of_field(&desc[1..])
                    }
                    _ => Null,
                };
                self.push(element);
            }
            ISTORE..=ASTORE => self.store(slot()?)?,
            0x3b..=0x4e => self.store(((opcode - 0x3b) % 4) as u16)?,
            0x4f..=0x56 => self.pop_values(3)?,
            POP => {
                self.pop_slot()?;
            }
            0x58 => {
                self.pop_slot()?;
                self.pop_slot()?;
            }
            DUP..=0x5e => {
                // dup, dup_x1, dup_x2 copy one slot; the dup2 forms copy two
                let (width, depth) = match opcode {
                    DUP => (1, 0),
                    0x5a => (1, 1),
                    0x5b => (1, 2),
                    0x5c => (2, 0),
                    0x5d => (2, 1),
                    _ => (2, 2),
                };
                let len = self.stack.len();
                if len < width + depth {
                    return Err(FormatError::malformed("operand stack underflow"));
                }
                let copied = self.stack[len - width..].to_vec();
                let at = len - width - depth;
                self.stack.splice(at..at, copied);
            }
            0x5f => {
                let a = self.pop_slot()?;
                let b = self.pop_slot()?;
                self.stack.push(a);
                self.stack.push(b);
            }
            0x60..=0x73 => {
                self.pop_values(2)?;
                self.push([Integer, Long, Float, Double][((opcode - 0x60) % 4) as usize].clone());
            }
            0x74..=0x77 => {
                let vt = self.pop()?;
                self.push(vt);
            }
            0x78..=0x83 => {
                self.pop_values(2)?;
                self.push(if opcode % 2 == 0 { Integer } else { Long });
            }
            IINC => {}
            0x85..=0x93 => {
                self.pop()?;
                self.push(match opcode {
                    0x85 | 0x8c | 0x8f => Long,
                    0x86 | 0x89 | 0x90 => Float,
                    0x87 | 0x8a | 0x8d => Double,
                    _ => Integer,
                });
            }
            0x94..=0x98 => {
                self.pop_values(2)?;
                self.push(Integer);
            }
            0x99..=0x9e | IFNULL | IFNONNULL => self.pop_values(1)?,
            0x9f..=0xa6 => self.pop_values(2)?,
            GOTO | GOTO_W => {}
            TABLESWITCH | LOOKUPSWITCH => self.pop_values(1)?,
            GETSTATIC | GETFIELD => {
                let field = self.pool.member_ref(cp_index(operands)?)?;
                if opcode == GETFIELD {
                    self.pop()?;
                }
                self.push(VerificationType::of_field(&field.descriptor));
            }
            PUTSTATIC => self.pop_values(1)?,
            PUTFIELD => self.pop_values(2)?,
            INVOKEVIRTUAL..=INVOKEDYNAMIC => self.invoke(opcode, operands)?,
            NEW => self.push(VerificationType::Uninitialized(
                insn.label.unwrap_or(UNLABELLED),
            )),
            0xbc => {
                self.pop()?;
                let array = match operands.first() {
                    Some(4) => "[Z",
                    Some(5) => "[C",
                    Some(6) => "[F",
                    Some(7) => "[D",
                    Some(8) => "[B",
                    Some(9) => "[S",
                    Some(10) => "[I",
                    Some(11) => "[J",
                    other => {
                        return Err(FormatError::malformed(format!(
                            "newarray with element type {other:?}"
                        )));
                    }
                };
                self.push(VerificationType::Object(array.to_string()));
            }
            0xbd => {
                self.pop()?;
                let element = self.pool.class_name(cp_index(operands)?)?;
                let array = if element.starts_with('[') {
                    format!("[{element}")
                } else {
                    format!("[L{element};")
                };
                self.push(VerificationType::Object(array));
            }
            0xbe | 0xc1 => {
                self.pop()?;
                self.push(Integer);
            }
            0xc0 => {
                self.pop()?;
                let class = self.pool.class_name(cp_index(operands)?)?;
                self.push(VerificationType::Object(class));
            }
            0xc2 | 0xc3 => self.pop_values(1)?,
            WIDE => {
                let widened = operands.first().copied().unwrap_or_default();
                let index = cp_index(operands.get(1..).unwrap_or_default())?;
                match widened {
                    ILOAD => self.push(Integer),
                    LLOAD => self.push(Long),
                    0x17 => self.push(Float),
                    0x18 => self.push(Double),
                    ALOAD => self.load(index)?,
                    ISTORE..=ASTORE => self.store(index)?,
                    IINC => {}
                    other => {
                        return Err(unencodable(format!(
                            "cannot derive a frame across wide opcode 0x{other:02x}"
                        )));
                    }
                }
            }
            MULTIANEWARRAY => {
                let dims = operands.get(2).copied().unwrap_or_default();
                self.pop_values(dims as usize)?;
                let class = self.pool.class_name(cp_index(operands)?)?;
                self.push(VerificationType::Object(class));
            }
            other => {
                return Err(unencodable(format!(
                    "cannot derive a frame across opcode 0x{other:02x}"
                )));
            }
        }
        Ok(())
    }
}

/// Frames for the instructions carrying `labels`, each reached by falling
/// through from the instruction before it. Replay starts at the nearest
/// earlier instruction that has a frame in `frames`, or at the method
/// entry with `initial` locals. Labels that already have a frame are
/// skipped.
pub(crate) fn fall_through_frames(
    instructions: &[Instruction],
    labels: &[u32],
    frames: &[Frame],
    initial: &[VerificationType],
    this_class: &str,
    pool: &ConstantPool,
) -> Result<Vec<Frame>, FormatError> {
    let by_label: HashMap<u32, &Frame> = frames.iter().map(|f| (f.label, f)).collect();
    let index_of: HashMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| insn.label.map(|l| (l, i)))
        .collect();

    let mut derived = Vec::new();
    for &label in labels {
        if by_label.contains_key(&label) {
            continue;
        }
        let target = *index_of
            .get(&label)
            .ok_or_else(|| unencodable(format!("no instruction at offset {label}")))?;

        let start = (0..target)
            .rev()
            .find(|&i| instructions[i].label.is_some_and(|l| by_label.contains_key(&l)));
        let mut state = State {
            pool,
            this_class,
            locals: Vec::new(),
            stack: Vec::new(),
        };
        let from = match start {
            Some(i) => {
                let frame = instructions[i]
                    .label
                    .and_then(|l| by_label.get(&l))
                    .ok_or_else(|| unencodable("frame lookup failed"))?;
                state.locals = expand(&frame.locals);
                state.stack = expand(&frame.stack);
                i
            }
            None => {
                state.locals = expand(initial);
                0
            }
        };

        for insn in &instructions[from..target] {
            state.step(insn)?;
        }

        while state.locals.last() == Some(&VerificationType::Top) {
            state.locals.pop();
        }
        let frame = Frame {
            label,
            locals: compact(&state.locals),
            stack: compact(&state.stack),
        };
        let pending = VerificationType::Uninitialized(UNLABELLED);
        if frame.locals.contains(&pending) || frame.stack.contains(&pending) {
            return Err(unencodable(format!(
                "object created by inserted code is still uninitialized at offset {label}"
            )));
        }
        derived.push(frame);
    }
    Ok(derived)
}
