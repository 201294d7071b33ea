//! Operand stack depth analysis used to recompute `max_stack` after code
//! has been inserted.

use std::collections::HashMap;

use crate::bytecode::opcodes::*;
use crate::bytecode::{Instruction, Op};
use crate::constant_pool::ConstantPool;
use crate::descriptor::{MethodDescriptor, slot_size};
use crate::error::FormatError;

/// Walks every path from the method entry and from each handler, tracking
/// the stack depth in slots, and returns the deepest point reached.
/// `handlers` are handler labels; a handler starts with one value (the
/// exception) on the stack.
pub fn compute(
    instructions: &[Instruction],
    handlers: &[u32],
    pool: &ConstantPool,
) -> Result<u16, FormatError> {
    let index_of: HashMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| insn.label.map(|l| (l, i)))
        .collect();
    let lookup = |label: u32| -> Result<usize, FormatError> {
        index_of
            .get(&label)
            .copied()
            .ok_or_else(|| FormatError::malformed(format!("no instruction at offset {label}")))
    };

    let mut depth_at: Vec<Option<i32>> = vec![None; instructions.len()];
    let mut work: Vec<(usize, i32)> = Vec::new();
    if !instructions.is_empty() {
        work.push((0, 0));
    }
    for &h in handlers {
        work.push((lookup(h)?, 1));
    }

    let mut max = 0i32;
    while let Some((start, entry_depth)) = work.pop() {
        let mut i = start;
        let mut depth = entry_depth;
        loop {
            if depth_at[i].is_some() {
                break;
            }
            depth_at[i] = Some(depth);
            max = max.max(depth);

            let op = &instructions[i].op;
            depth += stack_delta(op, pool)?;
            if depth < 0 {
                return Err(FormatError::malformed(format!(
                    "operand stack underflow at instruction {i}"
                )));
            }
            max = max.max(depth);

            let opcode = op.opcode();
            match op {
                Op::Branch { target, .. } => {
                    let t = lookup(*target)?;
                    if opcode == JSR || opcode == JSR_W {
                        // the subroutine sees the return address; the caller
                        // resumes after it with the address consumed
                        work.push((t, depth));
                        depth -= 1;
                    } else {
                        work.push((t, depth));
                        if opcode == GOTO || opcode == GOTO_W {
                            break;
                        }
                    }
                }
                Op::TableSwitch { .. } | Op::LookupSwitch { .. } => {
                    for t in op.targets() {
                        work.push((lookup(t)?, depth));
                    }
                    break;
                }
                Op::Plain { .. } => {
                    if op.is_exit() || opcode == RET || is_wide_ret(op) {
                        break;
                    }
                }
            }

            i += 1;
            if i >= instructions.len() {
                break;
            }
        }
    }

    u16::try_from(max).map_err(|_| FormatError::Unencodable {
        method: String::new(),
        reason: format!("operand stack depth {max} exceeds 65535"),
    })
}

fn is_wide_ret(op: &Op) -> bool {
    matches!(op, Op::Plain { opcode: WIDE, operands } if operands.first() == Some(&RET))
}

fn cp_index(operands: &[u8]) -> u16 {
    u16::from_be_bytes([operands[0], operands[1]])
}

/// Net change of the operand stack, in slots, for one instruction.
fn stack_delta(op: &Op, pool: &ConstantPool) -> Result<i32, FormatError> {
    let opcode = op.opcode();
    let operands: &[u8] = match op {
        Op::Plain { operands, .. } => operands,
        _ => &[],
    };

    Ok(match opcode {
        0x00 => 0,
        0x01..=0x08 => 1,
        0x09 | 0x0a => 2,
        0x0b..=0x0d => 1,
        0x0e | 0x0f => 2,
        0x10 | 0x11 => 1,
        LDC | LDC_W => 1,
        LDC2_W => 2,
        ILOAD | 0x17 | ALOAD => 1,
        LLOAD | 0x18 => 2,
        0x1a..=0x1d => 1,
        0x1e..=0x21 => 2,
        0x22..=0x25 => 1,
        0x26..=0x29 => 2,
        0x2a..=0x2d => 1,
        0x2e | 0x30 | 0x32..=0x35 => -1,
        0x2f | 0x31 => 0,
        ISTORE | 0x38 | ASTORE => -1,
        LSTORE | 0x39 => -2,
        0x3b..=0x3e => -1,
        0x3f..=0x42 => -2,
        0x43..=0x46 => -1,
        0x47..=0x4a => -2,
        0x4b..=0x4e => -1,
        0x4f | 0x51 | 0x53..=0x56 => -3,
        0x50 | 0x52 => -4,
        POP => -1,
        0x58 => -2,
        DUP..=0x5b => 1,
        0x5c..=0x5e => 2,
        0x5f => 0,
        // add, sub, mul, div, rem: int/float pop one slot, long/double two
        0x60..=0x73 => {
            if (opcode - 0x60) % 2 == 0 {
                -1
            } else {
                -2
            }
        }
        0x74..=0x77 => 0,
        0x78..=0x7d => -1,
        0x7e | 0x80 | 0x82 => -1,
        0x7f | 0x81 | 0x83 => -2,
        IINC => 0,
        0x85 | 0x87 | 0x8c | 0x8d => 1,
        0x86 | 0x8a | 0x8b | 0x8f | 0x91..=0x93 => 0,
        0x88 | 0x89 | 0x8e | 0x90 => -1,
        0x94 | 0x97 | 0x98 => -3,
        0x95 | 0x96 => -1,
        0x99..=0x9e => -1,
        0x9f..=0xa6 => -2,
        GOTO => 0,
        JSR => 1,
        RET => 0,
        TABLESWITCH | LOOKUPSWITCH => -1,
        IRETURN | 0xae | 0xb0 => -1,
        0xad | 0xaf => -2,
        RETURN => 0,
        GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
            let field = pool.member_ref(cp_index(operands))?;
            let size = slot_size(&field.descriptor) as i32;
            match opcode {
                GETSTATIC => size,
                PUTSTATIC => -size,
                GETFIELD => size - 1,
                _ => -size - 1,
            }
        }
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
            let method = pool.member_ref(cp_index(operands))?;
            let desc = MethodDescriptor::parse(&method.descriptor)?;
            let receiver = if opcode == INVOKESTATIC { 0 } else { 1 };
            desc.return_slots() as i32 - desc.param_slots() as i32 - receiver
        }
        INVOKEDYNAMIC => {
            let desc = MethodDescriptor::parse(&pool.dynamic_descriptor(cp_index(operands))?)?;
            desc.return_slots() as i32 - desc.param_slots() as i32
        }
        NEW => 1,
        0xbc | 0xbd | 0xbe => 0,
        ATHROW => 0,
        0xc0 | 0xc1 => 0,
        0xc2 | 0xc3 => -1,
        WIDE => match operands.first().copied() {
            Some(ILOAD) | Some(0x17) | Some(ALOAD) => 1,
            Some(LLOAD) | Some(0x18) => 2,
            Some(ISTORE) | Some(0x38) | Some(ASTORE) => -1,
            Some(LSTORE) | Some(0x39) => -2,
            _ => 0,
        },
        MULTIANEWARRAY => 1 - operands[2] as i32,
        IFNULL | IFNONNULL => -1,
        GOTO_W => 0,
        JSR_W => 1,
        other => {
            return Err(FormatError::malformed(format!(
                "no stack effect for opcode 0x{other:02x}"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode_code;

    #[test]
    fn straight_line_long_arithmetic() {
        // lconst_1; lconst_1; ladd; pop2; return
        let insns = decode_code(&[0x0a, 0x0a, 0x61, 0x58, RETURN]).unwrap();
        let pool = ConstantPool::new();
        assert_eq!(compute(&insns, &[], &pool).unwrap(), 4);
    }

    #[test]
    fn invoke_uses_descriptor_sizes() {
        let mut pool = ConstantPool::new();
        let millis = pool
            .intern_method_ref("java/lang/System", "currentTimeMillis", "()J")
            .unwrap();
        let [hi, lo] = millis.to_be_bytes();
        // invokestatic currentTimeMillis; pop2; return
        let insns = decode_code(&[INVOKESTATIC, hi, lo, 0x58, RETURN]).unwrap();
        assert_eq!(compute(&insns, &[], &pool).unwrap(), 2);
    }

    #[test]
    fn handlers_start_with_one_value() {
        // return; astore_1; aconst_null; athrow  (handler at 1)
        let insns = decode_code(&[RETURN, 0x4c, 0x01, ATHROW]).unwrap();
        let pool = ConstantPool::new();
        assert_eq!(compute(&insns, &[1], &pool).unwrap(), 1);
    }

    #[test]
    fn branches_merge_depths() {
        // iconst_0; ifeq +5 (to return); iconst_1; pop; return
        let insns = decode_code(&[0x03, 0x99, 0x00, 0x05, 0x04, 0x57, RETURN]).unwrap();
        let pool = ConstantPool::new();
        assert_eq!(compute(&insns, &[], &pool).unwrap(), 1);
    }

    #[test]
    fn underflow_is_malformed() {
        let insns = decode_code(&[POP, RETURN]).unwrap();
        let pool = ConstantPool::new();
        assert!(compute(&insns, &[], &pool).is_err());
    }
}
