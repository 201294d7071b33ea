//! StackMapTable handling.
//!
//! Frames are expanded on decode (every frame carries its complete locals
//! and stack) so that a new local slot can be added to each of them and
//! so that they can be re-emitted as `full_frame`s at relocated offsets.

use crate::bytecode::Layout;
use crate::constant_pool::ConstantPool;
use crate::descriptor::{MethodDescriptor, class_name_of};
use crate::error::FormatError;
use crate::reader::{ByteReader, put_u16};

pub const ACC_STATIC: u16 = 0x0008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Internal class name (or array descriptor).
    Object(String),
    /// Label of the `new` instruction that created the value.
    Uninitialized(u32),
}

impl VerificationType {
    pub fn slots(&self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }

    pub(crate) fn of_field(desc: &str) -> VerificationType {
        match desc.as_bytes().first() {
            Some(b'J') => VerificationType::Long,
            Some(b'D') => VerificationType::Double,
            Some(b'F') => VerificationType::Float,
            Some(b'L') | Some(b'[') => {
                VerificationType::Object(class_name_of(desc).unwrap_or(desc).to_string())
            }
            _ => VerificationType::Integer,
        }
    }

    fn decode(r: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<Self, FormatError> {
        Ok(match r.u8()? {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(pool.class_name(r.u16()?)?),
            8 => VerificationType::Uninitialized(r.u16()? as u32),
            tag => {
                return Err(FormatError::malformed(format!(
                    "unknown verification type tag {tag}"
                )));
            }
        })
    }

    fn encode(
        &self,
        out: &mut Vec<u8>,
        layout: &Layout,
        pool: &mut ConstantPool,
    ) -> Result<(), FormatError> {
        match self {
            VerificationType::Top => out.push(0),
            VerificationType::Integer => out.push(1),
            VerificationType::Float => out.push(2),
            VerificationType::Double => out.push(3),
            VerificationType::Long => out.push(4),
            VerificationType::Null => out.push(5),
            VerificationType::UninitializedThis => out.push(6),
            VerificationType::Object(name) => {
                out.push(7);
                put_u16(out, pool.intern_class(name)?);
            }
            VerificationType::Uninitialized(label) => {
                let offset = layout.resolve(*label).ok_or_else(|| FormatError::Unencodable {
                    method: String::new(),
                    reason: format!("uninitialized type refers to unknown offset {label}"),
                })?;
                out.push(8);
                put_u16(out, offset as u16);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub label: u32,
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

/// The implicit frame at offset 0, derived from the method signature.
pub fn initial_locals(
    this_class: &str,
    method_name: &str,
    access_flags: u16,
    descriptor: &MethodDescriptor,
) -> Vec<VerificationType> {
    let mut locals = Vec::with_capacity(descriptor.params.len() + 1);
    if access_flags & ACC_STATIC == 0 {
        if method_name == "<init>" && this_class != "java/lang/Object" {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(this_class.to_string()));
        }
    }
    locals.extend(descriptor.params.iter().map(|p| VerificationType::of_field(p)));
    locals
}

/// Places `vt` at local `slot`, padding any gap with `Top`. Frame locals
/// never reach `slot` when it is the method's previous `max_locals`.
pub fn insert_local(locals: &mut Vec<VerificationType>, slot: u16, vt: VerificationType) {
    let mut used: u32 = locals.iter().map(|l| l.slots() as u32).sum();
    while used < slot as u32 {
        locals.push(VerificationType::Top);
        used += 1;
    }
    locals.push(vt);
}

pub(crate) fn decode_stack_map(
    data: &[u8],
    pool: &ConstantPool,
    initial: &[VerificationType],
) -> Result<Vec<Frame>, FormatError> {
    let mut r = ByteReader::new(data);
    let count = r.u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut locals = initial.to_vec();
    let mut offset: Option<u32> = None;

    for _ in 0..count {
        let frame_type = r.u8()?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u32, Vec::new()),
            64..=127 => (
                (frame_type - 64) as u32,
                vec![VerificationType::decode(&mut r, pool)?],
            ),
            247 => {
                let delta = r.u16()? as u32;
                (delta, vec![VerificationType::decode(&mut r, pool)?])
            }
            248..=250 => {
                let delta = r.u16()? as u32;
                let chop = (251 - frame_type) as usize;
                if chop > locals.len() {
                    return Err(FormatError::malformed("chop_frame removes missing locals"));
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            251 => (r.u16()? as u32, Vec::new()),
            252..=254 => {
                let delta = r.u16()? as u32;
                for _ in 0..(frame_type - 251) {
                    locals.push(VerificationType::decode(&mut r, pool)?);
                }
                (delta, Vec::new())
            }
            255 => {
                let delta = r.u16()? as u32;
                let nlocals = r.u16()?;
                locals = (0..nlocals)
                    .map(|_| VerificationType::decode(&mut r, pool))
                    .collect::<Result<_, _>>()?;
                let nstack = r.u16()?;
                let stack = (0..nstack)
                    .map(|_| VerificationType::decode(&mut r, pool))
                    .collect::<Result<_, _>>()?;
                (delta, stack)
            }
            reserved => {
                return Err(FormatError::malformed(format!(
                    "reserved stack map frame type {reserved}"
                )));
            }
        };

        let label = match offset {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        offset = Some(label);
        frames.push(Frame {
            label,
            locals: locals.clone(),
            stack,
        });
    }

    if !r.is_empty() {
        return Err(FormatError::malformed("trailing bytes after StackMapTable"));
    }
    Ok(frames)
}

/// Writes `frames` as a StackMapTable body of `full_frame`s positioned by
/// `layout`.
pub(crate) fn encode_stack_map(
    frames: &[Frame],
    layout: &Layout,
    pool: &mut ConstantPool,
) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::new();
    put_u16(&mut out, frames.len() as u16);
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = layout.resolve(frame.label).ok_or_else(|| FormatError::Unencodable {
            method: String::new(),
            reason: format!("stack map frame at unknown offset {}", frame.label),
        })?;
        let delta = match previous {
            None => offset,
            Some(prev) if offset > prev => offset - prev - 1,
            Some(prev) => {
                return Err(FormatError::Unencodable {
                    method: String::new(),
                    reason: format!("stack map frames out of order ({prev} then {offset})"),
                });
            }
        };
        previous = Some(offset);

        out.push(255);
        put_u16(&mut out, delta as u16);
        put_u16(&mut out, frame.locals.len() as u16);
        for vt in &frame.locals {
            vt.encode(&mut out, layout, pool)?;
        }
        put_u16(&mut out, frame.stack.len() as u16);
        for vt in &frame.stack {
            vt.encode(&mut out, layout, pool)?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, Op};

    fn pool_with_object() -> (ConstantPool, u16) {
        let mut pool = ConstantPool::new();
        let idx = pool.intern_class("java/lang/Object").unwrap();
        (pool, idx)
    }

    #[test]
    fn initial_frame_of_instance_method() {
        let d = MethodDescriptor::parse("(JLjava/lang/String;[I)V").unwrap();
        let locals = initial_locals("a/B", "onCreate", 0x0001, &d);
        assert_eq!(
            locals,
            vec![
                VerificationType::Object("a/B".into()),
                VerificationType::Long,
                VerificationType::Object("java/lang/String".into()),
                VerificationType::Object("[I".into()),
            ]
        );
        let statik = initial_locals("a/B", "run", ACC_STATIC, &d);
        assert_eq!(statik.len(), 3);
        let ctor = initial_locals("a/B", "<init>", 0, &MethodDescriptor::parse("()V").unwrap());
        assert_eq!(ctor, vec![VerificationType::UninitializedThis]);
    }

    #[test]
    fn compressed_frames_expand_against_previous_frame() {
        let (pool, object) = pool_with_object();
        let initial = vec![VerificationType::Object("a/B".into())];
        let mut data = vec![0x00, 0x04];
        data.extend_from_slice(&[252, 0x00, 0x03, 1]); // append int at 3
        data.extend_from_slice(&[64 + 2, 7]); // same_locals_1 at 6
        data.extend_from_slice(&object.to_be_bytes());
        data.push(250); // chop 1 at 10
        data.extend_from_slice(&[0x00, 0x03]);
        data.push(0); // same at 11

        let frames = decode_stack_map(&data, &pool, &initial).unwrap();
        let labels: Vec<u32> = frames.iter().map(|f| f.label).collect();
        assert_eq!(labels, vec![3, 6, 10, 11]);
        assert_eq!(frames[0].locals.len(), 2);
        assert_eq!(
            frames[1].stack,
            vec![VerificationType::Object("java/lang/Object".into())]
        );
        assert_eq!(frames[2].locals, initial);
        assert!(frames[3].stack.is_empty());
    }

    #[test]
    fn insert_local_pads_with_top() {
        let mut locals = vec![VerificationType::Object("a/B".into()), VerificationType::Long];
        insert_local(&mut locals, 5, VerificationType::Long);
        assert_eq!(
            locals,
            vec![
                VerificationType::Object("a/B".into()),
                VerificationType::Long,
                VerificationType::Top,
                VerificationType::Top,
                VerificationType::Long,
            ]
        );
    }

    #[test]
    fn full_frames_round_trip_at_new_offsets() {
        let (mut pool, _) = pool_with_object();
        let insns = vec![
            Instruction::new(Op::simple(0x00)),
            Instruction {
                label: Some(0),
                op: Op::simple(0x00),
            },
            Instruction {
                label: Some(1),
                op: Op::simple(0xb1),
            },
        ];
        let layout = Layout::compute(&insns, 2);
        let frames = vec![Frame {
            label: 1,
            locals: vec![VerificationType::Object("a/B".into())],
            stack: vec![],
        }];

        let data = encode_stack_map(&frames, &layout, &mut pool).unwrap();
        assert_eq!(data[2], 255);
        let back = decode_stack_map(&data, &pool, &[]).unwrap();
        assert_eq!(back[0].label, 2);
        assert_eq!(back[0].locals, frames[0].locals);
    }
}
