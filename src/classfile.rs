//! Structural class file model.
//!
//! `decode` turns raw bytes into a [`ClassUnit`] whose methods expose their
//! instruction stream, exit points, local slot count and expanded stack map
//! frames. `encode` writes the unit back. Anything not modified (fields,
//! class attributes, methods whose code was not touched) is re-emitted
//! from its original bytes, so a unit that went through decode and encode
//! without changes comes out byte-identical.

use std::collections::HashSet;

use serde::Serialize;

use crate::bytecode::{Instruction, Layout, Op, decode_code, encode_code, widen_branches};
use crate::constant_pool::ConstantPool;
use crate::descriptor::MethodDescriptor;
use crate::error::FormatError;
use crate::frames::{
    Frame, VerificationType, decode_stack_map, encode_stack_map, initial_locals, insert_local,
};
use crate::max_stack;
use crate::typeflow;
use crate::reader::{ByteReader, put_u16, put_u32};

pub const MAGIC: u32 = 0xCAFE_BABE;

const MAX_CODE_LENGTH: u32 = 65535;

const STACK_MAP_TABLE: &str = "StackMapTable";
const LINE_NUMBER_TABLE: &str = "LineNumberTable";
const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
/// Code attributes holding offsets this codec does not relocate; they are
/// dropped from rewritten methods.
const UNRELOCATED_CODE_ATTRIBUTES: [&str; 2] = [
    "RuntimeVisibleTypeAnnotations",
    "RuntimeInvisibleTypeAnnotations",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        Ok(Self {
            name_index,
            info: r.bytes(len)?.to_vec(),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        write_attribute(out, self.name_index, &self.info);
    }
}

fn write_attribute(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    put_u16(out, name_index);
    put_u32(out, info.len() as u32);
    out.extend_from_slice(info);
}

fn decode_attributes(r: &mut ByteReader<'_>) -> Result<Vec<Attribute>, FormatError> {
    let count = r.u16()?;
    (0..count).map(|_| Attribute::decode(r)).collect()
}

/// Fields are carried through untouched.
#[derive(Debug, Clone)]
struct Field {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub catch_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start: u32,
    pub line: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: u32,
    pub end: u32,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttribute {
    StackMapTable {
        name_index: u16,
        frames: Vec<Frame>,
    },
    LineNumberTable {
        name_index: u16,
        entries: Vec<LineNumber>,
    },
    /// `LocalVariableTable` or `LocalVariableTypeTable`; both share a layout.
    LocalVariables {
        name_index: u16,
        entries: Vec<LocalVariable>,
    },
    Other(Attribute),
}

#[derive(Debug, Clone)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
    pub attributes: Vec<CodeAttribute>,
    original_length: u32,
    /// Locals of the implicit frame at the method entry.
    initial: Vec<VerificationType>,
    modified: bool,
}

impl Code {
    /// Indices of the instructions where control leaves the method, both
    /// normal returns and `athrow`.
    pub fn exit_points(&self) -> Vec<usize> {
        self.instructions
            .iter()
            .enumerate()
            .filter(|(_, insn)| insn.op.is_exit())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn frames(&self) -> Option<&[Frame]> {
        self.attributes.iter().find_map(|a| match a {
            CodeAttribute::StackMapTable { frames, .. } => Some(frames.as_slice()),
            _ => None,
        })
    }

    /// Reserves a fresh local slot above every existing one and records its
    /// type in every stack map frame. Returns `None` when the slot would not
    /// be addressable.
    pub fn allocate_local(&mut self, vt: VerificationType) -> Option<u16> {
        let slot = self.max_locals;
        let end = slot as u32 + vt.slots() as u32;
        if end > u16::MAX as u32 {
            return None;
        }
        self.max_locals = end as u16;
        for attr in &mut self.attributes {
            if let CodeAttribute::StackMapTable { frames, .. } = attr {
                for frame in frames.iter_mut() {
                    insert_local(&mut frame.locals, slot, vt.clone());
                }
            }
        }
        self.modified = true;
        Some(slot)
    }

    /// Inserts `ops` ahead of the first instruction. Jumps back to the
    /// original first instruction still land after the inserted code.
    pub fn insert_at_entry(&mut self, ops: Vec<Op>) {
        let block: Vec<Instruction> = ops.into_iter().map(Instruction::new).collect();
        self.instructions.splice(0..0, block);
        self.modified = true;
    }

    /// Inserts `ops` immediately before instruction `index`. Anything that
    /// targeted that instruction (jumps, handlers, frames, line numbers) now
    /// targets the start of the inserted block, so control flow is unchanged.
    pub fn insert_before(&mut self, index: usize, ops: Vec<Op>) {
        let label = self.instructions[index].label.take();
        let mut block: Vec<Instruction> = ops.into_iter().map(Instruction::new).collect();
        if let Some(first) = block.first_mut() {
            first.label = label;
        } else {
            self.instructions[index].label = label;
        }
        self.instructions.splice(index..index, block);
        self.modified = true;
    }

    fn decode(
        info: &[u8],
        pool: &ConstantPool,
        initial: &[VerificationType],
    ) -> Result<Self, FormatError> {
        let mut r = ByteReader::new(info);
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code_length = r.u32()?;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(FormatError::malformed(format!(
                "code length {code_length} out of range"
            )));
        }
        let instructions = decode_code(r.bytes(code_length as usize)?)?;

        let boundaries: HashSet<u32> = instructions.iter().filter_map(|i| i.label).collect();
        let is_boundary = |offset: u32| boundaries.contains(&offset);
        let is_end = |offset: u32| offset == code_length || boundaries.contains(&offset);

        let handler_count = r.u16()?;
        let mut handlers = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            let h = ExceptionHandler {
                start: r.u16()? as u32,
                end: r.u16()? as u32,
                handler: r.u16()? as u32,
                catch_type: r.u16()?,
            };
            if h.start >= h.end
                || !is_boundary(h.start)
                || !is_end(h.end)
                || !is_boundary(h.handler)
            {
                return Err(FormatError::malformed(format!(
                    "exception table entry {h:?} does not match instruction boundaries"
                )));
            }
            handlers.push(h);
        }

        let mut attributes = Vec::new();
        for raw in decode_attributes(&mut r)? {
            let name = pool.utf8(raw.name_index)?;
            let attr = match name.as_str() {
                STACK_MAP_TABLE => CodeAttribute::StackMapTable {
                    name_index: raw.name_index,
                    frames: decode_stack_map(&raw.info, pool, initial)?,
                },
                LINE_NUMBER_TABLE => {
                    let mut t = ByteReader::new(&raw.info);
                    let count = t.u16()?;
                    let mut entries = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        entries.push(LineNumber {
                            start: t.u16()? as u32,
                            line: t.u16()?,
                        });
                    }
                    CodeAttribute::LineNumberTable {
                        name_index: raw.name_index,
                        entries,
                    }
                }
                LOCAL_VARIABLE_TABLE | LOCAL_VARIABLE_TYPE_TABLE => {
                    let mut t = ByteReader::new(&raw.info);
                    let count = t.u16()?;
                    let mut entries = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let start = t.u16()? as u32;
                        let length = t.u16()? as u32;
                        entries.push(LocalVariable {
                            start,
                            end: start + length,
                            name_index: t.u16()?,
                            descriptor_index: t.u16()?,
                            index: t.u16()?,
                        });
                    }
                    CodeAttribute::LocalVariables {
                        name_index: raw.name_index,
                        entries,
                    }
                }
                _ => CodeAttribute::Other(raw),
            };
            attributes.push(attr);
        }

        if !r.is_empty() {
            return Err(FormatError::malformed("trailing bytes in Code attribute"));
        }

        Ok(Self {
            max_stack,
            max_locals,
            instructions,
            handlers,
            attributes,
            original_length: code_length,
            initial: initial.to_vec(),
            modified: false,
        })
    }

    fn encode(&self, pool: &mut ConstantPool, this_class: &str) -> Result<Vec<u8>, FormatError> {
        let mut instructions = self.instructions.clone();
        let skips = widen_branches(&mut instructions, self.original_length)?;
        let layout = Layout::compute(&instructions, self.original_length);
        if layout.code_length == 0 || layout.code_length > MAX_CODE_LENGTH {
            return Err(FormatError::Unencodable {
                method: String::new(),
                reason: format!("code length {} exceeds {MAX_CODE_LENGTH}", layout.code_length),
            });
        }
        let resolve = |label: u32| -> Result<u32, FormatError> {
            layout.resolve(label).ok_or_else(|| FormatError::Unencodable {
                method: String::new(),
                reason: format!("reference to unknown offset {label}"),
            })
        };

        // widened conditionals leave new jump targets that need frames
        let skip_frames = match self.frames() {
            Some(frames) if !skips.is_empty() => typeflow::fall_through_frames(
                &instructions,
                &skips,
                frames,
                &self.initial,
                this_class,
                pool,
            )?,
            _ => Vec::new(),
        };

        let handler_labels: Vec<u32> = self.handlers.iter().map(|h| h.handler).collect();
        let max_stack =
            max_stack::compute(&instructions, &handler_labels, pool)?.max(self.max_stack);

        let mut out = Vec::with_capacity(layout.code_length as usize + 64);
        put_u16(&mut out, max_stack);
        put_u16(&mut out, self.max_locals);
        put_u32(&mut out, layout.code_length);
        out.extend_from_slice(&encode_code(&instructions, &layout)?);

        put_u16(&mut out, self.handlers.len() as u16);
        for h in &self.handlers {
            put_u16(&mut out, resolve(h.start)? as u16);
            put_u16(&mut out, resolve(h.end)? as u16);
            put_u16(&mut out, resolve(h.handler)? as u16);
            put_u16(&mut out, h.catch_type);
        }

        let mut attrs = Vec::new();
        let mut attr_count = 0u16;
        for attr in &self.attributes {
            match attr {
                CodeAttribute::StackMapTable { name_index, frames } => {
                    let body = if skip_frames.is_empty() {
                        encode_stack_map(frames, &layout, pool)?
                    } else {
                        let mut all = frames.clone();
                        all.extend(skip_frames.iter().cloned());
                        all.sort_by_key(|f| layout.resolve(f.label));
                        encode_stack_map(&all, &layout, pool)?
                    };
                    write_attribute(&mut attrs, *name_index, &body);
                }
                CodeAttribute::LineNumberTable {
                    name_index,
                    entries,
                } => {
                    // debug entries that no longer map to an instruction are dropped
                    let kept: Vec<(u32, u16)> = entries
                        .iter()
                        .filter_map(|e| Some((layout.resolve(e.start)?, e.line)))
                        .collect();
                    let mut body = Vec::with_capacity(2 + kept.len() * 4);
                    put_u16(&mut body, kept.len() as u16);
                    for (start, line) in kept {
                        put_u16(&mut body, start as u16);
                        put_u16(&mut body, line);
                    }
                    write_attribute(&mut attrs, *name_index, &body);
                }
                CodeAttribute::LocalVariables {
                    name_index,
                    entries,
                } => {
                    let kept: Vec<(u32, u32, &LocalVariable)> = entries
                        .iter()
                        .filter_map(|e| Some((layout.resolve(e.start)?, layout.resolve(e.end)?, e)))
                        .collect();
                    let mut body = Vec::with_capacity(2 + kept.len() * 10);
                    put_u16(&mut body, kept.len() as u16);
                    for (start, end, e) in kept {
                        put_u16(&mut body, start as u16);
                        put_u16(&mut body, end.saturating_sub(start) as u16);
                        put_u16(&mut body, e.name_index);
                        put_u16(&mut body, e.descriptor_index);
                        put_u16(&mut body, e.index);
                    }
                    write_attribute(&mut attrs, *name_index, &body);
                }
                CodeAttribute::Other(raw) => {
                    let name = pool.utf8(raw.name_index)?;
                    if UNRELOCATED_CODE_ATTRIBUTES.contains(&name.as_str()) {
                        continue;
                    }
                    raw.write_to(&mut attrs);
                }
            }
            attr_count += 1;
        }
        put_u16(&mut out, attr_count);
        out.extend_from_slice(&attrs);
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    name_index: u16,
    descriptor_index: u16,
    attributes: Vec<Attribute>,
    /// Position of the `Code` attribute in `attributes`.
    code_index: Option<usize>,
    /// `None` for abstract and native methods.
    pub code: Option<Code>,
}

#[derive(Debug, Clone)]
pub struct ClassUnit {
    minor_version: u16,
    major_version: u16,
    pub pool: ConstantPool,
    pub access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<Field>,
    pub methods: Vec<Method>,
    attributes: Vec<Attribute>,
    name: String,
}

impl ClassUnit {
    /// Internal (slash-separated) name of the class.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn is_modified(&self) -> bool {
        self.methods
            .iter()
            .any(|m| m.code.as_ref().is_some_and(Code::is_modified))
    }

    pub fn summary(&self) -> ClassSummary {
        ClassSummary {
            name: self.name.clone(),
            major_version: self.major_version,
            constant_pool_count: self.pool.count(),
            methods: self
                .methods
                .iter()
                .map(|m| MethodSummary {
                    name: m.name.clone(),
                    descriptor: m.descriptor.clone(),
                    access_flags: m.access_flags,
                    max_stack: m.code.as_ref().map(|c| c.max_stack),
                    max_locals: m.code.as_ref().map(|c| c.max_locals),
                    instructions: m.code.as_ref().map_or(0, |c| c.instructions.len()),
                    exit_points: m.code.as_ref().map_or(0, |c| c.exit_points().len()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassSummary {
    pub name: String,
    pub major_version: u16,
    pub constant_pool_count: usize,
    pub methods: Vec<MethodSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodSummary {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub max_stack: Option<u16>,
    pub max_locals: Option<u16>,
    pub instructions: usize,
    pub exit_points: usize,
}

pub fn decode(bytes: &[u8]) -> Result<ClassUnit, FormatError> {
    let mut r = ByteReader::new(bytes);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(FormatError::malformed(format!("bad magic 0x{magic:08x}")));
    }
    let minor_version = r.u16()?;
    let major_version = r.u16()?;
    let pool = ConstantPool::decode(&mut r)?;
    let access_flags = r.u16()?;
    let this_class = r.u16()?;
    let super_class = r.u16()?;
    let name = pool.class_name(this_class)?;

    let interface_count = r.u16()?;
    let interfaces = (0..interface_count)
        .map(|_| r.u16())
        .collect::<Result<Vec<_>, _>>()?;

    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(Field {
            access_flags: r.u16()?,
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: decode_attributes(&mut r)?,
        });
    }

    let method_count = r.u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        let access_flags = r.u16()?;
        let name_index = r.u16()?;
        let descriptor_index = r.u16()?;
        let attributes = decode_attributes(&mut r)?;
        let method_name = pool.utf8(name_index)?;
        let descriptor = pool.utf8(descriptor_index)?;

        let mut code_index = None;
        let mut code = None;
        for (i, attr) in attributes.iter().enumerate() {
            if pool.utf8(attr.name_index)? == "Code" {
                let parsed = MethodDescriptor::parse(&descriptor)?;
                let initial = initial_locals(&name, &method_name, access_flags, &parsed);
                code = Some(Code::decode(&attr.info, &pool, &initial).map_err(|e| match e {
                    FormatError::Malformed(msg) => {
                        FormatError::Malformed(format!("{method_name}{descriptor}: {msg}"))
                    }
                    other => other,
                })?);
                code_index = Some(i);
                break;
            }
        }

        methods.push(Method {
            access_flags,
            name: method_name,
            descriptor,
            name_index,
            descriptor_index,
            attributes,
            code_index,
            code,
        });
    }

    let attributes = decode_attributes(&mut r)?;
    if !r.is_empty() {
        return Err(FormatError::malformed("trailing bytes after class attributes"));
    }

    Ok(ClassUnit {
        minor_version,
        major_version,
        pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
        name,
    })
}

pub fn encode(mut unit: ClassUnit) -> Result<Vec<u8>, FormatError> {
    // Members first: rewritten stack maps may add Class constants.
    let mut body = Vec::new();
    put_u16(&mut body, unit.access_flags);
    put_u16(&mut body, unit.this_class);
    put_u16(&mut body, unit.super_class);
    put_u16(&mut body, unit.interfaces.len() as u16);
    for i in &unit.interfaces {
        put_u16(&mut body, *i);
    }

    put_u16(&mut body, unit.fields.len() as u16);
    for f in &unit.fields {
        put_u16(&mut body, f.access_flags);
        put_u16(&mut body, f.name_index);
        put_u16(&mut body, f.descriptor_index);
        put_u16(&mut body, f.attributes.len() as u16);
        for a in &f.attributes {
            a.write_to(&mut body);
        }
    }

    put_u16(&mut body, unit.methods.len() as u16);
    for m in &unit.methods {
        put_u16(&mut body, m.access_flags);
        put_u16(&mut body, m.name_index);
        put_u16(&mut body, m.descriptor_index);
        put_u16(&mut body, m.attributes.len() as u16);
        for (i, a) in m.attributes.iter().enumerate() {
            match (&m.code, m.code_index) {
                (Some(code), Some(ci)) if ci == i && code.is_modified() => {
                    let info = code.encode(&mut unit.pool, &unit.name).map_err(|e| {
                        e.in_method(&format!("{}.{}{}", unit.name, m.name, m.descriptor))
                    })?;
                    write_attribute(&mut body, a.name_index, &info);
                }
                _ => a.write_to(&mut body),
            }
        }
    }

    put_u16(&mut body, unit.attributes.len() as u16);
    for a in &unit.attributes {
        a.write_to(&mut body);
    }

    let mut out = Vec::with_capacity(body.len() + 1024);
    put_u32(&mut out, MAGIC);
    put_u16(&mut out, unit.minor_version);
    put_u16(&mut out, unit.major_version);
    unit.pool.write_to(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}
