//! Constant pool model.
//!
//! Entries are kept in their original order and raw form so that an
//! undisturbed pool re-encodes byte for byte. New entries are only ever
//! appended, which keeps every index referenced by untouched code valid.

use std::collections::HashMap;

use crate::error::FormatError;
use crate::reader::{ByteReader, put_u16, put_u32};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Modified UTF-8 bytes, undecoded.
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Index 0 and the slot following a long or double.
    Unusable,
}

/// A resolved field or method reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    /// First index of every entry, for find-or-add interning.
    index: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            index: HashMap::new(),
        }
    }

    /// Number of slots including the unused slot 0; this is the
    /// `constant_pool_count` written to the class file.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self, FormatError> {
        let count = r.u16()? as usize;
        if count == 0 {
            return Err(FormatError::malformed("constant_pool_count is zero"));
        }
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Unusable);

        while entries.len() < count {
            let tag = r.u8()?;
            let constant = match tag {
                1 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.bytes(len)?.to_vec())
                }
                3 => Constant::Integer(r.u32()?),
                4 => Constant::Float(r.u32()?),
                5 => Constant::Long(r.u64()?),
                6 => Constant::Double(r.u64()?),
                7 => Constant::Class(r.u16()?),
                8 => Constant::String(r.u16()?),
                9 => Constant::FieldRef {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                10 => Constant::MethodRef {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                11 => Constant::InterfaceMethodRef {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                12 => Constant::NameAndType {
                    name: r.u16()?,
                    descriptor: r.u16()?,
                },
                15 => Constant::MethodHandle {
                    kind: r.u8()?,
                    reference: r.u16()?,
                },
                16 => Constant::MethodType(r.u16()?),
                17 => Constant::Dynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                18 => Constant::InvokeDynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                19 => Constant::Module(r.u16()?),
                20 => Constant::Package(r.u16()?),
                other => {
                    return Err(FormatError::malformed(format!(
                        "unknown constant pool tag {other} at index {}",
                        entries.len()
                    )));
                }
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            entries.push(constant);
            if wide {
                if entries.len() >= count {
                    return Err(FormatError::malformed("long constant in last pool slot"));
                }
                entries.push(Constant::Unusable);
            }
        }

        let mut index = HashMap::with_capacity(entries.len());
        for (i, constant) in entries.iter().enumerate() {
            if *constant != Constant::Unusable {
                index.entry(constant.clone()).or_insert(i as u16);
            }
        }
        Ok(Self { entries, index })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        put_u16(out, self.entries.len() as u16);
        for constant in self.entries.iter().skip(1) {
            match constant {
                Constant::Utf8(bytes) => {
                    out.push(1);
                    put_u16(out, bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(v) => {
                    out.push(3);
                    put_u32(out, *v);
                }
                Constant::Float(v) => {
                    out.push(4);
                    put_u32(out, *v);
                }
                Constant::Long(v) => {
                    out.push(5);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Double(v) => {
                    out.push(6);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Class(i) => {
                    out.push(7);
                    put_u16(out, *i);
                }
                Constant::String(i) => {
                    out.push(8);
                    put_u16(out, *i);
                }
                Constant::FieldRef {
                    class,
                    name_and_type,
                } => write_pair(out, 9, *class, *name_and_type),
                Constant::MethodRef {
                    class,
                    name_and_type,
                } => write_pair(out, 10, *class, *name_and_type),
                Constant::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => write_pair(out, 11, *class, *name_and_type),
                Constant::NameAndType { name, descriptor } => {
                    write_pair(out, 12, *name, *descriptor)
                }
                Constant::MethodHandle { kind, reference } => {
                    out.push(15);
                    out.push(*kind);
                    put_u16(out, *reference);
                }
                Constant::MethodType(i) => {
                    out.push(16);
                    put_u16(out, *i);
                }
                Constant::Dynamic {
                    bootstrap,
                    name_and_type,
                } => write_pair(out, 17, *bootstrap, *name_and_type),
                Constant::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => write_pair(out, 18, *bootstrap, *name_and_type),
                Constant::Module(i) => {
                    out.push(19);
                    put_u16(out, *i);
                }
                Constant::Package(i) => {
                    out.push(20);
                    put_u16(out, *i);
                }
                Constant::Unusable => {}
            }
        }
    }

    pub fn get(&self, index: u16) -> Result<&Constant, FormatError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(FormatError::malformed(format!(
                "invalid constant pool index {index}"
            ))),
            Some(c) => Ok(c),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<String, FormatError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => decode_modified_utf8(bytes),
            other => Err(FormatError::malformed(format!(
                "constant {index} is not Utf8: {other:?}"
            ))),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<String, FormatError> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            other => Err(FormatError::malformed(format!(
                "constant {index} is not a Class: {other:?}"
            ))),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(String, String), FormatError> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            other => Err(FormatError::malformed(format!(
                "constant {index} is not a NameAndType: {other:?}"
            ))),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef, FormatError> {
        match self.get(index)? {
            Constant::FieldRef {
                class,
                name_and_type,
            }
            | Constant::MethodRef {
                class,
                name_and_type,
            }
            | Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok(MemberRef {
                    owner: self.class_name(*class)?,
                    name,
                    descriptor,
                })
            }
            other => Err(FormatError::malformed(format!(
                "constant {index} is not a member reference: {other:?}"
            ))),
        }
    }

    /// Call-site descriptor of an `invokedynamic` (or condy) constant.
    pub fn dynamic_descriptor(&self, index: u16) -> Result<String, FormatError> {
        match self.get(index)? {
            Constant::InvokeDynamic { name_and_type, .. }
            | Constant::Dynamic { name_and_type, .. } => Ok(self.name_and_type(*name_and_type)?.1),
            other => Err(FormatError::malformed(format!(
                "constant {index} is not dynamic: {other:?}"
            ))),
        }
    }

    fn intern(&mut self, constant: Constant) -> Result<u16, FormatError> {
        if let Some(&pos) = self.index.get(&constant) {
            return Ok(pos);
        }
        if self.entries.len() >= u16::MAX as usize {
            return Err(FormatError::PoolOverflow);
        }
        let pos = self.entries.len() as u16;
        self.entries.push(constant.clone());
        self.index.insert(constant, pos);
        Ok(pos)
    }

    pub fn intern_utf8(&mut self, value: &str) -> Result<u16, FormatError> {
        let bytes = encode_modified_utf8(value);
        if bytes.len() > u16::MAX as usize {
            return Err(FormatError::Unencodable {
                method: String::new(),
                reason: format!("string constant of {} bytes", bytes.len()),
            });
        }
        self.intern(Constant::Utf8(bytes))
    }

    pub fn intern_class(&mut self, internal_name: &str) -> Result<u16, FormatError> {
        let name = self.intern_utf8(internal_name)?;
        self.intern(Constant::Class(name))
    }

    pub fn intern_string(&mut self, value: &str) -> Result<u16, FormatError> {
        let utf8 = self.intern_utf8(value)?;
        self.intern(Constant::String(utf8))
    }

    pub fn intern_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, FormatError> {
        let class = self.intern_class(owner)?;
        let name = self.intern_utf8(name)?;
        let descriptor = self.intern_utf8(descriptor)?;
        let name_and_type = self.intern(Constant::NameAndType { name, descriptor })?;
        self.intern(Constant::MethodRef {
            class,
            name_and_type,
        })
    }
}

fn write_pair(out: &mut Vec<u8>, tag: u8, a: u16, b: u16) {
    out.push(tag);
    put_u16(out, a);
    put_u16(out, b);
}

/// JVM "modified UTF-8": NUL is two bytes and supplementary characters are
/// written as surrogate pairs.
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, FormatError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let (unit, len) = if b & 0x80 == 0 {
            (b as u16, 1)
        } else if b & 0xe0 == 0xc0 && i + 1 < bytes.len() {
            (((b as u16 & 0x1f) << 6) | (bytes[i + 1] as u16 & 0x3f), 2)
        } else if b & 0xf0 == 0xe0 && i + 2 < bytes.len() {
            (
                ((b as u16 & 0x0f) << 12)
                    | ((bytes[i + 1] as u16 & 0x3f) << 6)
                    | (bytes[i + 2] as u16 & 0x3f),
                3,
            )
        } else {
            return Err(FormatError::malformed(format!(
                "invalid modified UTF-8 byte 0x{b:02x}"
            )));
        };
        units.push(unit);
        i += len;
    }
    String::from_utf16(&units)
        .map_err(|_| FormatError::malformed("unpaired surrogate in Utf8 constant"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_reuses_existing_entries() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_class("java/lang/System").unwrap();
        let b = pool.intern_class("java/lang/System").unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.class_name(a).unwrap(), "java/lang/System");
    }

    #[test]
    fn decoded_entries_are_found_by_interning() {
        // #1 Utf8 "x", #2 Utf8 "x", #3 Class #2
        let mut bytes = vec![0x00, 0x04];
        for _ in 0..2 {
            bytes.extend_from_slice(&[1, 0x00, 0x01, b'x']);
        }
        bytes.extend_from_slice(&[7, 0x00, 0x02]);
        let mut pool = ConstantPool::decode(&mut ByteReader::new(&bytes)).unwrap();

        assert_eq!(pool.intern_utf8("x").unwrap(), 1);
        assert_eq!(pool.intern(Constant::Class(2)).unwrap(), 3);
        assert_eq!(pool.count(), 4);
        assert_eq!(pool.intern_class("x").unwrap(), 4);
        assert_eq!(pool.intern_class("x").unwrap(), 4);
        assert_eq!(pool.count(), 5);
    }

    #[test]
    fn method_ref_resolves_back() {
        let mut pool = ConstantPool::new();
        let idx = pool
            .intern_method_ref("java/lang/System", "currentTimeMillis", "()J")
            .unwrap();
        let r = pool.member_ref(idx).unwrap();
        assert_eq!(r.owner, "java/lang/System");
        assert_eq!(r.name, "currentTimeMillis");
        assert_eq!(r.descriptor, "()J");
    }

    #[test]
    fn long_constants_take_two_slots() {
        let mut bytes = vec![0x00, 0x04];
        bytes.push(5);
        bytes.extend_from_slice(&7u64.to_be_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&[0x00, 0x01, b'x']);

        let pool = ConstantPool::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(pool.count(), 4);
        assert!(pool.get(2).is_err());
        assert_eq!(pool.utf8(3).unwrap(), "x");

        let mut out = Vec::new();
        pool.write_to(&mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn modified_utf8_handles_nul_and_supplementary() {
        let s = "a\u{0}\u{1F600}é";
        let encoded = encode_modified_utf8(s);
        assert_eq!(&encoded[1..3], &[0xc0, 0x80]);
        assert!(!encoded.contains(&0));
        assert_eq!(decode_modified_utf8(&encoded).unwrap(), s);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let bytes = [0x00, 0x02, 99];
        assert!(matches!(
            ConstantPool::decode(&mut ByteReader::new(&bytes)),
            Err(FormatError::Malformed(_))
        ));
    }
}
