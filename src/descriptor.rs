use crate::error::FormatError;

/// A parsed method descriptor; parameter and return entries keep their
/// field descriptor text (`I`, `Ljava/lang/String;`, `[J`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<String>,
    /// `None` for `V`.
    pub ret: Option<String>,
}

impl MethodDescriptor {
    pub fn parse(desc: &str) -> Result<Self, FormatError> {
        let bad = || FormatError::malformed(format!("invalid method descriptor {desc:?}"));
        let rest = desc.strip_prefix('(').ok_or_else(bad)?;
        let close = rest.find(')').ok_or_else(bad)?;
        let (mut args, ret) = (&rest[..close], &rest[close + 1..]);

        let mut params = Vec::new();
        while !args.is_empty() {
            let len = field_descriptor_len(args).ok_or_else(bad)?;
            params.push(args[..len].to_string());
            args = &args[len..];
        }

        let ret = if ret == "V" {
            None
        } else if field_descriptor_len(ret) == Some(ret.len()) {
            Some(ret.to_string())
        } else {
            return Err(bad());
        };

        Ok(Self { params, ret })
    }

    /// Operand stack / local slots taken by the arguments (receiver excluded).
    pub fn param_slots(&self) -> u32 {
        self.params.iter().map(|p| slot_size(p) as u32).sum()
    }

    pub fn return_slots(&self) -> u32 {
        self.ret.as_deref().map_or(0, |r| slot_size(r) as u32)
    }
}

/// Length in bytes of the first field descriptor in `s`.
fn field_descriptor_len(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while bytes.get(i) == Some(&b'[') {
        i += 1;
    }
    match bytes.get(i)? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(i + 1),
        b'L' => {
            let end = s[i..].find(';')?;
            if end <= 1 { None } else { Some(i + end + 1) }
        }
        _ => None,
    }
}

/// Slots taken by a value of the given field descriptor.
pub fn slot_size(field_desc: &str) -> u16 {
    match field_desc.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// Internal class name used by a `CONSTANT_Class` for a reference-typed
/// field descriptor. Arrays keep their descriptor form.
pub fn class_name_of(field_desc: &str) -> Option<&str> {
    if field_desc.starts_with('[') {
        return Some(field_desc);
    }
    field_desc.strip_prefix('L')?.strip_suffix(';')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_parameters() {
        let d = MethodDescriptor::parse("(IJLjava/lang/String;[[DZ)Ljava/lang/Object;").unwrap();
        assert_eq!(d.params, vec!["I", "J", "Ljava/lang/String;", "[[D", "Z"]);
        assert_eq!(d.param_slots(), 6);
        assert_eq!(d.ret.as_deref(), Some("Ljava/lang/Object;"));
        assert_eq!(d.return_slots(), 1);
    }

    #[test]
    fn void_return_has_no_slots() {
        let d = MethodDescriptor::parse("(Landroid/os/Bundle;)V").unwrap();
        assert_eq!(d.ret, None);
        assert_eq!(d.return_slots(), 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(MethodDescriptor::parse("I)V").is_err());
        assert!(MethodDescriptor::parse("(Q)V").is_err());
        assert!(MethodDescriptor::parse("(L;)V").is_err());
        assert!(MethodDescriptor::parse("()").is_err());
    }

    #[test]
    fn class_names_for_frames() {
        assert_eq!(class_name_of("Ljava/lang/String;"), Some("java/lang/String"));
        assert_eq!(class_name_of("[I"), Some("[I"));
        assert_eq!(class_name_of("I"), None);
    }
}
