//! Hand-assembled class files for unit tests.

use crate::constant_pool::ConstantPool;
use crate::reader::{put_u16, put_u32};

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_ABSTRACT: u16 = 0x0400;

#[derive(Debug, Clone, Default)]
pub struct CodeFixture {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// start, end, handler, catch type
    pub handlers: Vec<[u16; 4]>,
    /// entry count and raw frames
    pub stack_map: Option<(u16, Vec<u8>)>,
    pub line_numbers: Vec<(u16, u16)>,
}

pub struct ClassBuilder {
    pool: ConstantPool,
    this_class: u16,
    super_class: u16,
    methods: Vec<u8>,
    method_count: u16,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut pool = ConstantPool::new();
        let this_class = pool.intern_class(name).unwrap();
        let super_class = pool.intern_class("java/lang/Object").unwrap();
        Self {
            pool,
            this_class,
            super_class,
            methods: Vec::new(),
            method_count: 0,
        }
    }

    pub fn class_ref(&mut self, name: &str) -> u16 {
        self.pool.intern_class(name).unwrap()
    }

    pub fn abstract_method(&mut self, name: &str, descriptor: &str) -> &mut Self {
        self.header(ACC_PUBLIC | ACC_ABSTRACT, name, descriptor, 0);
        self
    }

    pub fn method(
        &mut self,
        access: u16,
        name: &str,
        descriptor: &str,
        code: CodeFixture,
    ) -> &mut Self {
        self.header(access, name, descriptor, 1);
        let code_name = self.pool.intern_utf8("Code").unwrap();

        let mut info = Vec::new();
        put_u16(&mut info, code.max_stack);
        put_u16(&mut info, code.max_locals);
        put_u32(&mut info, code.code.len() as u32);
        info.extend_from_slice(&code.code);
        put_u16(&mut info, code.handlers.len() as u16);
        for h in &code.handlers {
            for v in h {
                put_u16(&mut info, *v);
            }
        }

        let mut attrs = Vec::new();
        let mut count = 0u16;
        if let Some((entries, frames)) = &code.stack_map {
            let name = self.pool.intern_utf8("StackMapTable").unwrap();
            let mut body = Vec::new();
            put_u16(&mut body, *entries);
            body.extend_from_slice(frames);
            put_u16(&mut attrs, name);
            put_u32(&mut attrs, body.len() as u32);
            attrs.extend_from_slice(&body);
            count += 1;
        }
        if !code.line_numbers.is_empty() {
            let name = self.pool.intern_utf8("LineNumberTable").unwrap();
            let mut body = Vec::new();
            put_u16(&mut body, code.line_numbers.len() as u16);
            for (pc, line) in &code.line_numbers {
                put_u16(&mut body, *pc);
                put_u16(&mut body, *line);
            }
            put_u16(&mut attrs, name);
            put_u32(&mut attrs, body.len() as u32);
            attrs.extend_from_slice(&body);
            count += 1;
        }
        put_u16(&mut info, count);
        info.extend_from_slice(&attrs);

        put_u16(&mut self.methods, code_name);
        put_u32(&mut self.methods, info.len() as u32);
        self.methods.extend_from_slice(&info);
        self
    }

    fn header(&mut self, access: u16, name: &str, descriptor: &str, attr_count: u16) {
        let name = self.pool.intern_utf8(name).unwrap();
        let descriptor = self.pool.intern_utf8(descriptor).unwrap();
        put_u16(&mut self.methods, access);
        put_u16(&mut self.methods, name);
        put_u16(&mut self.methods, descriptor);
        put_u16(&mut self.methods, attr_count);
        self.method_count += 1;
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, 0xCAFE_BABE);
        put_u16(&mut out, 0);
        put_u16(&mut out, 52);
        self.pool.write_to(&mut out);
        put_u16(&mut out, ACC_PUBLIC);
        put_u16(&mut out, self.this_class);
        put_u16(&mut out, self.super_class);
        put_u16(&mut out, 0); // interfaces
        put_u16(&mut out, 0); // fields
        put_u16(&mut out, self.method_count);
        out.extend_from_slice(&self.methods);
        put_u16(&mut out, 0); // attributes
        out
    }
}

fn return_only() -> CodeFixture {
    CodeFixture {
        max_stack: 0,
        max_locals: 1,
        code: vec![0xb1],
        ..Default::default()
    }
}

/// `onCreate(Bundle)` with two returns, one of them a jump target:
///
/// ```text
/// 0: aload_1
/// 1: ifnull 7
/// 4: iconst_1
/// 5: istore_2
/// 6: return
/// 7: return      // frame: same as entry
/// ```
pub fn activity_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/example/MainActivity");
    b.method(
        ACC_PUBLIC,
        "onCreate",
        "(Landroid/os/Bundle;)V",
        CodeFixture {
            max_stack: 1,
            max_locals: 3,
            code: vec![0x2b, 0xc6, 0x00, 0x06, 0x04, 0x3d, 0xb1, 0xb1],
            stack_map: Some((1, vec![7])),
            line_numbers: vec![(0, 10), (6, 12), (7, 14)],
            ..Default::default()
        },
    );
    b.method(ACC_PUBLIC, "onResume", "()V", return_only());
    b.build()
}

/// `onCreate()` with a normal return inside a try range and a rethrowing
/// handler:
///
/// ```text
/// 0: iconst_0
/// 1: istore_1
/// 2: return
/// 3: astore_1    // handler for [0, 2), frame: stack [Throwable]
/// 4: aload_1
/// 5: athrow
/// ```
pub fn splash_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/example/Splash");
    let throwable = b.class_ref("java/lang/Throwable");
    let mut frames = vec![64 + 3, 7];
    frames.extend_from_slice(&throwable.to_be_bytes());
    b.method(
        ACC_PUBLIC,
        "onCreate",
        "()V",
        CodeFixture {
            max_stack: 1,
            max_locals: 2,
            code: vec![0x03, 0x3c, 0xb1, 0x4c, 0x2b, 0xbf],
            handlers: vec![[0, 2, 3, throwable]],
            stack_map: Some((1, frames)),
            ..Default::default()
        },
    );
    b.build()
}

/// No method named `onCreate`.
pub fn util_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/example/Util");
    b.method(
        ACC_PUBLIC | 0x0008,
        "helper",
        "()I",
        CodeFixture {
            max_stack: 1,
            max_locals: 0,
            code: vec![0x03, 0xac],
            ..Default::default()
        },
    );
    b.build()
}

/// An abstract `onCreate` only.
pub fn abstract_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/example/Base");
    b.abstract_method("onCreate", "(Landroid/os/Bundle;)V");
    b.build()
}

/// `onCreate` whose locals already fill the addressable space.
pub fn crowded_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/example/Crowded");
    b.method(
        ACC_PUBLIC,
        "onCreate",
        "()V",
        CodeFixture {
            max_stack: 0,
            max_locals: 0xfffe,
            code: vec![0xb1],
            ..Default::default()
        },
    );
    b.build()
}

/// `onCreate(int)` whose forward branch fits in 16 bits only until a
/// timing block lands inside its span:
///
/// ```text
/// 0:     iload_1
/// 1:     ifne 32745
/// 4:     nop (x 32740)
/// 32744: return
/// 32745: return  // frame: same as entry
/// ```
pub fn far_branch_class() -> Vec<u8> {
    const FILLER: usize = 32_740;
    let target = (4 + FILLER + 1) as u16;
    let mut code = vec![0x1b, 0x9a];
    code.extend_from_slice(&(target - 1).to_be_bytes());
    code.resize(code.len() + FILLER, 0x00);
    code.extend_from_slice(&[0xb1, 0xb1]);
    let mut frames = vec![251];
    frames.extend_from_slice(&target.to_be_bytes());

    let mut b = ClassBuilder::new("com/example/FarActivity");
    b.method(
        ACC_PUBLIC,
        "onCreate",
        "(I)V",
        CodeFixture {
            max_stack: 1,
            max_locals: 2,
            code,
            stack_map: Some((1, frames)),
            ..Default::default()
        },
    );
    b.build()
}

/// Two `onCreate` overloads that return values:
///
/// ```text
/// onCreate()J                      onCreate(I)Ljava/lang/Object;
/// 0: lconst_1                      0: iload_1
/// 1: lreturn                       1: ifeq 6
///                                  4: aconst_null
///                                  5: areturn
///                                  6: aconst_null  // frame: same as entry
///                                  7: areturn
/// ```
pub fn overloads_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("com/example/Overloads");
    b.method(
        ACC_PUBLIC,
        "onCreate",
        "()J",
        CodeFixture {
            max_stack: 2,
            max_locals: 1,
            code: vec![0x0a, 0xad],
            ..Default::default()
        },
    );
    b.method(
        ACC_PUBLIC,
        "onCreate",
        "(I)Ljava/lang/Object;",
        CodeFixture {
            max_stack: 1,
            max_locals: 2,
            code: vec![0x1b, 0x99, 0x00, 0x05, 0x01, 0xb0, 0x01, 0xb0],
            stack_map: Some((1, vec![6])),
            ..Default::default()
        },
    );
    b.build()
}
