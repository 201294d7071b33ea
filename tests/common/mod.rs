#![allow(dead_code)]

use perspective_eye::constant_pool::ConstantPool;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "perspective_eye_it_{}_{}_{}_{}",
        std::process::id(),
        nanos,
        n,
        name
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_file(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

pub fn read_jar(path: &Path) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        entries.push((entry.name().to_string(), bytes));
    }
    Ok(entries)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Assembles a minimal class file whose methods each have a `Code`
/// attribute and an optional StackMapTable.
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

    pub fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
        stack_map: Option<(u16, &[u8])>,
    ) -> &mut Self {
        let name = self.pool.intern_utf8(name).unwrap();
        let descriptor = self.pool.intern_utf8(descriptor).unwrap();
        let code_name = self.pool.intern_utf8("Code").unwrap();

        let mut info = Vec::new();
        put_u16(&mut info, max_stack);
        put_u16(&mut info, max_locals);
        put_u32(&mut info, code.len() as u32);
        info.extend_from_slice(code);
        put_u16(&mut info, 0);
        match stack_map {
            Some((count, frames)) => {
                let smt = self.pool.intern_utf8("StackMapTable").unwrap();
                put_u16(&mut info, 1);
                put_u16(&mut info, smt);
                put_u32(&mut info, 2 + frames.len() as u32);
                put_u16(&mut info, count);
                info.extend_from_slice(frames);
            }
            None => put_u16(&mut info, 0),
        }

        put_u16(&mut self.methods, 0x0001);
        put_u16(&mut self.methods, name);
        put_u16(&mut self.methods, descriptor);
        put_u16(&mut self.methods, 1);
        put_u16(&mut self.methods, code_name);
        put_u32(&mut self.methods, info.len() as u32);
        self.methods.extend_from_slice(&info);
        self.method_count += 1;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, 0xCAFE_BABE);
        put_u16(&mut out, 0);
        put_u16(&mut out, 52);
        self.pool.write_to(&mut out);
        put_u16(&mut out, 0x0021);
        put_u16(&mut out, self.this_class);
        put_u16(&mut out, self.super_class);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, self.method_count);
        out.extend_from_slice(&self.methods);
        put_u16(&mut out, 0);
        out
    }
}

/// An activity whose `onCreate(Bundle)` returns on two paths.
pub fn activity(name: &str) -> Vec<u8> {
    let mut b = ClassBuilder::new(name);
    b.method(
        "onCreate",
        "(Landroid/os/Bundle;)V",
        1,
        3,
        // aload_1; ifnull +6; iconst_1; istore_2; return; return
        &[0x2b, 0xc6, 0x00, 0x06, 0x04, 0x3d, 0xb1, 0xb1],
        Some((1, &[7])),
    );
    b.method("onResume", "()V", 0, 1, &[0xb1], None);
    b.build()
}

/// A class without any `onCreate`.
pub fn helper(name: &str) -> Vec<u8> {
    let mut b = ClassBuilder::new(name);
    // iconst_0; ireturn
    b.method("value", "()I", 1, 1, &[0x03, 0xac], None);
    b.build()
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
