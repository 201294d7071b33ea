//! Archive (jar) rewriting.
//!
//! Entries are streamed in their original order. Entries that are not
//! selected, or that the transform leaves unchanged, are copied raw
//! (still compressed, header fields intact). Rewritten entries keep their
//! name, compression method, timestamp and permissions.

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;
use zip::write::{FileOptions, ZipWriter};

use crate::error::EngineError;
use crate::instrument::ClassTransform;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub entries: usize,
    pub instrumented: usize,
}

/// Writes a copy of `source` to `dest` in which every entry accepted by
/// `should_instrument` has gone through `transform`.
///
/// A selected entry that fails to transform fails the whole archive; the
/// partially written `dest` is left for the caller to discard.
pub fn rewrite_archive(
    source: &Path,
    dest: &Path,
    should_instrument: impl Fn(&str) -> bool,
    transform: &dyn ClassTransform,
) -> Result<RewriteStats, EngineError> {
    let file = File::open(source).map_err(|e| EngineError::io(source, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| EngineError::io(source, e))? };
    let mut archive =
        ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| EngineError::archive(source, e))?;

    let out = File::create(dest).map_err(|e| EngineError::io(dest, e))?;
    let mut writer = ZipWriter::new(BufWriter::new(out));
    let mut stats = RewriteStats::default();

    for i in 0..archive.len() {
        let (name, is_dir) = {
            let entry = archive
                .by_index_raw(i)
                .map_err(|e| EngineError::archive(source, e))?;
            (entry.name().to_string(), entry.is_dir())
        };
        stats.entries += 1;

        let rewritten = if !is_dir && should_instrument(&name) {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| EngineError::archive(source, e))?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| EngineError::io(entry_path(source, &name), e))?;

            let mut options = FileOptions::default()
                .compression_method(entry.compression())
                .last_modified_time(entry.last_modified());
            if let Some(mode) = entry.unix_mode() {
                options = options.unix_permissions(mode);
            }
            drop(entry);

            transform
                .transform_class(&bytes)
                .map_err(|e| EngineError::instrumentation(entry_path(source, &name), e))?
                .map(|out| (out, options))
        } else {
            None
        };

        match rewritten {
            Some((bytes, options)) => {
                writer
                    .start_file(name.as_str(), options)
                    .map_err(|e| EngineError::archive(dest, e))?;
                writer
                    .write_all(&bytes)
                    .map_err(|e| EngineError::io(dest, e))?;
                stats.instrumented += 1;
            }
            None => {
                let entry = archive
                    .by_index_raw(i)
                    .map_err(|e| EngineError::archive(source, e))?;
                writer
                    .raw_copy_file(entry)
                    .map_err(|e| EngineError::archive(dest, e))?;
            }
        }
    }

    let mut out = writer.finish().map_err(|e| EngineError::archive(dest, e))?;
    out.flush().map_err(|e| EngineError::io(dest, e))?;
    Ok(stats)
}

/// `<archive>!/<entry>`, the conventional locator for a jar entry.
fn entry_path(archive: &Path, entry: &str) -> PathBuf {
    PathBuf::from(format!("{}!/{entry}", archive.display()))
}

/// Scratch file for rewriting `source` before it is copied to `dest`.
///
/// It sits next to `dest` and is named after the SHA-256 of the absolute
/// source path, so archives sharing a destination directory never collide.
pub fn temp_archive_path(source: &Path, dest: &Path) -> Result<PathBuf, EngineError> {
    let absolute = std::path::absolute(source).map_err(|e| EngineError::io(source, e))?;
    let mut hasher = Sha256::new();
    hasher.update(absolute.as_os_str().as_encoded_bytes());
    let name = format!("{}.jar", hex::encode(hasher.finalize()));
    Ok(match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    })
}

/// Rewrites `source` through a temp file and copies the result to `dest`.
/// The temp file is removed whether or not the rewrite succeeds.
pub fn process_archive(
    source: &Path,
    dest: &Path,
    should_instrument: impl Fn(&str) -> bool,
    transform: &dyn ClassTransform,
) -> Result<RewriteStats, EngineError> {
    ensure_parent(dest)?;
    let temp = temp_archive_path(source, dest)?;
    debug!(
        archive = %source.display(),
        temp = %temp.display(),
        "rewriting archive"
    );
    if temp.exists() {
        fs::remove_file(&temp).map_err(|e| EngineError::io(&temp, e))?;
    }

    let result = rewrite_archive(source, &temp, should_instrument, transform).and_then(|stats| {
        fs::copy(&temp, dest).map_err(|e| EngineError::io(dest, e))?;
        Ok(stats)
    });
    let _ = fs::remove_file(&temp);
    result
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstrumentationError;
    use crate::filter::is_instrumentable;
    use crate::instrument::MethodTimer;
    use crate::testutil::{activity_class, util_class};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use zip::CompressionMethod;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        p.push(format!(
            "perspective-eye-archive-{}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis(),
            n
        ));
        fs::create_dir_all(&p).unwrap();
        p
    }

    fn write_jar(path: &Path, entries: &[(&str, &[u8], CompressionMethod)]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        for (name, content, method) in entries {
            let options = FileOptions::default()
                .compression_method(*method)
                .unix_permissions(0o640);
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    fn read_entries(path: &Path) -> Vec<(String, Vec<u8>, CompressionMethod)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut entry = archive.by_index(i).unwrap();
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).unwrap();
                (entry.name().to_string(), bytes, entry.compression())
            })
            .collect()
    }

    struct Counting(AtomicUsize);

    impl ClassTransform for Counting {
        fn transform_class(
            &self,
            _bytes: &[u8],
        ) -> Result<Option<Vec<u8>>, InstrumentationError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    #[test]
    fn rewrite_keeps_order_and_untouched_bytes() {
        let dir = temp_dir();
        let source = dir.join("lib.jar");
        let dest = dir.join("out.jar");
        let activity = activity_class();
        let util = util_class();
        write_jar(
            &source,
            &[
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n", CompressionMethod::Deflated),
                ("com/example/MainActivity.class", &activity, CompressionMethod::Deflated),
                ("com/example/R.class", b"not even a class", CompressionMethod::Stored),
                ("com/example/Util.class", &util, CompressionMethod::Stored),
            ],
        );

        let stats =
            rewrite_archive(&source, &dest, is_instrumentable, &MethodTimer::default()).unwrap();
        assert_eq!(stats, RewriteStats { entries: 4, instrumented: 1 });

        let before = read_entries(&source);
        let after = read_entries(&dest);
        let names: Vec<&str> = after.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "META-INF/MANIFEST.MF",
                "com/example/MainActivity.class",
                "com/example/R.class",
                "com/example/Util.class",
            ]
        );
        assert_eq!(after[0], before[0]);
        assert_ne!(after[1].1, before[1].1);
        assert_eq!(after[1].2, CompressionMethod::Deflated);
        assert_eq!(after[2], before[2]);
        assert_eq!(after[3], before[3]);

        let mut archive = ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        assert_eq!(archive.by_index(1).unwrap().unix_mode().map(|m| m & 0o777), Some(0o640));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn excluded_entries_are_never_decoded() {
        let dir = temp_dir();
        let source = dir.join("lib.jar");
        let dest = dir.join("out.jar");
        write_jar(
            &source,
            &[
                ("a/R.class", b"x", CompressionMethod::Stored),
                ("a/R$id.class", b"x", CompressionMethod::Stored),
                ("a/BuildConfig.class", b"x", CompressionMethod::Stored),
                ("a/Main.class", b"x", CompressionMethod::Stored),
                ("a/notes.txt", b"x", CompressionMethod::Stored),
            ],
        );

        let spy = Counting(AtomicUsize::new(0));
        rewrite_archive(&source, &dest, is_instrumentable, &spy).unwrap();
        assert_eq!(spy.0.load(Ordering::Relaxed), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_selected_entry_fails_the_archive() {
        let dir = temp_dir();
        let source = dir.join("lib.jar");
        let dest = dir.join("out.jar");
        write_jar(
            &source,
            &[("a/Main.class", b"garbage", CompressionMethod::Deflated)],
        );

        let err = process_archive(&source, &dest, is_instrumentable, &MethodTimer::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Format { .. }));
        assert!(err.to_string().contains("lib.jar!/a/Main.class"));
        assert!(!temp_archive_path(&source, &dest).unwrap().exists());
        assert!(!dest.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn process_archive_cleans_up_its_temp_file() {
        let dir = temp_dir();
        let source = dir.join("in/lib.jar");
        let dest = dir.join("out/nested/lib.jar");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        let activity = activity_class();
        write_jar(
            &source,
            &[("com/example/MainActivity.class", &activity, CompressionMethod::Deflated)],
        );

        let stats =
            process_archive(&source, &dest, is_instrumentable, &MethodTimer::default()).unwrap();
        assert_eq!(stats.instrumented, 1);
        assert!(dest.exists());
        let leftovers: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("lib.jar")]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn temp_names_differ_per_source_and_are_stable() {
        let dest = Path::new("/out/lib.jar");
        let a = temp_archive_path(Path::new("/in/a/lib.jar"), dest).unwrap();
        let b = temp_archive_path(Path::new("/in/b/lib.jar"), dest).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, temp_archive_path(Path::new("/in/a/lib.jar"), dest).unwrap());
        assert_eq!(a.parent(), Some(Path::new("/out")));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".jar".len());
        assert!(name.ends_with(".jar"));
    }
}
