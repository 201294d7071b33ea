use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;

use crate::error::EngineError;

/// Lists every regular file below `base_path`, sorted. Nothing is skipped:
/// hidden files and ignore files are treated like any other content.
pub fn scan_files(base_path: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_some_and(|t| t.is_file()) {
                        let _ = tx.send(Ok(entry.into_path()));
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return ignore::WalkState::Quit;
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files = rx
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| EngineError::Walk {
            path: base_path.to_path_buf(),
            source,
        })?;
    files.sort();
    Ok(files)
}

/// Destination of `file` when the tree at `root` is mirrored to `dest`.
/// `None` unless `file` names something strictly below `root`: a `..`
/// component, or any path outside `root`, has no mirror.
pub fn mirror_path(root: &Path, dest: &Path, file: &Path) -> Option<PathBuf> {
    let relative = if file.is_absolute() || file.starts_with(root) {
        file.strip_prefix(root).ok()?
    } else {
        file
    };
    let mut target = dest.to_path_buf();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                target.push(name);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(target)
}
