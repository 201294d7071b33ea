//! Which compiled units are candidates for instrumentation.
//!
//! The same predicate is used for loose files (on the file name) and for
//! archive entries (on the full entry name).

pub const CLASS_SUFFIX: &str = ".class";

/// Generated resource id and build metadata classes carry no lifecycle code.
const EXCLUDED_SUFFIXES: [&str; 2] = ["R.class", "BuildConfig.class"];
const EXCLUDED_MARKER: &str = "R$";

pub fn is_class_name(name: &str) -> bool {
    name.ends_with(CLASS_SUFFIX)
}

pub fn is_excluded(name: &str) -> bool {
    EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s)) || name.contains(EXCLUDED_MARKER)
}

pub fn is_instrumentable(name: &str) -> bool {
    is_class_name(name) && !is_excluded(name)
}
