//! Method timing instrumentation.
//!
//! Every method named after the configured target gets a `long` local that
//! holds `System.currentTimeMillis()` taken on entry. Before each exit
//! (every return and every `athrow`) the elapsed time is computed into the
//! same slot and logged through `android.util.Log.d(tag, msg)` where `msg`
//! is `"<class> : <method>: <elapsed>"`.

use tracing::debug;

use crate::bytecode::Op;
use crate::bytecode::opcodes::{DUP, LSUB, POP};
use crate::classfile::{self, ClassUnit};
use crate::config::EngineConfig;
use crate::constant_pool::ConstantPool;
use crate::error::{FormatError, InstrumentationError};
use crate::frames::VerificationType;

pub const DEFAULT_TARGET_METHOD: &str = "onCreate";
pub const DEFAULT_LOG_TAG: &str = "jcy";

/// What the orchestrator applies to each candidate class unit.
pub trait ClassTransform: Send + Sync {
    /// Returns `Ok(None)` when the unit needs no change, in which case the
    /// caller keeps the original bytes.
    fn transform_class(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, InstrumentationError>;
}

#[derive(Debug, Clone)]
pub struct MethodTimer {
    target_method: String,
    log_tag: String,
}

impl Default for MethodTimer {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_METHOD, DEFAULT_LOG_TAG)
    }
}

/// Constant pool entries shared by all instrumented methods of one unit.
struct TimingRefs {
    current_time_millis: u16,
    tag: u16,
    builder: u16,
    builder_init: u16,
    append_string: u16,
    append_long: u16,
    to_string: u16,
    log_d: u16,
    label: u16,
}

impl TimingRefs {
    fn intern(pool: &mut ConstantPool, tag: &str, label: &str) -> Result<Self, FormatError> {
        const SB: &str = "java/lang/StringBuilder";
        Ok(Self {
            current_time_millis: pool.intern_method_ref(
                "java/lang/System",
                "currentTimeMillis",
                "()J",
            )?,
            tag: pool.intern_string(tag)?,
            builder: pool.intern_class(SB)?,
            builder_init: pool.intern_method_ref(SB, "<init>", "()V")?,
            append_string: pool.intern_method_ref(
                SB,
                "append",
                "(Ljava/lang/String;)Ljava/lang/StringBuilder;",
            )?,
            append_long: pool.intern_method_ref(SB, "append", "(J)Ljava/lang/StringBuilder;")?,
            to_string: pool.intern_method_ref(SB, "toString", "()Ljava/lang/String;")?,
            log_d: pool.intern_method_ref(
                "android/util/Log",
                "d",
                "(Ljava/lang/String;Ljava/lang/String;)I",
            )?,
            label: pool.intern_string(label)?,
        })
    }

    fn entry_block(&self, slot: u16) -> Vec<Op> {
        vec![Op::invoke_static(self.current_time_millis), Op::lstore(slot)]
    }

    fn exit_block(&self, slot: u16) -> Vec<Op> {
        vec![
            Op::invoke_static(self.current_time_millis),
            Op::lload(slot),
            Op::simple(LSUB),
            Op::lstore(slot),
            Op::ldc(self.tag),
            Op::new_object(self.builder),
            Op::simple(DUP),
            Op::invoke_special(self.builder_init),
            Op::ldc(self.label),
            Op::invoke_virtual(self.append_string),
            Op::lload(slot),
            Op::invoke_virtual(self.append_long),
            Op::invoke_virtual(self.to_string),
            Op::invoke_static(self.log_d),
            Op::simple(POP),
        ]
    }
}

impl MethodTimer {
    pub fn new(target_method: impl Into<String>, log_tag: impl Into<String>) -> Self {
        Self {
            target_method: target_method.into(),
            log_tag: log_tag.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.target_method.clone(), config.log_tag.clone())
    }

    /// Instruments every matching method of `unit` in place and returns how
    /// many were rewritten. Bodiless methods and bodies without an exit are
    /// left alone; a unit with nothing to instrument is not modified at all.
    pub fn instrument(&self, unit: &mut ClassUnit) -> Result<usize, InstrumentationError> {
        let targets: Vec<usize> = unit
            .methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.name == self.target_method)
            .filter(|(_, m)| m.code.as_ref().is_some_and(|c| !c.exit_points().is_empty()))
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let label = format!("{} : {}: ", unit.name(), self.target_method);
        let refs = TimingRefs::intern(&mut unit.pool, &self.log_tag, &label)?;
        let class_name = unit.name().to_string();

        for &i in &targets {
            let method = &mut unit.methods[i];
            let Some(code) = method.code.as_mut() else {
                continue;
            };
            let max_locals = code.max_locals;
            let slot = code.allocate_local(VerificationType::Long).ok_or_else(|| {
                InstrumentationError::SlotOverflow {
                    method: format!("{class_name}.{}{}", method.name, method.descriptor),
                    max_locals,
                }
            })?;

            let exits = code.exit_points();
            for &exit in exits.iter().rev() {
                code.insert_before(exit, refs.exit_block(slot));
            }
            code.insert_at_entry(refs.entry_block(slot));

            debug!(
                class = %class_name,
                method = %format!("{}{}", method.name, method.descriptor),
                exits = exits.len(),
                slot,
                "instrumented method"
            );
        }

        Ok(targets.len())
    }
}

impl ClassTransform for MethodTimer {
    fn transform_class(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, InstrumentationError> {
        let mut unit = classfile::decode(bytes)?;
        if self.instrument(&mut unit)? == 0 {
            return Ok(None);
        }
        Ok(Some(classfile::encode(unit)?))
    }
}

/// Instruments `target_method` with the default log tag.
pub fn instrument(
    unit: &mut ClassUnit,
    target_method: &str,
) -> Result<usize, InstrumentationError> {
    MethodTimer::new(target_method, DEFAULT_LOG_TAG).instrument(unit)
}
