//! # perspective-eye
//!
//! Post-compilation instrumentation of JVM class files. Every method with
//! the configured name (`onCreate` by default) is rewritten to take a
//! timestamp on entry and, before every return or throw, log the elapsed
//! milliseconds through `android.util.Log.d`.
//!
//! ## Architecture
//!
//! - **classfile**: Structural class file model with byte-preserving decode/encode
//! - **constant_pool**: Constant pool codec and find-or-add interning
//! - **descriptor**: Field and method descriptor parsing
//! - **bytecode**: Instruction decoding, relocation and encoding
//! - **frames**: StackMapTable expansion and rewriting
//! - **max_stack**: Operand stack depth analysis
//! - **typeflow**: Verification types replayed to build frames for widened branches
//! - **instrument**: The method timer and the `ClassTransform` seam
//! - **filter**: Which units are instrumentation candidates
//! - **archive**: Jar rewriting with collision-free temp files
//! - **scan**: Directory tree enumeration
//! - **batch**: Bounded worker pool and job bookkeeping for one run
//! - **inputs**: Directory/archive inputs, change feed and output locations
//! - **transform**: Full and incremental batch orchestration
//! - **config**: Engine configuration resolution

pub mod archive;
pub mod batch;
pub mod bytecode;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod constant_pool;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod frames;
pub mod inputs;
pub mod instrument;
pub mod max_stack;
mod reader;
pub mod scan;
pub mod transform;
mod typeflow;

#[cfg(test)]
mod testutil;

pub use classfile::{ClassUnit, decode, encode};
pub use error::{EngineError, FormatError, InstrumentationError};
pub use instrument::{ClassTransform, MethodTimer, instrument};
pub use transform::{TransformReport, Transformer};
