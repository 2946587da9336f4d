//! Workspace placeholder crate.
//!
//! Re-exports the workspace crates so host applications can depend on
//! `decode-pipeline-workspace` alone.

pub use core_decode as decode;
pub use core_runtime as runtime;
