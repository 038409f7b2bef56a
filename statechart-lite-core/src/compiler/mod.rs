//! Chart compilation pipeline: description model → verification → one of
//! the three executable layouts.

pub mod desc;
pub mod lowering;
pub mod parser;
pub mod symbols;
pub mod verifier;

use crate::error::CompileError;
use crate::types::{Layout, Program};
use desc::StateDesc;
use verifier::Skeleton;

/// Verify a description tree and lower it into the requested layout.
pub fn compile(desc: &StateDesc, layout: Layout) -> Result<Program, CompileError> {
    let skeleton = Skeleton::build(desc)?;
    verifier::verify_or_err(&skeleton)?;
    lowering::lower(desc, &skeleton, layout)
}
