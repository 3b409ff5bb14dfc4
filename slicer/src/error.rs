//! Errors reported back to the caller of the slicing pipeline.
//!
//! Only configuration problems are reported this way; none of them can be recovered from by
//! retrying, and the analysis must not proceed past any of them. Broken internal invariants
//! (between the analyses and the points-to oracle) are not errors, and abort instead.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlicerError {
    /// The configured entry function does not exist in the program
    #[error("entry function '{0}' is not found (or unreachable)")]
    EntryNotFound(String),
    /// A configured target function does not exist in the (trimmed) program
    #[error("function '{0}' is not found (or unreachable)")]
    TargetNotFound(String),
    /// A target function was listed more than once
    #[error("target function '{0}' is listed more than once")]
    DuplicateTarget(String),
    /// No side effect of the function carries the slice id
    #[error("function '{function}' has no side effect with slice id {slice_id}")]
    NoSuchSideEffect { function: String, slice_id: u32 },
    /// A slice was requested before the cloner produced it
    #[error("no clone of '{function}' exists for slice {slice_id}; cloning must run first")]
    SliceNotCloned { function: String, slice_id: u32 },
}
