//! Precode - stable, retargetable method entry stubs
//!
//! This library provides the precode engine of a managed runtime: small
//! fixed-layout machine-code stubs that give every method a callable address
//! whose target can be swapped (prestub -> compiled code) without patching
//! call sites.
//! Precompiled image support and diagnostic introspection sit behind the
//! `image` and `introspection` features.

pub mod config;
pub mod entry_points;
pub mod error;
#[cfg(feature = "image")]
pub mod image;
#[cfg(feature = "introspection")]
pub mod introspect;
pub mod loader;
pub mod method;
pub mod precode;

/// A code address, as stored in precode target slots.
pub type Pcode = usize;

// Re-export commonly used types
pub use config::{EngineConfig, IsaMode};
pub use entry_points::{
    AllocatedEntryPoints, EntryPointPlan, TemporaryEntryPointAllocator, TemporaryEntryPoints,
};
pub use error::PrecodeError;
pub use loader::{LoaderAllocator, LoaderHeap, LoaderHeapConfig, Trampolines};
pub use method::{MethodDef, MethodDesc, MethodDescChunk, MethodFlags, MethodToken, PrecodeAccess};
pub use precode::{Isa, Precode, PrecodeCapabilities, PrecodeKind};
