//! Error types for the precode engine.

use crate::Pcode;
use crate::loader::MemoryError;
use crate::precode::{Isa, PrecodeKind};

/// Recoverable failures of precode allocation and patching.
///
/// Broken invariants (an unrecognized precode where one must exist) are not
/// represented here; they abort through a panic.
#[derive(Debug)]
pub enum PrecodeError {
    /// The loader allocator could not satisfy a request.
    OutOfMemory { size: usize, align: usize },
    /// The underlying mapping failed.
    Memory(MemoryError),
    /// A rel32 operand cannot reach `target`, even through a jump stub.
    TargetOutOfRange { from: Pcode, target: Pcode },
    /// The requested kind is not available on this ISA.
    UnsupportedKind { kind: PrecodeKind, isa: Isa },
    /// Temporary entry points were requested for a chunk with no methods.
    EmptyChunk,
    /// Invalid engine configuration.
    Config(String),
}

impl std::fmt::Display for PrecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecodeError::OutOfMemory { size, align } => {
                write!(f, "out of memory allocating {} bytes (align {})", size, align)
            }
            PrecodeError::Memory(e) => write!(f, "loader heap: {}", e),
            PrecodeError::TargetOutOfRange { from, target } => write!(
                f,
                "target {:#x} is out of rel32 range of {:#x}",
                target, from
            ),
            PrecodeError::UnsupportedKind { kind, isa } => {
                write!(f, "{} precodes are not available on {}", kind, isa)
            }
            PrecodeError::EmptyChunk => write!(f, "method desc chunk has no methods"),
            PrecodeError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for PrecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrecodeError::Memory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MemoryError> for PrecodeError {
    fn from(e: MemoryError) -> Self {
        PrecodeError::Memory(e)
    }
}
