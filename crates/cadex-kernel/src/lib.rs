//! CAD Kernel Abstraction
//!
//! This crate provides:
//! - The [`CadKernel`] trait the execution context drives (build, triangulate,
//!   read and write exchange files)
//! - The opaque [`Shape`] handle with its structural hash
//! - [`NullKernel`], which refuses every operation
//! - `TruckKernel`, the B-rep backend built on the truck crates (feature `truck`)

pub mod kernel;

// Re-exports for convenience
pub use kernel::{
    BooleanType, CadError, CadKernel, CadResult, EdgeSegments, ExchangeFormat, FaceTriangulation,
    NullKernel, ReadOutcome, ReadStatus, Shape, ShapeHash, ShapeKind, Transform, Triangulation,
    default_kernel,
};

#[cfg(feature = "truck")]
pub use kernel::{DEFAULT_BOOLEAN_TOLERANCE, TruckKernel};
