//! CAD kernel trait and backends

mod traits;

#[cfg(feature = "truck")]
mod truck;

pub use traits::{
    BooleanType, CadError, CadKernel, CadResult, EdgeSegments, ExchangeFormat, FaceTriangulation,
    NullKernel, ReadOutcome, ReadStatus, Shape, ShapeHash, ShapeKind, Transform, Triangulation,
};

#[cfg(feature = "truck")]
pub use truck::{DEFAULT_BOOLEAN_TOLERANCE, TruckKernel};

use std::sync::Arc;

/// Get the default CAD kernel
pub fn default_kernel() -> Arc<dyn CadKernel> {
    #[cfg(feature = "truck")]
    {
        Arc::new(TruckKernel::new())
    }

    #[cfg(not(feature = "truck"))]
    {
        Arc::new(NullKernel)
    }
}
