//! CAD Kernel trait definitions
//!
//! These traits define the interface that every CAD kernel must implement.
//! The kernel is treated as an opaque capability: it builds shapes,
//! triangulates them and reads or writes exchange files. Everything above it
//! only ever holds [`Shape`] handles.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Structural hash of a shape
///
/// Two shapes built from the same operation with the same inputs carry the
/// same hash. Shapes built outside the memoization path get a unique one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeHash(pub u64);

impl ShapeHash {
    /// A hash that matches no structural key
    pub fn unique() -> Self {
        Self(Uuid::new_v4().as_u128() as u64)
    }
}

impl fmt::Display for ShapeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Topological kind of a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Solid,
    Compound,
    Face,
    Edge,
}

impl ShapeKind {
    /// Get kind name
    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Solid => "Solid",
            ShapeKind::Compound => "Compound",
            ShapeKind::Face => "Face",
            ShapeKind::Edge => "Edge",
        }
    }
}

/// Opaque kernel handle plus its structural hash
///
/// A shape is never mutated in place; operations return new shapes. Cloning
/// is cheap and shares the kernel data.
#[derive(Clone)]
pub struct Shape {
    kind: ShapeKind,
    hash: ShapeHash,
    handle: Arc<dyn Any + Send + Sync>,
}

impl Shape {
    /// Wrap kernel data into a new shape with a unique hash
    pub fn new<T: Any + Send + Sync>(kind: ShapeKind, data: T) -> Self {
        Self {
            kind,
            hash: ShapeHash::unique(),
            handle: Arc::new(data),
        }
    }

    /// Replace the structural hash
    pub fn with_hash(mut self, hash: ShapeHash) -> Self {
        self.hash = hash;
        self
    }

    /// Topological kind
    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    /// Structural hash
    pub fn hash(&self) -> ShapeHash {
        self.hash
    }

    /// Get the kernel data if it is of type `T`
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }

    /// Check whether two shapes share the same kernel data
    pub fn same_handle(&self, other: &Shape) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.handle), Arc::as_ptr(&other.handle))
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shape")
            .field("kind", &self.kind)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// Boolean operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanType {
    /// Union (fuse)
    Union,
    /// Subtraction (cut)
    Subtract,
    /// Intersection (common)
    Intersect,
}

/// Rigid or scaling transform applied to a shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// Move by an offset
    Translate(DVec3),
    /// Rotate about an axis through the origin
    Rotate { axis: DVec3, degrees: f64 },
    /// Uniform scale about the origin
    Scale(f64),
    /// Reflect across the plane through the origin with this normal
    Mirror(DVec3),
}

/// Error type for CAD kernel operations
#[derive(Debug, Clone, Error)]
pub enum CadError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Boolean operation failed: {0}")]
    BooleanFailed(String),

    #[error("Tessellation failed: {0}")]
    TessellationFailed(String),

    #[error("Kernel not available: {0}")]
    KernelNotAvailable(String),

    #[error("Shape was not created by the {0} kernel")]
    ForeignShape(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("STEP export failed: {0}")]
    StepExport(String),
}

/// Result type for CAD operations
pub type CadResult<T> = Result<T, CadError>;

/// Triangulation of a single topological face
///
/// Node indices in `triangles` are 0-based and local to this face.
#[derive(Debug, Clone, Default)]
pub struct FaceTriangulation {
    /// Node positions
    pub nodes: Vec<[f64; 3]>,
    /// Per-node normals, if the kernel provides them
    pub normals: Option<Vec<[f64; 3]>>,
    /// Triangles as node index triples
    pub triangles: Vec<[u32; 3]>,
    /// Face orientation is reversed relative to its surface
    pub reversed: bool,
}

/// Line segments approximating the boundary edges of one face
#[derive(Debug, Clone, Default)]
pub struct EdgeSegments {
    /// Segment endpoints
    pub segments: Vec<[[f64; 3]; 2]>,
}

/// Result of triangulating a shape
///
/// Failures are reported per face and per edge so that callers can keep the
/// topology that did triangulate.
#[derive(Debug, Clone, Default)]
pub struct Triangulation {
    /// One entry per topological face
    pub faces: Vec<CadResult<FaceTriangulation>>,
    /// One entry per edge group
    pub edges: Vec<CadResult<EdgeSegments>>,
}

/// Exchange formats understood by kernel readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeFormat {
    Step,
    Iges,
}

impl ExchangeFormat {
    /// Get format name
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeFormat::Step => "STEP",
            ExchangeFormat::Iges => "IGES",
        }
    }
}

/// Status reported by a file reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// File read successfully
    Done,
    /// Nothing to read
    Void,
    /// File could not be interpreted
    Error,
    /// Reader failed
    Fail,
}

/// Outcome of reading an exchange file and transferring its roots
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Reader status
    pub status: ReadStatus,
    /// Transferred root shapes
    pub roots: Vec<Shape>,
    /// Diagnostic messages from the reader
    pub messages: Vec<String>,
}

impl ReadOutcome {
    /// A failed read with a diagnostic
    pub fn failed(status: ReadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            roots: Vec::new(),
            messages: vec![message.into()],
        }
    }
}

/// The main CAD kernel trait
///
/// Implementations provide the actual geometry operations. Every operation
/// returns a new [`Shape`]; inputs are never modified.
pub trait CadKernel: Send + Sync {
    /// Get the name of this kernel
    fn name(&self) -> &str;

    /// Check if the kernel is available
    fn is_available(&self) -> bool;

    /// Create a box primitive with its corner at the origin, or its center
    /// when `centered` is set
    fn make_box(&self, size: DVec3, centered: bool) -> CadResult<Shape>;

    /// Create a sphere centered at the origin
    fn make_sphere(&self, radius: f64) -> CadResult<Shape>;

    /// Create a cylinder along +Z
    fn make_cylinder(&self, radius: f64, height: f64, centered: bool) -> CadResult<Shape>;

    /// Create a cone (or frustum) along +Z
    fn make_cone(&self, radius1: f64, radius2: f64, height: f64) -> CadResult<Shape>;

    /// Create a planar face from a closed polygon
    fn make_polygon(&self, points: &[DVec3]) -> CadResult<Shape>;

    /// Sweep a planar face along a direction into a prism
    fn extrude(&self, face: &Shape, direction: DVec3) -> CadResult<Shape>;

    /// Perform a boolean operation on two shapes
    fn boolean(&self, a: &Shape, b: &Shape, op: BooleanType) -> CadResult<Shape>;

    /// Apply a transform
    fn transform(&self, shape: &Shape, transform: &Transform) -> CadResult<Shape>;

    /// Group shapes into one compound
    fn make_compound(&self, shapes: &[Shape]) -> CadResult<Shape>;

    /// Triangulate a shape within a chordal deviation
    fn triangulate(&self, shape: &Shape, deviation: f64) -> CadResult<Triangulation>;

    /// Read an exchange file and transfer all of its roots
    fn read_file(&self, format: ExchangeFormat, path: &Path) -> CadResult<ReadOutcome>;

    /// Write a shape to a STEP file
    fn write_step(&self, shape: &Shape, path: &Path) -> CadResult<()>;
}

/// A null kernel that always returns errors (used when no kernel is available)
#[derive(Debug, Default)]
pub struct NullKernel;

impl NullKernel {
    fn unavailable<T>() -> CadResult<T> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available".into(),
        ))
    }
}

impl CadKernel for NullKernel {
    fn name(&self) -> &str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn make_box(&self, _size: DVec3, _centered: bool) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn make_sphere(&self, _radius: f64) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn make_cylinder(&self, _radius: f64, _height: f64, _centered: bool) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn make_cone(&self, _radius1: f64, _radius2: f64, _height: f64) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn make_polygon(&self, _points: &[DVec3]) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn extrude(&self, _face: &Shape, _direction: DVec3) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn boolean(&self, _a: &Shape, _b: &Shape, _op: BooleanType) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn transform(&self, _shape: &Shape, _transform: &Transform) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn make_compound(&self, _shapes: &[Shape]) -> CadResult<Shape> {
        Self::unavailable()
    }

    fn triangulate(&self, _shape: &Shape, _deviation: f64) -> CadResult<Triangulation> {
        Self::unavailable()
    }

    fn read_file(&self, _format: ExchangeFormat, _path: &Path) -> CadResult<ReadOutcome> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available for file import".into(),
        ))
    }

    fn write_step(&self, _shape: &Shape, _path: &Path) -> CadResult<()> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available for STEP export".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_hash_override() {
        let shape = Shape::new(ShapeKind::Solid, 42u32).with_hash(ShapeHash(7));
        assert_eq!(shape.hash(), ShapeHash(7));
        assert_eq!(shape.kind(), ShapeKind::Solid);
    }

    #[test]
    fn test_shape_downcast() {
        let shape = Shape::new(ShapeKind::Face, String::from("data"));
        assert_eq!(shape.downcast::<String>().as_deref().map(String::as_str), Some("data"));
        assert!(shape.downcast::<u32>().is_none());

        let clone = shape.clone();
        assert!(shape.same_handle(&clone));
        assert!(!shape.same_handle(&Shape::new(ShapeKind::Face, String::from("data"))));
    }

    #[test]
    fn test_null_kernel_refuses() {
        let kernel = NullKernel;
        assert!(!kernel.is_available());
        assert!(matches!(
            kernel.make_box(DVec3::ONE, false),
            Err(CadError::KernelNotAvailable(_))
        ));
    }
}
