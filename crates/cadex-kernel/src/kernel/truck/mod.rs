//! Truck CAD Kernel Backend
//!
//! Pure Rust B-Rep kernel using the Truck library. Primitives are built by
//! sweeping, booleans go through truck-shapeops and STEP goes through
//! truck-stepio. IGES input is limited to planar polylines.

mod iges;
mod mesh;
mod step;

use std::f64::consts::TAU;
use std::path::Path;
use std::sync::Arc;

use glam::{DMat3, DMat4, DVec3};
use tracing::debug;
use truck_meshalgo::prelude::*;
use truck_modeling::{Face, Matrix4, Point3, Rad, Shell, Solid, Vector3, Vertex, Wire, builder};

use super::{
    BooleanType, CadError, CadKernel, CadResult, ExchangeFormat, ReadOutcome, ReadStatus, Shape,
    ShapeKind, Transform, Triangulation,
};

/// Tolerance handed to truck-shapeops
pub const DEFAULT_BOOLEAN_TOLERANCE: f64 = 0.05;

const KERNEL_NAME: &str = "truck";

/// Meshing tolerance floor; truck rejects tolerances near zero
const MIN_DEVIATION: f64 = 1e-4;

/// Tolerance for planarity and degenerate-geometry checks
const GEOMETRY_TOLERANCE: f64 = 1e-9;

/// Kernel data held inside a [`Shape`]
pub(crate) enum Body {
    Solid(Solid),
    Face(Face),
    Imported(Imported),
    Compound(Vec<Arc<Body>>),
}

/// Shell read from a STEP file plus the transforms applied since
pub(crate) struct Imported {
    mesher: step::Mesher,
    matrix: DMat4,
}

impl Imported {
    fn triangulate(&self, tolerance: f64) -> Triangulation {
        let mut result = (self.mesher)(tolerance);
        if self.matrix == DMat4::IDENTITY {
            return result;
        }
        let flip = self.matrix.determinant() < 0.0;
        for face in result.faces.iter_mut().flatten() {
            for node in &mut face.nodes {
                *node = self.matrix.transform_point3(DVec3::from_array(*node)).to_array();
            }
            // Recomputed from the moved nodes downstream
            face.normals = None;
            face.reversed ^= flip;
        }
        for edge in result.edges.iter_mut().flatten() {
            for segment in &mut edge.segments {
                for end in segment.iter_mut() {
                    *end = self.matrix.transform_point3(DVec3::from_array(*end)).to_array();
                }
            }
        }
        result
    }
}

/// Truck-based CAD kernel
#[derive(Debug, Clone)]
pub struct TruckKernel {
    boolean_tolerance: f64,
}

impl TruckKernel {
    /// Create a new Truck kernel
    pub fn new() -> Self {
        Self {
            boolean_tolerance: DEFAULT_BOOLEAN_TOLERANCE,
        }
    }

    /// Set the tolerance used by boolean operations
    pub fn with_boolean_tolerance(mut self, tolerance: f64) -> Self {
        if tolerance.is_finite() && tolerance > 0.0 {
            self.boolean_tolerance = tolerance;
        }
        self
    }

    fn body(&self, shape: &Shape) -> CadResult<Arc<Body>> {
        shape
            .downcast::<Body>()
            .ok_or_else(|| CadError::ForeignShape(KERNEL_NAME.into()))
    }

    fn shape(kind: ShapeKind, body: Body) -> Shape {
        Shape::new(kind, body)
    }

    /// Single solid operand of a boolean; compounds are fused first
    fn operand(&self, shape: &Shape, op: BooleanType) -> CadResult<Solid> {
        let body = self.body(shape)?;
        let mut solids = Vec::new();
        collect_solids(&body, &mut solids).map_err(|kind| {
            CadError::BooleanFailed(format!("{op:?} needs solids, got {kind}"))
        })?;
        let mut solids = solids.into_iter();
        let first = solids
            .next()
            .ok_or_else(|| CadError::BooleanFailed(format!("{op:?} needs solids")))?;
        solids.try_fold(first, |acc, next| {
            truck_shapeops::or(&acc, &next, self.boolean_tolerance).ok_or_else(|| {
                CadError::BooleanFailed("could not fuse compound members".into())
            })
        })
    }
}

impl Default for TruckKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn positive(name: &str, value: f64) -> CadResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(CadError::InvalidArgument(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

fn finite_vec(name: &str, v: DVec3) -> CadResult<DVec3> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CadError::InvalidArgument(format!("{name} must be finite")))
    }
}

fn unit_axis(name: &str, v: DVec3) -> CadResult<DVec3> {
    let v = finite_vec(name, v)?;
    v.try_normalize()
        .ok_or_else(|| CadError::InvalidArgument(format!("{name} must not be zero")))
}

fn point(v: DVec3) -> Point3 {
    Point3::new(v.x, v.y, v.z)
}

fn vector(v: DVec3) -> Vector3 {
    Vector3::new(v.x, v.y, v.z)
}

fn transform_matrix(transform: &Transform) -> CadResult<DMat4> {
    match *transform {
        Transform::Translate(offset) => Ok(DMat4::from_translation(finite_vec("offset", offset)?)),
        Transform::Rotate { axis, degrees } => {
            let axis = unit_axis("rotation axis", axis)?;
            if !degrees.is_finite() {
                return Err(CadError::InvalidArgument("angle must be finite".into()));
            }
            Ok(DMat4::from_axis_angle(axis, degrees.to_radians()))
        }
        Transform::Scale(factor) => {
            if !factor.is_finite() || factor.abs() < GEOMETRY_TOLERANCE {
                return Err(CadError::InvalidArgument(format!(
                    "scale factor must be non-zero, got {factor}"
                )));
            }
            Ok(DMat4::from_scale(DVec3::splat(factor)))
        }
        Transform::Mirror(normal) => {
            let n = unit_axis("mirror normal", normal)?;
            let reflect = DMat3::from_cols(
                DVec3::X - 2.0 * n * n.x,
                DVec3::Y - 2.0 * n * n.y,
                DVec3::Z - 2.0 * n * n.z,
            );
            Ok(DMat4::from_mat3(reflect))
        }
    }
}

/// Newell normal of a closed polygon (length is twice the area)
fn newell_normal(points: &[DVec3]) -> DVec3 {
    let mut normal = DVec3::ZERO;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        normal.x += (a.y - b.y) * (a.z + b.z);
        normal.y += (a.z - b.z) * (a.x + b.x);
        normal.z += (a.x - b.x) * (a.y + b.y);
    }
    normal
}

/// Validate a closed planar polygon and drop a repeated closing point
fn planar_outline(points: &[DVec3]) -> CadResult<Vec<DVec3>> {
    let mut outline: Vec<DVec3> = points.to_vec();
    if outline.len() > 1 && outline[0].distance(outline[outline.len() - 1]) < GEOMETRY_TOLERANCE {
        outline.pop();
    }
    if outline.len() < 3 {
        return Err(CadError::InvalidArgument(format!(
            "polygon needs at least 3 points, got {}",
            outline.len()
        )));
    }
    if outline.iter().any(|p| !p.is_finite()) {
        return Err(CadError::InvalidArgument(
            "polygon points must be finite".into(),
        ));
    }
    let normal = newell_normal(&outline)
        .try_normalize()
        .ok_or_else(|| CadError::InvalidArgument("polygon has zero area".into()))?;
    let centroid = outline.iter().copied().sum::<DVec3>() / outline.len() as f64;
    let extent = outline
        .iter()
        .map(|p| p.distance(centroid))
        .fold(0.0_f64, f64::max);
    let tolerance = 1e-6 * extent.max(1.0);
    if outline
        .iter()
        .any(|p| normal.dot(*p - centroid).abs() > tolerance)
    {
        return Err(CadError::InvalidArgument("polygon is not planar".into()));
    }
    Ok(outline)
}

/// Closed wire of straight edges through `points`
fn polyline_wire(points: &[DVec3]) -> Wire {
    let vertices: Vec<Vertex> = points.iter().map(|p| builder::vertex(point(*p))).collect();
    let n = vertices.len();
    (0..n)
        .map(|i| builder::line(&vertices[i], &vertices[(i + 1) % n]))
        .collect::<Vec<_>>()
        .into()
}

/// Revolve an open profile in the XZ plane once around +Z
///
/// The profile runs from the top of the axis, away from it and back down,
/// which gives an outward-facing shell.
fn revolve(profile: &[DVec3]) -> CadResult<Solid> {
    let vertices: Vec<Vertex> = profile.iter().map(|p| builder::vertex(point(*p))).collect();
    let wire: Wire = vertices
        .windows(2)
        .map(|pair| builder::line(&pair[0], &pair[1]))
        .collect::<Vec<_>>()
        .into();
    let shell = builder::cone(&wire, Vector3::new(0.0, 0.0, 1.0), Rad(TAU));
    Solid::try_new(vec![shell])
        .map_err(|e| CadError::OperationFailed(format!("revolved profile is not closed: {e:?}")))
}

/// Outer boundary points of a face in its oriented winding
fn face_points(face: &Face) -> Vec<DVec3> {
    face.boundaries()
        .first()
        .map(|wire| {
            wire.vertex_iter()
                .map(|v| {
                    let p = v.point();
                    DVec3::new(p.x, p.y, p.z)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Every solid in a body; the error names the first non-solid kind
fn collect_solids(body: &Body, out: &mut Vec<Solid>) -> Result<(), &'static str> {
    match body {
        Body::Solid(solid) => {
            out.push(solid.clone());
            Ok(())
        }
        Body::Compound(children) => children
            .iter()
            .try_for_each(|child| collect_solids(child, out)),
        Body::Face(_) => Err(ShapeKind::Face.name()),
        Body::Imported(_) => Err("an imported shape"),
    }
}

fn transformed(body: &Body, matrix: &DMat4) -> Body {
    let flip = matrix.determinant() < 0.0;
    let truck_matrix = Matrix4::from(matrix.to_cols_array_2d());
    match body {
        Body::Solid(solid) => {
            let mut solid = builder::transformed(solid, truck_matrix);
            // Reflections turn the shell inside out
            if flip {
                solid.not();
            }
            Body::Solid(solid)
        }
        Body::Face(face) => {
            let face = builder::transformed(face, truck_matrix);
            Body::Face(if flip { face.inverse() } else { face })
        }
        Body::Imported(imported) => Body::Imported(Imported {
            mesher: imported.mesher.clone(),
            matrix: *matrix * imported.matrix,
        }),
        Body::Compound(children) => Body::Compound(
            children
                .iter()
                .map(|child| Arc::new(transformed(child, matrix)))
                .collect(),
        ),
    }
}

fn mesh_body(body: &Body, tolerance: f64, out: &mut Triangulation) {
    match body {
        Body::Solid(solid) => {
            for shell in solid.triangulation(tolerance).compress().boundaries {
                mesh::collect(&shell, out);
            }
        }
        Body::Face(face) => {
            let shell = Shell::from(vec![face.clone()]);
            mesh::collect(&shell.triangulation(tolerance).compress(), out);
        }
        Body::Imported(imported) => {
            let result = imported.triangulate(tolerance);
            out.faces.extend(result.faces);
            out.edges.extend(result.edges);
        }
        Body::Compound(children) => {
            for child in children {
                mesh_body(child, tolerance, out);
            }
        }
    }
}

impl CadKernel for TruckKernel {
    fn name(&self) -> &str {
        KERNEL_NAME
    }

    fn is_available(&self) -> bool {
        true
    }

    fn make_box(&self, size: DVec3, centered: bool) -> CadResult<Shape> {
        let size = DVec3::new(
            positive("box width", size.x)?,
            positive("box depth", size.y)?,
            positive("box height", size.z)?,
        );
        let min = if centered { -size / 2.0 } else { DVec3::ZERO };

        let vertex = builder::vertex(point(min));
        let edge = builder::tsweep(&vertex, Vector3::new(size.x, 0.0, 0.0));
        let face = builder::tsweep(&edge, Vector3::new(0.0, size.y, 0.0));
        let solid = builder::tsweep(&face, Vector3::new(0.0, 0.0, size.z));
        Ok(Self::shape(ShapeKind::Solid, Body::Solid(solid)))
    }

    fn make_sphere(&self, radius: f64) -> CadResult<Shape> {
        let radius = positive("sphere radius", radius)?;
        let top = builder::vertex(Point3::new(0.0, 0.0, radius));
        let bottom = builder::vertex(Point3::new(0.0, 0.0, -radius));
        let arc = builder::circle_arc(&top, &bottom, Point3::new(radius, 0.0, 0.0));
        let wire: Wire = vec![arc].into();
        let shell = builder::cone(&wire, Vector3::new(0.0, 0.0, 1.0), Rad(TAU));
        let solid = Solid::try_new(vec![shell])
            .map_err(|e| CadError::OperationFailed(format!("sphere is not closed: {e:?}")))?;
        Ok(Self::shape(ShapeKind::Solid, Body::Solid(solid)))
    }

    fn make_cylinder(&self, radius: f64, height: f64, centered: bool) -> CadResult<Shape> {
        let radius = positive("cylinder radius", radius)?;
        let height = positive("cylinder height", height)?;
        let z0 = if centered { -height / 2.0 } else { 0.0 };
        let z1 = z0 + height;
        let solid = revolve(&[
            DVec3::new(0.0, 0.0, z1),
            DVec3::new(radius, 0.0, z1),
            DVec3::new(radius, 0.0, z0),
            DVec3::new(0.0, 0.0, z0),
        ])?;
        Ok(Self::shape(ShapeKind::Solid, Body::Solid(solid)))
    }

    fn make_cone(&self, radius1: f64, radius2: f64, height: f64) -> CadResult<Shape> {
        let height = positive("cone height", height)?;
        let valid = |r: f64| r.is_finite() && r >= 0.0;
        if !valid(radius1) || !valid(radius2) || (radius1 == 0.0 && radius2 == 0.0) {
            return Err(CadError::InvalidArgument(format!(
                "cone radii must be non-negative and not both zero, got {radius1} and {radius2}"
            )));
        }

        // A zero radius collapses that cap into the apex
        let mut profile = vec![DVec3::new(0.0, 0.0, height)];
        if radius2 > 0.0 {
            profile.push(DVec3::new(radius2, 0.0, height));
        }
        if radius1 > 0.0 {
            profile.push(DVec3::new(radius1, 0.0, 0.0));
        }
        profile.push(DVec3::ZERO);
        let solid = revolve(&profile)?;
        Ok(Self::shape(ShapeKind::Solid, Body::Solid(solid)))
    }

    fn make_polygon(&self, points: &[DVec3]) -> CadResult<Shape> {
        let outline = planar_outline(points)?;
        let face = builder::try_attach_plane(&[polyline_wire(&outline)])
            .map_err(|e| CadError::OperationFailed(format!("Failed to create face: {:?}", e)))?;
        Ok(Self::shape(ShapeKind::Face, Body::Face(face)))
    }

    fn extrude(&self, face: &Shape, direction: DVec3) -> CadResult<Shape> {
        if face.kind() != ShapeKind::Face {
            return Err(CadError::InvalidArgument(format!(
                "extrude needs a Face, got {}",
                face.kind().name()
            )));
        }
        let direction = finite_vec("extrude direction", direction)?;
        let body = self.body(face)?;
        let Body::Face(face) = body.as_ref() else {
            return Err(CadError::InvalidArgument(
                "extrude needs a planar polygon face".into(),
            ));
        };

        let along = newell_normal(&face_points(face)).dot(direction);
        if along.abs() < GEOMETRY_TOLERANCE {
            return Err(CadError::InvalidArgument(
                "extrude direction lies in the profile plane".into(),
            ));
        }
        // Sweeping along the face normal keeps the solid outward-facing
        let face = if along < 0.0 { face.inverse() } else { face.clone() };
        let solid = builder::tsweep(&face, vector(direction));
        Ok(Self::shape(ShapeKind::Solid, Body::Solid(solid)))
    }

    fn boolean(&self, a: &Shape, b: &Shape, op: BooleanType) -> CadResult<Shape> {
        let a = self.operand(a, op)?;
        let b = self.operand(b, op)?;
        let tolerance = self.boolean_tolerance;

        let result = match op {
            BooleanType::Union => truck_shapeops::or(&a, &b, tolerance),
            BooleanType::Intersect => truck_shapeops::and(&a, &b, tolerance),
            BooleanType::Subtract => {
                let mut tool = b;
                tool.not();
                truck_shapeops::and(&a, &tool, tolerance)
            }
        };
        let solid = result
            .ok_or_else(|| CadError::BooleanFailed(format!("{op:?} did not produce a solid")))?;
        Ok(Self::shape(ShapeKind::Solid, Body::Solid(solid)))
    }

    fn transform(&self, shape: &Shape, transform: &Transform) -> CadResult<Shape> {
        let matrix = transform_matrix(transform)?;
        let body = self.body(shape)?;
        Ok(Self::shape(shape.kind(), transformed(&body, &matrix)))
    }

    fn make_compound(&self, shapes: &[Shape]) -> CadResult<Shape> {
        if shapes.is_empty() {
            return Err(CadError::InvalidArgument(
                "compound needs at least one shape".into(),
            ));
        }
        let children = shapes
            .iter()
            .map(|s| self.body(s))
            .collect::<CadResult<Vec<_>>>()?;
        Ok(Self::shape(ShapeKind::Compound, Body::Compound(children)))
    }

    fn triangulate(&self, shape: &Shape, deviation: f64) -> CadResult<Triangulation> {
        let deviation = positive("deviation", deviation)?.max(MIN_DEVIATION);
        let body = self.body(shape)?;
        let mut result = Triangulation::default();
        mesh_body(&body, deviation, &mut result);
        debug!(
            "Triangulated {} into {} faces at deviation {}",
            shape.kind().name(),
            result.faces.len(),
            deviation
        );
        Ok(result)
    }

    fn read_file(&self, format: ExchangeFormat, path: &Path) -> CadResult<ReadOutcome> {
        let bytes = std::fs::read(path)
            .map_err(|e| CadError::FileIo(format!("{}: {}", path.display(), e)))?;
        let text = String::from_utf8_lossy(&bytes);

        match format {
            ExchangeFormat::Step => {
                let contents = step::read(&text);
                let roots = contents
                    .roots
                    .into_iter()
                    .map(|root| {
                        let kind = if root.faces == 1 {
                            ShapeKind::Face
                        } else {
                            ShapeKind::Solid
                        };
                        let imported = Imported {
                            mesher: root.mesher,
                            matrix: DMat4::IDENTITY,
                        };
                        Self::shape(kind, Body::Imported(imported))
                    })
                    .collect();
                Ok(ReadOutcome {
                    status: contents.status,
                    roots,
                    messages: contents.messages,
                })
            }
            ExchangeFormat::Iges => {
                let contents = iges::read(&text);
                let mut messages = contents.messages;
                let mut roots = Vec::new();
                for (index, polyline) in contents.polylines.iter().enumerate() {
                    match self.make_polygon(polyline) {
                        Ok(face) => roots.push(face),
                        Err(e) => messages.push(format!("polyline {}: {}", index + 1, e)),
                    }
                }
                Ok(ReadOutcome {
                    status: contents.status,
                    roots,
                    messages,
                })
            }
        }
    }

    fn write_step(&self, shape: &Shape, path: &Path) -> CadResult<()> {
        let body = self.body(shape)?;
        let mut solids = Vec::new();
        collect_solids(&body, &mut solids).map_err(|kind| {
            CadError::StepExport(format!("only modeled solids can be written, got {kind}"))
        })?;
        if solids.is_empty() {
            return Err(CadError::StepExport("shape has no solids to write".into()));
        }

        let text = step::write(&solids);
        std::fs::write(path, text)
            .map_err(|e| CadError::FileIo(format!("{}: {}", path.display(), e)))?;
        debug!("Wrote {} STEP solids to {}", solids.len(), path.display());
        Ok(())
    }
}

/// Read status for a reader that found entities but no usable geometry
pub(crate) fn status_for(entities: usize) -> ReadStatus {
    if entities == 0 {
        ReadStatus::Void
    } else {
        ReadStatus::Done
    }
}
