//! Mesh extraction
//!
//! Converts one kernel shape into flat triangle buffers. This is the single
//! tessellation routine behind preview meshes and the STL and OBJ writers.
//! Faces and edges that fail are skipped with a warning; they never fail the
//! whole extraction.

mod normals;

use cadex_kernel::{CadKernel, CadResult, FaceTriangulation, Shape};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use normals::{calculate_triangle_normal, calculate_vertex_normals};

/// Flat triangle list with a shared index space
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshBuffers {
    /// Positions, three floats per vertex
    pub vertices: Vec<f32>,
    /// Normals, three floats per vertex
    pub normals: Vec<f32>,
    /// Triangle corners, three per triangle
    pub indices: Vec<u32>,
}

impl MeshBuffers {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn position(&self, index: usize) -> [f32; 3] {
        let i = index * 3;
        [self.vertices[i], self.vertices[i + 1], self.vertices[i + 2]]
    }

    pub fn normal(&self, index: usize) -> [f32; 3] {
        let i = index * 3;
        [self.normals[i], self.normals[i + 1], self.normals[i + 2]]
    }

    /// Triangles as index triples
    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        self.indices.chunks_exact(3).map(|c| [c[0], c[1], c[2]])
    }

    /// Axis-aligned bounds, `None` for an empty mesh
    pub fn bounding_box(&self) -> Option<([f32; 3], [f32; 3])> {
        if self.vertices.is_empty() {
            return None;
        }
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for v in self.vertices.chunks_exact(3) {
            for axis in 0..3 {
                min[axis] = min[axis].min(v[axis]);
                max[axis] = max[axis].max(v[axis]);
            }
        }
        Some((min, max))
    }

    /// Append another mesh, offsetting its indices
    pub fn append(&mut self, other: &MeshBuffers) {
        let vertex_offset = self.vertex_count() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.normals.extend_from_slice(&other.normals);
        self.indices
            .extend(other.indices.iter().map(|i| i + vertex_offset));
    }
}

/// Independent line segments for a wireframe overlay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeBuffers {
    /// Segment endpoints, six floats per segment
    pub positions: Vec<f32>,
}

impl EdgeBuffers {
    pub fn segment_count(&self) -> usize {
        self.positions.len() / 6
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Result of extracting one shape
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub mesh: MeshBuffers,
    pub edges: EdgeBuffers,
    /// Faces skipped because they failed to triangulate
    pub skipped_faces: usize,
    /// Edge groups skipped because they failed to discretize
    pub skipped_edges: usize,
}

/// Reject faces whose triangles reference missing nodes
fn check_face(face: &FaceTriangulation) -> Result<(), String> {
    let count = face.nodes.len();
    match face
        .triangles
        .iter()
        .flatten()
        .find(|&&i| i as usize >= count)
    {
        Some(i) => Err(format!("triangle index {i} out of range for {count} nodes")),
        None => Ok(()),
    }
}

fn append_face(mesh: &mut MeshBuffers, face: &FaceTriangulation) {
    let vertex_offset = mesh.vertex_count() as u32;

    let positions: Vec<[f32; 3]> = face
        .nodes
        .iter()
        .map(|n| [n[0] as f32, n[1] as f32, n[2] as f32])
        .collect();
    let triangles: Vec<[u32; 3]> = face
        .triangles
        .iter()
        .map(|&[a, b, c]| if face.reversed { [a, c, b] } else { [a, b, c] })
        .collect();

    let normals: Vec<[f32; 3]> = match &face.normals {
        Some(normals) if normals.len() == face.nodes.len() => {
            let sign = if face.reversed { -1.0 } else { 1.0 };
            normals
                .iter()
                .map(|n| [(sign * n[0]) as f32, (sign * n[1]) as f32, (sign * n[2]) as f32])
                .collect()
        }
        _ => calculate_vertex_normals(&positions, &triangles),
    };

    mesh.vertices.extend(positions.iter().flatten());
    mesh.normals.extend(normals.iter().flatten());
    mesh.indices.extend(
        triangles
            .iter()
            .flatten()
            .map(|i| i + vertex_offset),
    );
}

/// Triangulate a shape and flatten it into buffers
///
/// Fails only when the kernel cannot triangulate the shape at all.
pub fn extract(
    kernel: &dyn CadKernel,
    shape: &Shape,
    deviation: f64,
    with_edges: bool,
) -> CadResult<Extraction> {
    let triangulation = kernel.triangulate(shape, deviation)?;
    let mut result = Extraction::default();

    for (index, face) in triangulation.faces.iter().enumerate() {
        let face = match face {
            Ok(face) => face,
            Err(e) => {
                warn!("Skipping face {}: {}", index, e);
                result.skipped_faces += 1;
                continue;
            }
        };
        if let Err(reason) = check_face(face) {
            warn!("Skipping face {}: {}", index, reason);
            result.skipped_faces += 1;
            continue;
        }
        append_face(&mut result.mesh, face);
    }

    if with_edges {
        for (index, edge) in triangulation.edges.iter().enumerate() {
            match edge {
                Ok(edge) => {
                    for [a, b] in &edge.segments {
                        result
                            .edges
                            .positions
                            .extend(a.iter().chain(b.iter()).map(|v| *v as f32));
                    }
                }
                Err(e) => {
                    warn!("Skipping edge group {}: {}", index, e);
                    result.skipped_edges += 1;
                }
            }
        }
    }

    debug!(
        "Extracted {} vertices, {} triangles, {} edge segments ({} faces skipped)",
        result.mesh.vertex_count(),
        result.mesh.triangle_count(),
        result.edges.segment_count(),
        result.skipped_faces
    );
    Ok(result)
}

/// Triangle buffers only, for file writers
pub fn extract_mesh(kernel: &dyn CadKernel, shape: &Shape, deviation: f64) -> CadResult<MeshBuffers> {
    Ok(extract(kernel, shape, deviation, false)?.mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadex_kernel::{
        BooleanType, CadError, EdgeSegments, ExchangeFormat, TruckKernel, ReadOutcome, ShapeKind,
        Transform, Triangulation,
    };
    use glam::DVec3;
    use std::path::Path;

    /// Kernel returning a fixed triangulation
    struct ScriptedKernel(Triangulation);

    impl CadKernel for ScriptedKernel {
        fn name(&self) -> &str {
            "scripted"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn make_box(&self, _: DVec3, _: bool) -> CadResult<Shape> {
            unimplemented!()
        }
        fn make_sphere(&self, _: f64) -> CadResult<Shape> {
            unimplemented!()
        }
        fn make_cylinder(&self, _: f64, _: f64, _: bool) -> CadResult<Shape> {
            unimplemented!()
        }
        fn make_cone(&self, _: f64, _: f64, _: f64) -> CadResult<Shape> {
            unimplemented!()
        }
        fn make_polygon(&self, _: &[DVec3]) -> CadResult<Shape> {
            unimplemented!()
        }
        fn extrude(&self, _: &Shape, _: DVec3) -> CadResult<Shape> {
            unimplemented!()
        }
        fn boolean(&self, _: &Shape, _: &Shape, _: BooleanType) -> CadResult<Shape> {
            unimplemented!()
        }
        fn transform(&self, _: &Shape, _: &Transform) -> CadResult<Shape> {
            unimplemented!()
        }
        fn make_compound(&self, _: &[Shape]) -> CadResult<Shape> {
            unimplemented!()
        }
        fn triangulate(&self, _: &Shape, _: f64) -> CadResult<Triangulation> {
            Ok(self.0.clone())
        }
        fn read_file(&self, _: ExchangeFormat, _: &Path) -> CadResult<ReadOutcome> {
            unimplemented!()
        }
        fn write_step(&self, _: &Shape, _: &Path) -> CadResult<()> {
            unimplemented!()
        }
    }

    fn unit_triangle(reversed: bool) -> FaceTriangulation {
        FaceTriangulation {
            nodes: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            normals: None,
            triangles: vec![[0, 1, 2]],
            reversed,
        }
    }

    fn any_shape() -> Shape {
        Shape::new(ShapeKind::Solid, ())
    }

    #[test]
    fn test_offsets_and_reversed_winding() {
        let kernel = ScriptedKernel(Triangulation {
            faces: vec![Ok(unit_triangle(false)), Ok(unit_triangle(true))],
            edges: Vec::new(),
        });
        let result = extract(&kernel, &any_shape(), 0.1, true).unwrap();
        assert_eq!(result.mesh.vertex_count(), 6);
        assert_eq!(result.mesh.indices, vec![0, 1, 2, 3, 5, 4]);
        // Flipped winding flips the recomputed normal
        assert_eq!(result.mesh.normal(0), [0.0, 0.0, 1.0]);
        assert_eq!(result.mesh.normal(3), [0.0, 0.0, -1.0]);
    }

    #[test]
    fn test_kernel_normals_are_used() {
        let mut face = unit_triangle(false);
        face.normals = Some(vec![[1.0, 0.0, 0.0]; 3]);
        let kernel = ScriptedKernel(Triangulation {
            faces: vec![Ok(face)],
            edges: Vec::new(),
        });
        let result = extract(&kernel, &any_shape(), 0.1, false).unwrap();
        assert_eq!(result.mesh.normal(2), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_partial_failures_are_skipped() {
        let mut bad_index = unit_triangle(false);
        bad_index.triangles.push([0, 1, 9]);
        let kernel = ScriptedKernel(Triangulation {
            faces: vec![
                Err(CadError::TessellationFailed("degenerate".into())),
                Ok(bad_index),
                Ok(unit_triangle(false)),
            ],
            edges: vec![
                Err(CadError::TessellationFailed("edge".into())),
                Ok(EdgeSegments {
                    segments: vec![[[0.0; 3], [1.0, 0.0, 0.0]]],
                }),
            ],
        });
        let result = extract(&kernel, &any_shape(), 0.1, true).unwrap();
        assert_eq!(result.skipped_faces, 2);
        assert_eq!(result.skipped_edges, 1);
        assert_eq!(result.mesh.triangle_count(), 1);
        assert_eq!(result.edges.positions, vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_no_geometry_is_empty_not_error() {
        let kernel = ScriptedKernel(Triangulation::default());
        let result = extract(&kernel, &any_shape(), 0.1, true).unwrap();
        assert!(result.mesh.is_empty());
        assert!(result.edges.is_empty());
        assert!(result.mesh.bounding_box().is_none());
    }

    #[test]
    fn test_box_extraction() {
        let kernel = TruckKernel::new();
        let shape = kernel.make_box(DVec3::splat(10.0), true).unwrap();
        let result = extract(&kernel, &shape, 0.1, true).unwrap();
        assert!(result.mesh.vertex_count() >= 8);
        assert!(result.mesh.triangle_count() >= 12);
        assert_eq!(result.edges.segment_count(), 12);
        let (min, max) = result.mesh.bounding_box().unwrap();
        assert_eq!(min, [-5.0; 3]);
        assert_eq!(max, [5.0; 3]);
    }

    #[test]
    fn test_append_offsets_indices() {
        let mut a = MeshBuffers {
            vertices: vec![0.0; 9],
            normals: vec![0.0; 9],
            indices: vec![0, 1, 2],
        };
        let b = a.clone();
        a.append(&b);
        assert_eq!(a.indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(a.triangles().count(), 2);
    }
}
