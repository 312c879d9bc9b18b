//! Meshed truck shells to per-face triangulations

use truck_modeling::Point3;
use truck_polymesh::{PolygonMesh, PolylineCurve};
use truck_topology::compress::CompressedShell;

use crate::kernel::{CadError, EdgeSegments, FaceTriangulation, Triangulation};

/// A shell after meshing: polyline edges and, where meshing worked, face meshes
pub(crate) type MeshedShell = CompressedShell<Point3, PolylineCurve<Point3>, Option<PolygonMesh>>;

fn coords(p: Point3) -> [f64; 3] {
    [p.x, p.y, p.z]
}

/// Append one entry per shell face and one edge group for the shell
pub(crate) fn collect(shell: &MeshedShell, out: &mut Triangulation) {
    for (index, face) in shell.faces.iter().enumerate() {
        let face = match &face.surface {
            Some(mesh) => Ok(face_triangulation(mesh, !face.orientation)),
            None => Err(CadError::TessellationFailed(format!(
                "face {index} could not be meshed"
            ))),
        };
        out.faces.push(face);
    }

    let segments = shell
        .edges
        .iter()
        .flat_map(|edge| edge.curve.0.windows(2).map(|w| [coords(w[0]), coords(w[1])]))
        .collect();
    out.edges.push(Ok(EdgeSegments { segments }));
}

/// Triangles keep the surface winding; `reversed` carries the face orientation
fn face_triangulation(mesh: &PolygonMesh, reversed: bool) -> FaceTriangulation {
    let nodes: Vec<[f64; 3]> = mesh.positions().iter().map(|p| coords(*p)).collect();
    let mut normals: Vec<Option<[f64; 3]>> = vec![None; nodes.len()];
    let mut triangles = Vec::new();

    for polygon in mesh.faces().face_iter() {
        for v in polygon {
            let normal = v.nor.and_then(|i| mesh.normals().get(i));
            if let (Some(n), Some(slot)) = (normal, normals.get_mut(v.pos)) {
                *slot = Some([n.x, n.y, n.z]);
            }
        }
        // Quads and larger polygons are fanned
        for i in 1..polygon.len().saturating_sub(1) {
            triangles.push([
                polygon[0].pos as u32,
                polygon[i].pos as u32,
                polygon[i + 1].pos as u32,
            ]);
        }
    }

    FaceTriangulation {
        nodes,
        normals: normals.into_iter().collect(),
        triangles,
        reversed,
    }
}
