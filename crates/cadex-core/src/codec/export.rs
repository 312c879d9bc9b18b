//! STEP/STL/OBJ export to in-memory buffers

use std::io::Write;

use cadex_kernel::{CadKernel, Shape};
use tracing::{debug, info};

use super::{CodecError, ExportFormat};
use crate::mesh::{MeshBuffers, calculate_triangle_normal, extract_mesh};
use crate::protocol::ExportRequest;

/// Resolved export options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportSettings {
    /// Chordal deviation for STL/OBJ tessellation
    pub deviation: f64,
    pub binary_stl: bool,
    pub include_normals: bool,
}

impl ExportSettings {
    /// Resolve request options against the configured export deviation
    ///
    /// `quality` in (0, 1] divides the deviation; 1.0 keeps it unchanged.
    pub fn from_request(request: &ExportRequest, export_deviation: f64) -> Result<Self, CodecError> {
        let quality = request.quality.unwrap_or(1.0);
        if !(quality > 0.0 && quality <= 1.0) {
            return Err(CodecError::InvalidQuality(quality));
        }
        Ok(Self {
            deviation: export_deviation / quality,
            binary_stl: request.binary_stl.unwrap_or(true),
            include_normals: request.include_normals.unwrap_or(false),
        })
    }
}

/// Encoded file contents
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutput {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Encode scene shapes in the requested format
pub fn export_shapes(
    kernel: &dyn CadKernel,
    shapes: &[Shape],
    format: ExportFormat,
    file_name: &str,
    settings: &ExportSettings,
) -> Result<ExportOutput, CodecError> {
    if shapes.is_empty() {
        return Err(CodecError::NoShapes);
    }
    let file_name = format.file_name(file_name);
    debug!(
        "Exporting {} shapes as {} (deviation {})",
        shapes.len(),
        format.name(),
        settings.deviation
    );

    let data = match format {
        ExportFormat::Step => write_step(kernel, &combined(kernel, shapes)?)?,
        ExportFormat::Stl => {
            let mesh = extract_mesh(kernel, &combined(kernel, shapes)?, settings.deviation)?;
            if mesh.is_empty() {
                return Err(CodecError::Export("shapes produced no triangles".into()));
            }
            let solid_name = file_name.trim_end_matches(".stl");
            if settings.binary_stl {
                write_binary_stl(&mesh)?
            } else {
                write_ascii_stl(&mesh, solid_name)?
            }
        }
        ExportFormat::Obj => {
            let meshes = shapes
                .iter()
                .map(|shape| extract_mesh(kernel, shape, settings.deviation))
                .collect::<Result<Vec<_>, _>>()?;
            write_obj(&meshes, settings.include_normals)?
        }
    };

    info!("Exported {} ({} bytes)", file_name, data.len());
    Ok(ExportOutput { file_name, data })
}

fn combined(kernel: &dyn CadKernel, shapes: &[Shape]) -> Result<Shape, CodecError> {
    match shapes {
        [single] => Ok(single.clone()),
        _ => Ok(kernel.make_compound(shapes)?),
    }
}

fn write_step(kernel: &dyn CadKernel, shape: &Shape) -> Result<Vec<u8>, CodecError> {
    let scratch = tempfile::Builder::new()
        .prefix("cadex-export-")
        .suffix(".step")
        .tempfile()
        .map_err(|e| CodecError::Io(e.to_string()))?;
    kernel.write_step(shape, scratch.path())?;
    let data = std::fs::read(scratch.path()).map_err(|e| CodecError::Io(e.to_string()))?;
    if data.is_empty() {
        return Err(CodecError::Export("STEP writer produced an empty file".into()));
    }
    Ok(data)
}

fn facet_corners(mesh: &MeshBuffers, tri: [u32; 3]) -> ([f32; 3], [[f32; 3]; 3]) {
    let corners = tri.map(|i| mesh.position(i as usize));
    let normal = calculate_triangle_normal(corners[0], corners[1], corners[2]);
    (normal, corners)
}

fn write_binary_stl(mesh: &MeshBuffers) -> Result<Vec<u8>, CodecError> {
    let triangles: Vec<stl_io::Triangle> = mesh
        .triangles()
        .map(|tri| {
            let (normal, [v0, v1, v2]) = facet_corners(mesh, tri);
            stl_io::Triangle {
                normal: stl_io::Normal::new(normal),
                vertices: [
                    stl_io::Vertex::new(v0),
                    stl_io::Vertex::new(v1),
                    stl_io::Vertex::new(v2),
                ],
            }
        })
        .collect();

    let mut data = Vec::with_capacity(84 + triangles.len() * 50);
    stl_io::write_stl(&mut data, triangles.iter()).map_err(|e| CodecError::Export(e.to_string()))?;
    Ok(data)
}

fn write_ascii_stl(mesh: &MeshBuffers, solid_name: &str) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let io = |e: std::io::Error| CodecError::Io(e.to_string());

    writeln!(out, "solid {}", solid_name).map_err(io)?;
    for tri in mesh.triangles() {
        let (n, corners) = facet_corners(mesh, tri);
        writeln!(out, "  facet normal {:e} {:e} {:e}", n[0], n[1], n[2]).map_err(io)?;
        writeln!(out, "    outer loop").map_err(io)?;
        for v in corners {
            writeln!(out, "      vertex {:e} {:e} {:e}", v[0], v[1], v[2]).map_err(io)?;
        }
        writeln!(out, "    endloop").map_err(io)?;
        writeln!(out, "  endfacet").map_err(io)?;
    }
    writeln!(out, "endsolid {}", solid_name).map_err(io)?;
    Ok(out)
}

/// One `o` group per shape; indices are 1-based and shared across groups
fn write_obj(meshes: &[MeshBuffers], include_normals: bool) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let io = |e: std::io::Error| CodecError::Io(e.to_string());

    writeln!(out, "# cadex OBJ export").map_err(io)?;
    let mut vertex_offset = 1u32;
    for (index, mesh) in meshes.iter().enumerate() {
        writeln!(out, "o shape_{}", index + 1).map_err(io)?;
        for v in mesh.vertices.chunks_exact(3) {
            writeln!(out, "v {} {} {}", v[0], v[1], v[2]).map_err(io)?;
        }
        if include_normals {
            for n in mesh.normals.chunks_exact(3) {
                writeln!(out, "vn {} {} {}", n[0], n[1], n[2]).map_err(io)?;
            }
        }
        for tri in mesh.triangles() {
            let [a, b, c] = tri.map(|i| i + vertex_offset);
            if include_normals {
                writeln!(out, "f {a}//{a} {b}//{b} {c}//{c}").map_err(io)?;
            } else {
                writeln!(out, "f {a} {b} {c}").map_err(io)?;
            }
        }
        vertex_offset += mesh.vertex_count() as u32;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ImportFormat, import_bytes};
    use approx::assert_relative_eq;
    use cadex_kernel::{Transform, TruckKernel};
    use glam::DVec3;
    use std::io::Cursor;

    fn settings() -> ExportSettings {
        ExportSettings {
            deviation: 0.05,
            binary_stl: true,
            include_normals: false,
        }
    }

    fn two_boxes(kernel: &TruckKernel) -> Vec<Shape> {
        let a = kernel.make_box(DVec3::splat(2.0), false).unwrap();
        let b = kernel
            .transform(
                &kernel.make_box(DVec3::ONE, false).unwrap(),
                &Transform::Translate(DVec3::new(5.0, 0.0, 0.0)),
            )
            .unwrap();
        vec![a, b]
    }

    #[test]
    fn test_quality_maps_to_deviation() {
        let mut request = ExportRequest::new(ExportFormat::Stl, "part");
        request.quality = Some(0.5);
        let settings = ExportSettings::from_request(&request, 0.01).unwrap();
        assert_relative_eq!(settings.deviation, 0.02);
        assert!(settings.binary_stl);

        for bad in [0.0, -1.0, 1.5, f64::NAN] {
            request.quality = Some(bad);
            assert!(matches!(
                ExportSettings::from_request(&request, 0.01),
                Err(CodecError::InvalidQuality(_))
            ));
        }
    }

    #[test]
    fn test_no_shapes() {
        let kernel = TruckKernel::new();
        let err = export_shapes(&kernel, &[], ExportFormat::Stl, "x", &settings()).unwrap_err();
        assert_eq!(err.to_string(), "no shapes to export");
    }

    #[test]
    fn test_binary_stl_reparses() {
        let kernel = TruckKernel::new();
        let shapes = two_boxes(&kernel);
        let output = export_shapes(&kernel, &shapes, ExportFormat::Stl, "parts.obj", &settings()).unwrap();
        assert_eq!(output.file_name, "parts.stl");

        let mesh = stl_io::read_stl(&mut Cursor::new(&output.data)).unwrap();
        assert!(mesh.faces.len() >= 24);
        let max_x = mesh.vertices.iter().map(|v| v[0]).fold(f32::MIN, f32::max);
        assert_relative_eq!(max_x, 6.0, epsilon = 1e-5);
    }

    #[test]
    fn test_ascii_stl_reparses() {
        let kernel = TruckKernel::new();
        let shapes = vec![kernel.make_box(DVec3::ONE, true).unwrap()];
        let ascii = ExportSettings {
            binary_stl: false,
            ..settings()
        };
        let output = export_shapes(&kernel, &shapes, ExportFormat::Stl, "cube", &ascii).unwrap();
        let text = String::from_utf8(output.data.clone()).unwrap();
        assert!(text.starts_with("solid cube\n"));
        assert!(text.trim_end().ends_with("endsolid cube"));

        let mesh = stl_io::read_stl(&mut Cursor::new(&output.data)).unwrap();
        assert!(mesh.faces.len() >= 12);
        for v in &mesh.vertices {
            for axis in 0..3 {
                assert!(v[axis].abs() <= 0.5 + 1e-6);
            }
        }
    }

    #[test]
    fn test_obj_groups_and_offsets() {
        let kernel = TruckKernel::new();
        let shapes = two_boxes(&kernel);
        let with_normals = ExportSettings {
            include_normals: true,
            ..settings()
        };
        let output = export_shapes(&kernel, &shapes, ExportFormat::Obj, "parts", &with_normals).unwrap();
        assert_eq!(output.file_name, "parts.obj");

        let text = String::from_utf8(output.data.clone()).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("o ")).count(), 2);
        assert!(text.lines().filter(|l| l.starts_with("f ")).all(|l| l.contains("//")));

        let (models, _materials) = tobj::load_obj_buf(
            &mut Cursor::new(&output.data),
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
            |_| Ok(Default::default()),
        )
        .unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "shape_1");
        for model in &models {
            assert!(model.mesh.indices.len() >= 36);
            assert_eq!(model.mesh.normals.len(), model.mesh.positions.len());
        }
        let xs: Vec<f32> = models[1].mesh.positions.iter().step_by(3).copied().collect();
        assert!(xs.iter().all(|&x| x >= 5.0 - 1e-6));
    }

    #[test]
    fn test_obj_without_normals() {
        let kernel = TruckKernel::new();
        let shapes = vec![kernel.make_box(DVec3::ONE, false).unwrap()];
        let output = export_shapes(&kernel, &shapes, ExportFormat::Obj, "a", &settings()).unwrap();
        let text = String::from_utf8(output.data).unwrap();
        assert!(!text.contains("vn "));
        assert!(text.lines().any(|l| l.starts_with("f ")));
    }

    #[test]
    fn test_step_round_trip() {
        let kernel = TruckKernel::new();
        let shape = kernel.make_box(DVec3::new(4.0, 2.0, 1.0), true).unwrap();
        let output = export_shapes(
            &kernel,
            std::slice::from_ref(&shape),
            ExportFormat::Step,
            "block",
            &settings(),
        )
        .unwrap();
        assert_eq!(output.file_name, "block.step");
        assert!(output.data.starts_with(b"ISO-10303-21;"));

        let imported = import_bytes(&kernel, ImportFormat::Step, &output.data).unwrap();
        let before = extract_mesh(&kernel, &shape, 0.05).unwrap();
        let after = extract_mesh(&kernel, &imported, 0.05).unwrap();
        assert!(!after.is_empty());

        let (min_a, max_a) = before.bounding_box().unwrap();
        let (min_b, max_b) = after.bounding_box().unwrap();
        for axis in 0..3 {
            assert_relative_eq!(min_a[axis], min_b[axis], epsilon = 1e-5);
            assert_relative_eq!(max_a[axis], max_b[axis], epsilon = 1e-5);
        }
    }
}
