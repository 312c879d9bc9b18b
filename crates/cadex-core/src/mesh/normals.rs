//! Normal calculation

use glam::Vec3;

/// Unit normal of one triangle, `+Z` when degenerate
pub fn calculate_triangle_normal(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> [f32; 3] {
    let (a, b, c) = (Vec3::from(a), Vec3::from(b), Vec3::from(c));
    (b - a).cross(c - a).try_normalize().unwrap_or(Vec3::Z).to_array()
}

/// Area-weighted vertex normals for a triangle list
///
/// Unnormalized cross products are accumulated so larger triangles weigh
/// more. Vertices not used by any triangle get `+Z`.
pub fn calculate_vertex_normals(positions: &[[f32; 3]], triangles: &[[u32; 3]]) -> Vec<[f32; 3]> {
    let mut sums = vec![Vec3::ZERO; positions.len()];
    for tri in triangles {
        let [ia, ib, ic] = tri.map(|i| i as usize);
        let (Some(a), Some(b), Some(c)) = (positions.get(ia), positions.get(ib), positions.get(ic))
        else {
            continue;
        };
        let (a, b, c) = (Vec3::from(*a), Vec3::from(*b), Vec3::from(*c));
        let weighted = (b - a).cross(c - a);
        sums[ia] += weighted;
        sums[ib] += weighted;
        sums[ic] += weighted;
    }
    sums.into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Z).to_array())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_triangle_normal() {
        let n = calculate_triangle_normal([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        assert_eq!(n, [0.0, 0.0, 1.0]);
        let degenerate = calculate_triangle_normal([0.0; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]);
        assert_eq!(degenerate, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_area_weighting() {
        // Large triangle facing +Z and a small one facing +X share vertex 0
        let positions = [
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        let normals = calculate_vertex_normals(&positions, &[[0, 1, 2], [0, 3, 4]]);
        let shared = Vec3::from(normals[0]);
        assert!(shared.z > shared.x * 10.0);
        assert_relative_eq!(shared.length(), 1.0, epsilon = 1e-6);
        assert_eq!(normals[3], [1.0, 0.0, 0.0]);
    }
}
