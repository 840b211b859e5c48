//! The force projector: turns a raw calculator force into the effective NEB
//! force at one interior image — removing (or, for the climbing image,
//! inverting) the component parallel to the tangent and adding the spring
//! force, per [`crate::tangent::Method`]. Also houses the dynamic-relaxation
//! freeze test.

use nalgebra::Vector3;

use crate::geometry::{dot_field, norm_field, scale_field, sub_field};
use crate::tangent::Method;

#[allow(clippy::too_many_arguments)]
pub fn effective_force(
    method: Method,
    climb: bool,
    is_imax: bool,
    tangent: &[Vector3<f64>],
    raw_force: &[Vector3<f64>],
    t1: &[Vector3<f64>],
    nt1: f64,
    t2: &[Vector3<f64>],
    nt2: f64,
    k_prev: f64,
    k_next: f64,
    eq_length: f64,
    is_climb_neighbor: bool,
    delta_v_min: f64,
    delta_v_max: f64,
) -> Vec<Vector3<f64>> {
    let nt = norm_field(tangent);
    let unit_t = if nt > 0.0 {
        scale_field(tangent, 1.0 / nt)
    } else {
        tangent.to_vec()
    };
    let f_parallel = dot_field(raw_force, &unit_t);
    let f_perp = sub_field(raw_force, &scale_field(&unit_t, f_parallel));

    if climb && is_imax {
        // Invert the parallel component instead of removing it: walk uphill
        // along the path, downhill in every perpendicular direction.
        return sub_field(raw_force, &scale_field(&unit_t, 2.0 * f_parallel));
    }

    let f_spring = match method {
        Method::AseNeb | Method::ImprovedTangent => scale_field(&unit_t, k_next * nt2 - k_prev * nt1),
        Method::Eb => {
            // Two separate vector terms, each along its own neighbor
            // direction (not projected onto the combined tangent): pulls
            // this image towards equalizing both bond lengths to eq_length.
            let unit_t1 = if nt1 > 0.0 { scale_field(t1, 1.0 / nt1) } else { t1.to_vec() };
            let unit_t2 = if nt2 > 0.0 { scale_field(t2, 1.0 / nt2) } else { t2.to_vec() };
            let f1 = scale_field(&unit_t1, -(nt1 - eq_length) * k_prev);
            let f2 = scale_field(&unit_t2, (nt2 - eq_length) * k_next);
            let combined: Vec<Vector3<f64>> = f1.iter().zip(f2.iter()).map(|(a, b)| a + b).collect();
            if is_climb_neighbor {
                let quotient = if delta_v_max > 0.0 {
                    delta_v_min / delta_v_max
                } else {
                    0.0
                };
                scale_field(&combined, quotient)
            } else {
                combined
            }
        }
    };

    f_perp.iter().zip(f_spring.iter()).map(|(a, b)| a + b).collect()
}

/// Dynamic relaxation freeze test: an interior image (other than the
/// climbing image) is frozen once its effective-force row-max drops below
/// `fmax * (1 + rel_distance * scale_fmax)`.
pub fn should_freeze(force_row_max: f64, fmax: f64, rel_distance: f64, scale_fmax: f64, is_imax: bool) -> bool {
    !is_imax && force_row_max < fmax * (1.0 + rel_distance * scale_fmax)
}

/// Maximum per-atom force norm in a field (used for the dynamic-relaxation
/// freeze test and as a generic convergence probe).
pub fn row_max_norm(field: &[Vector3<f64>]) -> f64 {
    field.iter().map(|v| v.norm()).fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(vals: &[(f64, f64, f64)]) -> Vec<Vector3<f64>> {
        vals.iter().map(|&(x, y, z)| Vector3::new(x, y, z)).collect()
    }

    #[test]
    fn perpendicular_component_is_removed_along_tangent() {
        let tangent = field(&[(1.0, 0.0, 0.0)]);
        let raw = field(&[(3.0, 4.0, 0.0)]);
        let t1 = field(&[(1.0, 0.0, 0.0)]);
        let t2 = field(&[(1.0, 0.0, 0.0)]);
        let f = effective_force(
            Method::AseNeb,
            false,
            false,
            &tangent,
            &raw,
            &t1,
            1.0,
            &t2,
            1.0,
            0.1,
            0.1,
            0.0,
            false,
            0.0,
            0.0,
        );
        // equal spring constants and equal neighbor distances -> zero spring
        // term, so only the perpendicular component of the raw force
        // survives.
        assert!((f[0].x).abs() < 1e-12);
        assert!((f[0].y - 4.0).abs() < 1e-12);
    }

    #[test]
    fn climbing_image_inverts_parallel_component() {
        let tangent = field(&[(1.0, 0.0, 0.0)]);
        let raw = field(&[(3.0, 4.0, 0.0)]);
        let f = effective_force(
            Method::AseNeb,
            true,
            true,
            &tangent,
            &raw,
            &tangent,
            1.0,
            &tangent,
            1.0,
            0.1,
            0.1,
            0.0,
            false,
            0.0,
            0.0,
        );
        assert!((f[0].x + 3.0).abs() < 1e-12);
        assert!((f[0].y - 4.0).abs() < 1e-12);
    }

    #[test]
    fn eb_neighbor_scaling_guards_zero_delta_v_max() {
        let tangent = field(&[(1.0, 0.0, 0.0)]);
        let raw = field(&[(0.0, 0.0, 0.0)]);
        let t1 = field(&[(1.0, 0.0, 0.0)]);
        let t2 = field(&[(1.0, 0.0, 0.0)]);
        // Should not panic or produce NaN/inf when delta_v_max == 0.
        let f = effective_force(
            Method::Eb, false, false, &tangent, &raw, &t1, 1.0, &t2, 1.0, 0.1, 0.1, 1.0, true, 0.0, 0.0,
        );
        assert!(f[0].x.is_finite());
    }
}
