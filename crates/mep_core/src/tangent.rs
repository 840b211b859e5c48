//! The tangent engine: computes the local path tangent at an interior image
//! from the two neighbor-displacement fields `t1 = mic(p_i - p_{i-1})` and
//! `t2 = mic(p_{i+1} - p_i)`, dispatched on [`Method`].

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::{add_field, norm_field, scale_field};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    AseNeb,
    ImprovedTangent,
    Eb,
}

/// Energies of the image and its two neighbors, `(e_prev, e_here, e_next)`,
/// required by `improvedtangent` and `eb`.
pub type NeighborEnergies = (f64, f64, f64);

/// Compute the tangent at image `i` (interior index, `1 <= i <= n_images - 2`)
/// given the two already mic-corrected neighbor displacement fields and
/// their norms. For `aseneb` the result is intentionally left unnormalized
/// (matching the reference algorithm); the other methods return a
/// unit-length tangent.
pub fn compute_tangent(
    method: Method,
    t1: &[Vector3<f64>],
    nt1: f64,
    t2: &[Vector3<f64>],
    nt2: f64,
    i: usize,
    imax: usize,
    energies: Option<NeighborEnergies>,
) -> Vec<Vector3<f64>> {
    match method {
        Method::AseNeb => {
            if i < imax {
                t2.to_vec()
            } else if i > imax {
                t1.to_vec()
            } else {
                add_field(t1, t2)
            }
        }
        Method::ImprovedTangent => {
            let (e_prev, e_here, e_next) = energies.expect("improvedtangent needs neighbor energies");
            let raw = if e_next > e_here && e_here > e_prev {
                t2.to_vec()
            } else if e_next < e_here && e_here < e_prev {
                t1.to_vec()
            } else if (e_next - e_here).abs() > 1e-300 || (e_here - e_prev).abs() > 1e-300 {
                improved_tangent_raw(t1, t2, e_prev, e_here, e_next)
            } else {
                add_field(t1, t2)
            };
            normalize_or_self(raw)
        }
        Method::Eb => {
            let unit1 = if nt1 > 0.0 { scale_field(t1, 1.0 / nt1) } else { t1.to_vec() };
            let unit2 = if nt2 > 0.0 { scale_field(t2, 1.0 / nt2) } else { t2.to_vec() };
            normalize_or_self(add_field(&unit1, &unit2))
        }
    }
}

fn improved_tangent_raw(
    t1: &[Vector3<f64>],
    t2: &[Vector3<f64>],
    e_prev: f64,
    e_here: f64,
    e_next: f64,
) -> Vec<Vector3<f64>> {
    let (v_min, v_max) = if e_next >= e_prev {
        ((e_here - e_prev).abs(), (e_next - e_here).abs())
    } else {
        ((e_next - e_here).abs(), (e_here - e_prev).abs())
    };
    if e_next > e_prev {
        add_field(&scale_field(t2, v_max.max(v_min)), &scale_field(t1, v_min.min(v_max)))
    } else {
        add_field(&scale_field(t2, v_min.min(v_max)), &scale_field(t1, v_max.max(v_min)))
    }
}

fn normalize_or_self(field: Vec<Vector3<f64>>) -> Vec<Vector3<f64>> {
    let n = norm_field(&field);
    if n > 0.0 {
        scale_field(&field, 1.0 / n)
    } else {
        field
    }
}
