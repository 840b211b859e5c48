//! Geometry kernel: minimum-image displacements, vector-field arithmetic over
//! per-atom fields, and rigid (Kabsch) alignment.
//!
//! A "field" here is a `&[Vector3<f64>]` of length `N` (one vector per atom).
//! Dot products and norms are taken over the *flattened* `3N` vector, the
//! same convention the original NEB implementation uses when it treats
//! per-image position/force arrays as flat buffers.

use nalgebra::{DVector, Matrix3, Vector3};

/// Minimum-image displacement of a single vector under a cell and per-axis
/// periodicity. Non-periodic axes pass through unchanged.
///
/// Implemented via the fractional-coordinate rounding trick: convert to the
/// cell's fractional basis, round the periodic components to the nearest
/// integer, and subtract. This is exact for orthogonal and mildly triclinic
/// cells and is the standard, cheap approximation used when no neighbor-list
/// infrastructure is available.
pub fn mic(delta: Vector3<f64>, cell: &Matrix3<f64>, pbc: [bool; 3]) -> Vector3<f64> {
    if !pbc.iter().any(|&p| p) {
        return delta;
    }
    let inv = match cell.try_inverse() {
        Some(inv) => inv,
        None => return delta,
    };
    let mut frac = inv * delta;
    for axis in 0..3 {
        if pbc[axis] {
            frac[axis] -= frac[axis].round();
        }
    }
    cell * frac
}

/// Apply [`mic`] independently to every atom's displacement in a field, and
/// return the field together with the Euclidean norm of the flattened `3N`
/// result.
pub fn mic_field(
    delta: &[Vector3<f64>],
    cell: &Matrix3<f64>,
    pbc: [bool; 3],
) -> (Vec<Vector3<f64>>, f64) {
    let field: Vec<Vector3<f64>> = delta.iter().map(|d| mic(*d, cell, pbc)).collect();
    let norm = norm_field(&field);
    (field, norm)
}

pub fn dot_field(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x.dot(y)).sum()
}

pub fn norm_field(a: &[Vector3<f64>]) -> f64 {
    dot_field(a, a).sqrt()
}

pub fn scale_field(a: &[Vector3<f64>], s: f64) -> Vec<Vector3<f64>> {
    a.iter().map(|v| v * s).collect()
}

pub fn add_field(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}

pub fn sub_field(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}

/// Flatten a per-atom field into a single `3N` vector (row-major: x0 y0 z0
/// x1 y1 z1 ...).
pub fn flatten(a: &[Vector3<f64>]) -> DVector<f64> {
    let mut out = DVector::zeros(a.len() * 3);
    for (i, v) in a.iter().enumerate() {
        out[3 * i] = v.x;
        out[3 * i + 1] = v.y;
        out[3 * i + 2] = v.z;
    }
    out
}

pub fn unflatten(v: &DVector<f64>) -> Vec<Vector3<f64>> {
    debug_assert_eq!(v.len() % 3, 0);
    (0..v.len() / 3)
        .map(|i| Vector3::new(v[3 * i], v[3 * i + 1], v[3 * i + 2]))
        .collect()
}

/// Rigidly rotate and translate `target` onto `reference` via the Kabsch
/// algorithm (minimizes the RMSD between the two point sets), in place.
/// Both slices must have equal, non-zero length.
pub fn align(reference: &[Vector3<f64>], target: &mut [Vector3<f64>]) {
    let n = reference.len();
    if n == 0 || target.len() != n {
        return;
    }
    let inv_n = 1.0 / n as f64;
    let centroid_ref: Vector3<f64> = reference.iter().fold(Vector3::zeros(), |a, b| a + b) * inv_n;
    let centroid_tgt: Vector3<f64> = target.iter().fold(Vector3::zeros(), |a, b| a + b) * inv_n;

    let mut cov = Matrix3::zeros();
    for i in 0..n {
        let r = reference[i] - centroid_ref;
        let t = target[i] - centroid_tgt;
        cov += t * r.transpose();
    }

    let svd = cov.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return,
    };
    let v = v_t.transpose();
    let d = (v * u.transpose()).determinant().signum();
    let correction = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, d);
    let rotation = v * correction * u.transpose();

    for i in 0..n {
        let centered = target[i] - centroid_tgt;
        target[i] = rotation * centered + centroid_ref;
    }
}
