//! Not-a-knot cubic spline fit over vector-valued samples `(s_i, y_i)` with
//! `y_i` in `R^d`, plus first/second derivative evaluation. Every dimension
//! shares one arc-length parameterization and one tridiagonal-like system,
//! solved once for all columns via `nalgebra`'s LU — the same
//! bordered-linear-system idiom the teacher uses for its continuation
//! tangent solves (`continuation/util.rs`).

use nalgebra::{DMatrix, DVector};

use crate::error::{MepError, Result};

pub struct CubicSpline {
    s: Vec<f64>,
    y: DMatrix<f64>, // M x D
    m: DMatrix<f64>, // M x D, second derivatives at knots
}

impl CubicSpline {
    /// `s` must be strictly increasing with at least 3 knots. `y` is `M x D`
    /// (one row per knot).
    pub fn fit(s: &[f64], y: &DMatrix<f64>) -> Result<Self> {
        let n = s.len();
        if n < 3 {
            return Err(MepError::NumericError(
                "cubic spline fit needs at least 3 knots".into(),
            ));
        }
        if y.nrows() != n {
            return Err(MepError::ShapeMismatch(format!(
                "spline knot count {n} does not match sample row count {}",
                y.nrows()
            )));
        }
        for w in s.windows(2) {
            if w[1] <= w[0] {
                return Err(MepError::NumericError(
                    "spline knots must be strictly increasing".into(),
                ));
            }
        }

        let h: Vec<f64> = s.windows(2).map(|w| w[1] - w[0]).collect();
        let d = y.ncols();
        let mut a = DMatrix::<f64>::zeros(n, n);
        let mut b = DMatrix::<f64>::zeros(n, d);

        // not-a-knot boundary condition at the left end.
        a[(0, 0)] = h[1];
        a[(0, 1)] = -(h[0] + h[1]);
        a[(0, 2)] = h[0];

        for i in 1..n - 1 {
            a[(i, i - 1)] = h[i - 1];
            a[(i, i)] = 2.0 * (h[i - 1] + h[i]);
            a[(i, i + 1)] = h[i];
            for col in 0..d {
                b[(i, col)] = 6.0
                    * ((y[(i + 1, col)] - y[(i, col)]) / h[i] - (y[(i, col)] - y[(i - 1, col)]) / h[i - 1]);
            }
        }

        // not-a-knot boundary condition at the right end.
        a[(n - 1, n - 3)] = h[n - 2];
        a[(n - 1, n - 2)] = -(h[n - 3] + h[n - 2]);
        a[(n - 1, n - 1)] = h[n - 3];

        let lu = a.lu();
        let m = lu
            .solve(&b)
            .ok_or_else(|| MepError::NumericError("spline system is singular".into()))?;

        Ok(CubicSpline {
            s: s.to_vec(),
            y: y.clone(),
            m,
        })
    }

    fn segment(&self, s: f64) -> usize {
        let n = self.s.len();
        if s <= self.s[0] {
            return 0;
        }
        if s >= self.s[n - 1] {
            return n - 2;
        }
        match self.s.binary_search_by(|probe| probe.partial_cmp(&s).unwrap()) {
            Ok(idx) => idx.min(n - 2),
            Err(idx) => idx - 1,
        }
    }

    pub fn eval(&self, s: f64) -> DVector<f64> {
        let i = self.segment(s);
        let h = self.s[i + 1] - self.s[i];
        let a = self.s[i + 1] - s;
        let bb = s - self.s[i];
        let d = self.y.ncols();
        let mut out = DVector::zeros(d);
        for col in 0..d {
            let mi = self.m[(i, col)];
            let mi1 = self.m[(i + 1, col)];
            let yi = self.y[(i, col)];
            let yi1 = self.y[(i + 1, col)];
            out[col] = (a.powi(3) * mi + bb.powi(3) * mi1) / (6.0 * h)
                + (a / h) * (yi - mi * h * h / 6.0)
                + (bb / h) * (yi1 - mi1 * h * h / 6.0);
        }
        out
    }

    pub fn eval_d1(&self, s: f64) -> DVector<f64> {
        let i = self.segment(s);
        let h = self.s[i + 1] - self.s[i];
        let a = self.s[i + 1] - s;
        let bb = s - self.s[i];
        let d = self.y.ncols();
        let mut out = DVector::zeros(d);
        for col in 0..d {
            let mi = self.m[(i, col)];
            let mi1 = self.m[(i + 1, col)];
            let yi = self.y[(i, col)];
            let yi1 = self.y[(i + 1, col)];
            out[col] = (-3.0 * a.powi(2) * mi + 3.0 * bb.powi(2) * mi1) / (6.0 * h)
                - (yi - mi * h * h / 6.0) / h
                + (yi1 - mi1 * h * h / 6.0) / h;
        }
        out
    }

    pub fn eval_d2(&self, s: f64) -> DVector<f64> {
        let i = self.segment(s);
        let h = self.s[i + 1] - self.s[i];
        let a = self.s[i + 1] - s;
        let bb = s - self.s[i];
        let d = self.y.ncols();
        let mut out = DVector::zeros(d);
        for col in 0..d {
            out[col] = (a * self.m[(i, col)] + bb * self.m[(i + 1, col)]) / h;
        }
        out
    }
}
