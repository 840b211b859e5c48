//! `PreconMep`: the preconditioned MEP driver (NEB and String variants).
//! Reparameterizes the path by arc length in the preconditioned metric via a
//! not-a-knot cubic spline, projects raw forces into an effective force
//! along that path, and (String variant) resamples the path to equal
//! preconditioned spacing after every accepted step.

use nalgebra::{DMatrix, DVector, Vector3};
use tracing::info;

use crate::chain::ImageChain;
use crate::config::{PreconMethod, PreconSettings};
use crate::configuration::Configuration;
use crate::error::{MepError, Result};
use crate::geometry::{flatten, norm_field, sub_field, unflatten};
use crate::optim::{ode12r, static_step, Optimizable, OdeOutcome};
use crate::precon::{Exp, Identity, Preconditioner};
use crate::projector::row_max_norm;
use crate::spline::CubicSpline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplineNorm {
    Precon,
    Euclidean,
}

pub enum OptimStrategy {
    Ode(crate::config::OdeSettings),
    Static(crate::optim::StaticSettings),
}

/// A caller-supplied spring-constant adaptation policy: given the current
/// spring constants and the full image chain, update the constants in
/// place. Invoked once per accepted optimizer step (see
/// `Optimizable::callback`), not from `get_forces`.
pub type AdaptSpringConstants = dyn FnMut(&mut Vec<f64>, &[Configuration]) + Send;

pub struct PreconMep {
    chain: ImageChain,
    settings: PreconSettings,
    k: Vec<f64>,
    precon: Vec<Box<dyn Preconditioner>>,
    residuals: Vec<f64>,
    fmax_history: Vec<f64>,
    adapt_spring_constants: Option<Box<AdaptSpringConstants>>,
}

impl PreconMep {
    pub fn new(chain: ImageChain, settings: PreconSettings, k: Vec<f64>) -> Result<Self> {
        let m = chain.n_images();
        if settings.method == PreconMethod::Neb && k.len() != m - 1 {
            return Err(MepError::ShapeMismatch(format!(
                "expected {} spring constants for the Neb variant, got {}",
                m - 1,
                k.len()
            )));
        }
        let r_nn = estimate_nearest_neighbor_distance(&chain);
        let precon: Vec<Box<dyn Preconditioner>> = (0..m)
            .map(|_| -> Result<Box<dyn Preconditioner>> {
                match settings.precon_name.as_str() {
                    "Exp" => Ok(Box::new(Exp::default_for(r_nn, false))),
                    "Identity" => Ok(Box::new(Identity)),
                    other => Err(MepError::ConfigError(format!("unknown preconditioner '{other}'"))),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PreconMep {
            chain,
            settings,
            k,
            precon,
            residuals: vec![0.0; m - 2],
            fmax_history: Vec::new(),
            adapt_spring_constants: None,
        })
    }

    /// Installs a custom spring-constant adaptation policy, overriding the
    /// built-in linear-by-energy heuristic. Only consulted when the `Neb`
    /// variant's `adapt_springs` setting is enabled.
    pub fn set_adapt_spring_constants(&mut self, f: impl FnMut(&mut Vec<f64>, &[Configuration]) + Send + 'static) {
        self.adapt_spring_constants = Some(Box::new(f));
    }

    pub fn chain(&self) -> &ImageChain {
        &self.chain
    }

    pub fn fmax_history(&self) -> &[f64] {
        &self.fmax_history
    }

    /// Fits a not-a-knot cubic spline through all `M` images' flattened
    /// positions, parameterized by cumulative arc length (under `norm`)
    /// normalized to `[0, 1]`.
    pub fn spline_fit(&mut self, norm: SplineNorm) -> Result<(Vec<f64>, CubicSpline)> {
        let m = self.chain.n_images();
        for (image, precon) in self.chain.images().iter().zip(self.precon.iter_mut()) {
            precon.make_precon(image)?;
        }

        let images = self.chain.images();
        let mut segment_lengths = vec![0.0; m - 1];
        for i in 0..m - 1 {
            let diff = sub_field(&images[i + 1].positions, &images[i].positions);
            segment_lengths[i] = match norm {
                SplineNorm::Euclidean => norm_field(&diff),
                SplineNorm::Precon => self.precon[i].norm(&diff),
            };
        }
        let total: f64 = segment_lengths.iter().sum();
        if total <= 0.0 {
            return Err(MepError::NumericError(
                "degenerate path: zero total arc length".into(),
            ));
        }

        let mut s = vec![0.0; m];
        let mut cum = 0.0;
        for i in 0..m - 1 {
            cum += segment_lengths[i];
            s[i + 1] = cum / total;
        }

        let n_dofs = 3 * self.chain.n_atoms();
        let mut y = DMatrix::zeros(m, n_dofs);
        for (i, image) in images.iter().enumerate() {
            let flat = flatten(&image.positions);
            y.row_mut(i).copy_from(&flat.transpose());
        }

        let spline = CubicSpline::fit(&s, &y)?;
        Ok((s, spline))
    }

    /// Computes the effective (preconditioned, tangent-projected) force at
    /// every interior image.
    pub fn get_forces(&mut self) -> Result<Vec<Vec<Vector3<f64>>>> {
        let m = self.chain.n_images();

        let mut raw_forces: Vec<Vec<Vector3<f64>>> = Vec::with_capacity(m);
        for image in self.chain.images() {
            raw_forces.push(image.get_forces()?);
        }
        let (s, spline) = self.spline_fit(SplineNorm::Precon)?;

        let mut effective = Vec::with_capacity(m - 2);
        let mut residuals = Vec::with_capacity(m - 2);

        for i in 1..m - 1 {
            let t_flat = spline.eval_d1(s[i]);
            let t_field = unflatten(&t_flat);
            let precon = &self.precon[i];
            let t_norm = precon.norm(&t_field);
            let t_unit: Vec<Vector3<f64>> = if t_norm > 0.0 {
                t_field.iter().map(|v| v / t_norm).collect()
            } else {
                t_field.clone()
            };

            let (mut pf, _info) = precon.apply(&raw_forces[i], &self.chain.images()[i])?;
            let parallel = precon.dot(&t_unit, &pf);
            for (p, t) in pf.iter_mut().zip(t_unit.iter()) {
                *p -= t * parallel;
            }

            if self.settings.method == PreconMethod::Neb {
                let k_bar = 0.5 * (self.k[i - 1] + self.k[i]);
                let d2_flat = spline.eval_d2(s[i]);
                let d2_field = unflatten(&d2_flat);
                let curvature = precon.dot(&d2_field, &t_unit);
                let eta = k_bar * curvature / (m as f64).powi(2);
                for (p, t) in pf.iter_mut().zip(t_unit.iter()) {
                    *p += t * eta;
                }
            }

            let residual = row_max_norm(&precon.pdot(&pf));
            residuals.push(residual);
            effective.push(pf);
        }

        self.residuals = residuals;
        let max_residual = self.residuals.iter().cloned().fold(0.0, f64::max);
        info!(max_residual, "precon_mep forces computed");
        Ok(effective)
    }

    /// Default adaptive-springs heuristic: stiffer springs near the energy
    /// maximum, softer near the minimum, linearly interpolated by local
    /// image-pair energy between `k_min` and `k_max`.
    fn default_adaptive_springs(k: &mut Vec<f64>, images: &[Configuration], settings: &PreconSettings) -> Result<()> {
        let mut energies = Vec::with_capacity(images.len());
        for image in images {
            energies.push(image.get_potential_energy(false)?);
        }
        let emax = energies.iter().cloned().fold(f64::MIN, f64::max);
        let emin = energies.iter().cloned().fold(f64::MAX, f64::min);
        let spread = (emax - emin).max(1e-12);
        for (idx, ki) in k.iter_mut().enumerate() {
            let e_local = 0.5 * (energies[idx] + energies[idx + 1]);
            let t = (emax - e_local) / spread;
            *ki = settings.k_min + (settings.k_max - settings.k_min) * (1.0 - t).clamp(0.0, 1.0);
        }
        Ok(())
    }

    /// Virtual-work energy integration: fits a cubic spline to the raw
    /// forces along the Euclidean-arc-length path and integrates
    /// `dE/ds = -F(s) . dx/ds(s)` by cumulative trapezoid, anchored at the
    /// first image's directly computed energy.
    pub fn integrate_forces(&mut self, n_points: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        if n_points < 2 {
            return Err(MepError::ConfigError(
                "integrate_forces needs at least 2 sample points".into(),
            ));
        }
        let m = self.chain.n_images();
        let n_dofs = 3 * self.chain.n_atoms();
        let mut forces_y = DMatrix::zeros(m, n_dofs);
        for (i, image) in self.chain.images().iter().enumerate() {
            let f = image.get_forces()?;
            forces_y.row_mut(i).copy_from(&flatten(&f).transpose());
        }

        let (s, pos_spline) = self.spline_fit(SplineNorm::Euclidean)?;
        let force_spline = CubicSpline::fit(&s, &forces_y)?;
        let e0 = self.chain.images()[0].get_potential_energy(false)?;

        let mut s_grid = Vec::with_capacity(n_points);
        let mut integrand = Vec::with_capacity(n_points);
        for k in 0..n_points {
            let si = k as f64 / (n_points - 1) as f64;
            let dx = pos_spline.eval_d1(si);
            let f = force_spline.eval(si);
            let dot: f64 = dx.iter().zip(f.iter()).map(|(a, b)| a * b).sum();
            s_grid.push(si);
            integrand.push(-dot);
        }

        let mut energies = vec![0.0; n_points];
        energies[0] = e0;
        for k in 1..n_points {
            let ds = s_grid[k] - s_grid[k - 1];
            energies[k] = energies[k - 1] + 0.5 * (integrand[k] + integrand[k - 1]) * ds;
        }
        Ok((s_grid, energies))
    }

    pub fn run(&mut self, strategy: OptimStrategy) -> Result<OdeOutcome> {
        match strategy {
            OptimStrategy::Ode(settings) => ode12r(self, settings),
            OptimStrategy::Static(settings) => static_step(self, settings),
        }
    }
}

fn estimate_nearest_neighbor_distance(chain: &ImageChain) -> f64 {
    let image = &chain.images()[0];
    let n = image.n_atoms();
    if n < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let mut nearest = f64::MAX;
        for j in 0..n {
            if i == j {
                continue;
            }
            let d = (image.positions[j] - image.positions[i]).norm();
            if d < nearest {
                nearest = d;
            }
        }
        total += nearest;
    }
    (total / n as f64).max(1e-6)
}

impl Optimizable for PreconMep {
    fn get_dofs(&self) -> DVector<f64> {
        self.chain.get_dofs()
    }

    fn set_dofs(&mut self, x: &DVector<f64>) -> Result<()> {
        self.chain.set_dofs(x);
        Ok(())
    }

    fn force(&mut self) -> Result<DVector<f64>> {
        let forces = self.get_forces()?;
        let mut flat = Vec::with_capacity(forces.iter().map(|f| f.len() * 3).sum());
        for f in &forces {
            flat.extend(flatten(f).iter().cloned());
        }
        Ok(DVector::from_vec(flat))
    }

    fn residual(&mut self) -> Result<f64> {
        Ok(self.residuals.iter().cloned().fold(0.0, f64::max))
    }

    fn callback(&mut self, x: &mut DVector<f64>) -> Result<()> {
        if self.settings.method == PreconMethod::String {
            self.chain.set_dofs(x);
            let (_s, spline) = self.spline_fit(SplineNorm::Precon)?;
            let m = self.chain.n_images();
            let n_atoms = self.chain.n_atoms();
            let mut resampled = Vec::with_capacity(m);
            for idx in 0..m {
                let target = idx as f64 / (m - 1) as f64;
                resampled.push(spline.eval(target));
            }
            for (idx, image) in self.chain.interior_mut().iter_mut().enumerate() {
                let flat = &resampled[idx + 1];
                for a in 0..n_atoms {
                    image.positions[a] = Vector3::new(flat[3 * a], flat[3 * a + 1], flat[3 * a + 2]);
                }
            }
            *x = self.chain.get_dofs();
        }

        if self.settings.method == PreconMethod::Neb && self.settings.adapt_springs {
            match self.adapt_spring_constants.take() {
                Some(mut custom) => {
                    custom(&mut self.k, self.chain.images());
                    self.adapt_spring_constants = Some(custom);
                }
                None => {
                    Self::default_adaptive_springs(&mut self.k, self.chain.images(), &self.settings)?;
                }
            }
        }

        self.fmax_history.push(self.residuals.iter().cloned().fold(0.0, f64::max));
        Ok(())
    }
}
