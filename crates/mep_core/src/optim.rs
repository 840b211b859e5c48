//! The optimization harness (§4.8): a small `Optimizable` contract plus two
//! selectable drivers — an ODE12r-style adaptive-step integrator and a
//! fixed-step "static" descent — used by `PreconMep::run`.

use nalgebra::DVector;
use tracing::{debug, trace};

use crate::config::OdeSettings;
use crate::error::Result;
use crate::logging::{convergence_event, step_span};

/// Anything that can be driven to a force-balance fixed point by repeatedly
/// evaluating a force, stepping the degrees of freedom, and reporting a
/// scalar convergence residual.
pub trait Optimizable {
    fn get_dofs(&self) -> DVector<f64>;
    fn set_dofs(&mut self, x: &DVector<f64>) -> Result<()>;
    fn force(&mut self) -> Result<DVector<f64>>;
    fn residual(&mut self) -> Result<f64>;
    /// Invoked once per accepted step, after `set_dofs`. Default no-op; the
    /// preconditioned String method overrides this to reparameterize.
    fn callback(&mut self, _x: &mut DVector<f64>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OdeOutcome {
    pub converged: bool,
    pub steps: usize,
}

/// Embedded Euler/Heun adaptive-step solver for `x' = f(x)` run to a
/// force-balance fixed point, with step-size control governed by
/// `settings.c1` (shrink factor on rejection) and `settings.c2` (growth
/// factor cap on acceptance).
pub fn ode12r<P: Optimizable>(problem: &mut P, settings: OdeSettings) -> Result<OdeOutcome> {
    let mut x = problem.get_dofs();
    let mut f = problem.force()?;
    let mut h = 1e-2_f64;
    let mut steps = 0usize;

    loop {
        let _span = step_span("ode12r", steps).entered();
        let r = problem.residual()?;
        debug!(step = steps, residual = r, h, "ode12r iteration");
        convergence_event(r, settings.fmax);
        if r <= settings.fmax {
            return Ok(OdeOutcome { converged: true, steps });
        }
        if steps >= settings.max_steps {
            return Ok(OdeOutcome { converged: false, steps });
        }

        let x_trial = &x + &f * h;
        problem.set_dofs(&x_trial)?;
        let f_trial = problem.force()?;
        let err = (&f_trial - &f).iter().fold(0.0_f64, |acc, v| acc.max(v.abs())) * h / 2.0;

        if err <= settings.rtol {
            x = x_trial;
            f = f_trial;
            problem.set_dofs(&x)?;
            problem.callback(&mut x)?;
            problem.set_dofs(&x)?;
            steps += 1;
            let growth = (settings.c2 * (settings.rtol / err.max(1e-12)).sqrt()).clamp(1.0, 2.0);
            h *= growth;
            trace!(h, "ode12r step accepted");
        } else {
            h *= settings.c1.clamp(0.05, 0.9);
            problem.set_dofs(&x)?;
            trace!(h, "ode12r step rejected");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaticSettings {
    pub fmax: f64,
    pub step_size: f64,
    pub max_steps: usize,
}

/// Fixed-step steepest-descent-style driver: simpler and more predictable
/// than `ode12r`, at the cost of requiring a hand-picked step size.
pub fn static_step<P: Optimizable>(problem: &mut P, settings: StaticSettings) -> Result<OdeOutcome> {
    let mut steps = 0usize;
    loop {
        let _span = step_span("static_step", steps).entered();
        let r = problem.residual()?;
        convergence_event(r, settings.fmax);
        if r <= settings.fmax {
            return Ok(OdeOutcome { converged: true, steps });
        }
        if steps >= settings.max_steps {
            return Ok(OdeOutcome { converged: false, steps });
        }
        let f = problem.force()?;
        let mut x = problem.get_dofs();
        x += f * settings.step_size;
        problem.set_dofs(&x)?;
        problem.callback(&mut x)?;
        problem.set_dofs(&x)?;
        steps += 1;
    }
}

