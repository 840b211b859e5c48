//! `Neb`: the standard nudged elastic band driver, wiring together
//! `ImageChain`, the tangent engine, the force projector, and a `World`.

use std::collections::HashSet;

use nalgebra::{DVector, Vector3};

use crate::chain::ImageChain;
use crate::config::NebSettings;
use crate::configuration::Configuration;
use crate::error::{MepError, Result};
use crate::geometry::{align, mic_field, norm_field, sub_field};
use crate::projector::{effective_force, row_max_norm, should_freeze};
use crate::tangent::{compute_tangent, Method};
use crate::world::{check_distributed_divisibility, signal_failure, ParallelMode};

struct StepState {
    energies: Vec<f64>,
    real_forces: Vec<Vec<Vector3<f64>>>,
    imax: usize,
    emax: f64,
    frozen: Vec<bool>,
}

pub struct Neb {
    chain: ImageChain,
    k: Vec<f64>,
    settings: NebSettings,
    mode: ParallelMode,
    state: Option<StepState>,
}

impl Neb {
    pub fn new(
        images: Vec<Configuration>,
        k: impl Into<SpringConstantsArg>,
        mode: ParallelMode,
        settings: NebSettings,
    ) -> Result<Self> {
        let chain = ImageChain::new(images)?;
        let n_springs = chain.n_images() - 1;
        let k = k.into().resolve(n_springs);
        if k.len() != n_springs {
            return Err(MepError::ShapeMismatch(format!(
                "expected {n_springs} spring constants, got {}",
                k.len()
            )));
        }
        if settings.scale_fmax != 0.0 && !settings.dynamic_relaxation {
            return Err(MepError::ConfigError(
                "scale_fmax has no effect without dynamic_relaxation".into(),
            ));
        }
        if settings.dynamic_relaxation && settings.parallel {
            return Err(MepError::ConfigError(
                "dynamic_relaxation is not compatible with parallel evaluation".into(),
            ));
        }

        let mut seen = HashSet::new();
        for image in chain.images() {
            if let Some(id) = image.calculator_identity() {
                if !seen.insert(id) {
                    return Err(MepError::SharedCalculator);
                }
            }
        }

        if let ParallelMode::Distributed(world) = &mode {
            check_distributed_divisibility(chain.n_images() - 2, world.size())?;
        }

        Ok(Neb {
            chain,
            k,
            settings,
            mode,
            state: None,
        })
    }

    pub fn chain(&self) -> &ImageChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut ImageChain {
        &mut self.chain
    }

    pub fn get_dofs(&self) -> DVector<f64> {
        self.chain.get_dofs()
    }

    /// Overwrites interior positions. Under dynamic relaxation, images
    /// frozen by the last `get_forces` call keep their current position
    /// instead of taking the supplied one; this requires forces to have
    /// been evaluated at least once.
    pub fn set_dofs(&mut self, dofs: &DVector<f64>) -> Result<()> {
        if self.settings.dynamic_relaxation {
            let state = self.state.as_ref().ok_or_else(|| {
                MepError::ConfigError(
                    "dynamic_relaxation requires get_forces to have been called at least once before set_dofs".into(),
                )
            })?;
            let n_atoms = self.chain.n_atoms();
            let frozen = state.frozen.clone();
            for (k, image) in self.chain.interior_mut().iter_mut().enumerate() {
                if frozen[k] {
                    continue;
                }
                for a in 0..n_atoms {
                    let base = 3 * (k * n_atoms + a);
                    image.positions[a] = Vector3::new(dofs[base], dofs[base + 1], dofs[base + 2]);
                }
            }
            Ok(())
        } else {
            self.chain.set_dofs(dofs);
            Ok(())
        }
    }

    pub fn get_potential_energy(&self) -> Result<f64> {
        self.state
            .as_ref()
            .map(|s| s.emax)
            .ok_or_else(|| MepError::ConfigError("get_forces has not been called yet".into()))
    }

    /// Computes the effective force at every interior image, returning them
    /// in image order. Mirrors `ase.neb.NEB.get_forces`, with the emax/argmax
    /// and `eb` zero-delta_v guard corrected per the design notes.
    pub fn get_forces(&mut self) -> Result<Vec<Vec<Vector3<f64>>>> {
        let m = self.chain.n_images();
        let n_interior = m - 2;

        if self.settings.remove_rotation_and_translation {
            // Only interior images are aligned: the final endpoint must stay
            // bit-identical across a step, same as the first.
            for i in 1..m - 1 {
                let (left, right) = self.chain.images_mut().split_at_mut(i);
                align(&left[i - 1].positions, &mut right[0].positions);
            }
        }

        let need_endpoints = self.settings.method != Method::AseNeb;
        let mut energies = vec![0.0; m];
        if need_endpoints {
            energies[0] = self.chain.images()[0].get_potential_energy(false)?;
            energies[m - 1] = self.chain.images()[m - 1].get_potential_energy(false)?;
        }

        let (interior_energies, raw_forces) = self.evaluate_interior()?;
        energies[1..m - 1].copy_from_slice(&interior_energies);

        let mut imax = 0usize;
        let mut emax = interior_energies[0];
        for (idx, &e) in interior_energies.iter().enumerate().skip(1) {
            if e > emax {
                emax = e;
                imax = idx;
            }
        }
        let imax_global = imax + 1; // convert to whole-chain index

        let cell = self.chain.images()[0].cell;
        let pbc = self.chain.images()[0].pbc;
        let positions: Vec<Vec<Vector3<f64>>> = self.chain.images().iter().map(|c| c.positions.clone()).collect();

        let eq_length = if self.settings.method == Method::Eb {
            norm_field(&sub_field(&positions[m - 1], &positions[0])) / (m - 1) as f64
        } else {
            0.0
        };

        let (mut t1, mut nt1) = mic_field(&sub_field(&positions[1], &positions[0]), &cell, pbc);
        let mut effective: Vec<Vec<Vector3<f64>>> = Vec::with_capacity(n_interior);
        let mut frozen = vec![false; n_interior];

        for i in 1..=n_interior {
            let (t2, nt2) = mic_field(&sub_field(&positions[i + 1], &positions[i]), &cell, pbc);

            let neighbor_energies = if self.settings.method == Method::ImprovedTangent {
                Some((energies[i - 1], energies[i], energies[i + 1]))
            } else {
                None
            };
            let tangent = compute_tangent(self.settings.method, &t1, nt1, &t2, nt2, i, imax_global, neighbor_energies);

            let is_imax = i == imax_global;
            let is_climb_neighbor = self.settings.climb && (i as isize - imax_global as isize).abs() == 1;

            let (delta_v_min, delta_v_max) = if self.settings.method == Method::Eb {
                let e_here = energies[i];
                let d1 = (energies[i + 1] - e_here).abs();
                let d2 = (e_here - energies[i - 1]).abs();
                (d1.min(d2), d1.max(d2))
            } else {
                (0.0, 0.0)
            };

            let mut f = effective_force(
                self.settings.method,
                self.settings.climb,
                is_imax,
                &tangent,
                &raw_forces[i - 1],
                &t1,
                nt1,
                &t2,
                nt2,
                self.k[i - 1],
                self.k[i],
                eq_length,
                is_climb_neighbor,
                delta_v_min,
                delta_v_max,
            );

            if self.settings.dynamic_relaxation {
                let rel = norm_field(&sub_field(&positions[i], &positions[imax_global]));
                let force_row_max = row_max_norm(&f);
                let is_frozen = should_freeze(force_row_max, self.settings.fmax, rel, self.settings.scale_fmax, is_imax);
                frozen[i - 1] = is_frozen;
                if is_frozen {
                    // Locally converged: report zero effective force rather
                    // than merely skipping the position update, so that an
                    // optimizer reading the force array directly also sees
                    // this image as at rest.
                    f = vec![Vector3::zeros(); f.len()];
                }
            }

            effective.push(f);
            t1 = t2;
            nt1 = nt2;
        }

        self.state = Some(StepState {
            energies,
            real_forces: raw_forces,
            imax: imax_global,
            emax,
            frozen,
        });

        Ok(effective)
    }

    fn evaluate_interior(&mut self) -> Result<(Vec<f64>, Vec<Vec<Vector3<f64>>>)> {
        let n_interior = self.chain.n_images() - 2;
        match &self.mode {
            ParallelMode::Serial => {
                let mut energies = Vec::with_capacity(n_interior);
                let mut forces = Vec::with_capacity(n_interior);
                for image in self.chain.interior() {
                    energies.push(image.get_potential_energy(false)?);
                    forces.push(image.get_forces()?);
                }
                Ok((energies, forces))
            }
            ParallelMode::Threaded => {
                let results: Vec<Result<(f64, Vec<Vector3<f64>>)>> = std::thread::scope(|scope| {
                    let handles: Vec<_> = self
                        .chain
                        .interior()
                        .iter()
                        .map(|image| {
                            scope.spawn(move || {
                                let e = image.get_potential_energy(false)?;
                                let f = image.get_forces()?;
                                Ok((e, f))
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().unwrap_or_else(|_| Err(MepError::ParallelStepFailed("worker thread panicked".into()))))
                        .collect()
                });
                let mut energies = Vec::with_capacity(n_interior);
                let mut forces = Vec::with_capacity(n_interior);
                for r in results {
                    match r {
                        Ok((e, f)) => {
                            energies.push(e);
                            forces.push(f);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok((energies, forces))
            }
            ParallelMode::Distributed(world) => {
                let world_size = world.size();
                let rank = world.rank();
                let chunk = n_interior / world_size.max(1);
                let start = rank * chunk;
                let end = start + chunk;
                let mut local_energies = vec![0.0; n_interior];
                let mut local_forces: Vec<Vec<Vector3<f64>>> = vec![Vec::new(); n_interior];

                let local_result: Result<()> = (|| {
                    for i in start..end {
                        local_energies[i] = self.chain.interior()[i].get_potential_energy(false)?;
                        local_forces[i] = self.chain.interior()[i].get_forces()?;
                    }
                    Ok(())
                })();

                if let Err(e) = local_result {
                    return Err(signal_failure(world.as_ref(), e.to_string()));
                }

                let mut energies = vec![0.0; n_interior];
                for i in 0..n_interior {
                    energies[i] = world.sum(local_energies[i]);
                }
                let n_atoms = self.chain.n_atoms();
                let mut forces = Vec::with_capacity(n_interior);
                for i in 0..n_interior {
                    let mut flat = vec![0.0; n_atoms * 3];
                    if !local_forces[i].is_empty() {
                        for (a, v) in local_forces[i].iter().enumerate() {
                            flat[3 * a] = v.x;
                            flat[3 * a + 1] = v.y;
                            flat[3 * a + 2] = v.z;
                        }
                    }
                    world.broadcast(&mut flat, i / chunk.max(1));
                    forces.push(crate::geometry::unflatten(&DVector::from_vec(flat)));
                }
                Ok((energies, forces))
            }
        }
    }
}

/// Input accepted for per-chain spring constants: either a single scalar
/// broadcast across every spring, or one value per spring.
pub enum SpringConstantsArg {
    Uniform(f64),
    PerSpring(Vec<f64>),
}

impl SpringConstantsArg {
    fn resolve(self, n_springs: usize) -> Vec<f64> {
        match self {
            SpringConstantsArg::Uniform(k) => vec![k; n_springs],
            SpringConstantsArg::PerSpring(v) => v,
        }
    }
}

impl From<f64> for SpringConstantsArg {
    fn from(k: f64) -> Self {
        SpringConstantsArg::Uniform(k)
    }
}

impl From<Vec<f64>> for SpringConstantsArg {
    fn from(v: Vec<f64>) -> Self {
        SpringConstantsArg::PerSpring(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{Calculator, PotentialProperty};
    use crate::config::NebSettings;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;
    use std::sync::{Arc, Mutex};

    /// A symmetric double well along x, `V(x) = (x^2 - 1)^2`, with minima at
    /// `x = +-1` and a barrier of height 1 at `x = 0`. Other coordinates are
    /// ignored (zero force), matching the standard 1-D NEB textbook example.
    struct DoubleWell;

    impl Calculator for DoubleWell {
        fn implemented_properties(&self) -> &'static [PotentialProperty] {
            &[PotentialProperty::Energy, PotentialProperty::Forces]
        }
        fn get_potential_energy(
            &mut self,
            positions: &[Vector3<f64>],
            _cell: &Matrix3<f64>,
            _pbc: [bool; 3],
            _force_consistent: bool,
        ) -> anyhow::Result<f64> {
            let x = positions[0].x;
            Ok((x * x - 1.0).powi(2))
        }
        fn get_forces(
            &mut self,
            positions: &[Vector3<f64>],
            _cell: &Matrix3<f64>,
            _pbc: [bool; 3],
        ) -> anyhow::Result<Vec<Vector3<f64>>> {
            let x = positions[0].x;
            Ok(vec![Vector3::new(-4.0 * x * (x * x - 1.0), 0.0, 0.0)])
        }
    }

    /// A calculator that always reports zero energy and force, for testing
    /// the spring force on a perfectly flat PES.
    struct FlatPes;

    impl Calculator for FlatPes {
        fn implemented_properties(&self) -> &'static [PotentialProperty] {
            &[PotentialProperty::Energy, PotentialProperty::Forces]
        }
        fn get_potential_energy(
            &mut self,
            positions: &[Vector3<f64>],
            _cell: &Matrix3<f64>,
            _pbc: [bool; 3],
            _force_consistent: bool,
        ) -> anyhow::Result<f64> {
            Ok(0.0)
        }
        fn get_forces(
            &mut self,
            positions: &[Vector3<f64>],
            _cell: &Matrix3<f64>,
            _pbc: [bool; 3],
        ) -> anyhow::Result<Vec<Vector3<f64>>> {
            Ok(vec![Vector3::zeros(); positions.len()])
        }
    }

    fn image_at(x: f64, calc: Arc<Mutex<dyn Calculator>>) -> Configuration {
        let mut cfg = Configuration::new(vec![1], vec![Vector3::new(x, 0.0, 0.0)], Matrix3::identity(), [false; 3]);
        cfg.set_calculator(calc);
        cfg
    }

    fn double_well_chain(xs: &[f64]) -> Vec<Configuration> {
        xs.iter()
            .map(|&x| image_at(x, Arc::new(Mutex::new(DoubleWell))))
            .collect()
    }

    #[test]
    fn rejects_wrong_spring_constant_count() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let err = Neb::new(images, vec![0.1, 0.1], ParallelMode::Serial, NebSettings::default());
        assert!(matches!(err, Err(MepError::ShapeMismatch(_))));
    }

    #[test]
    fn rejects_scale_fmax_without_dynamic_relaxation() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let settings = NebSettings {
            scale_fmax: 1.0,
            ..NebSettings::default()
        };
        let err = Neb::new(images, 0.1, ParallelMode::Serial, settings);
        assert!(matches!(err, Err(MepError::ConfigError(_))));
    }

    #[test]
    fn rejects_dynamic_relaxation_with_parallel() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let settings = NebSettings {
            dynamic_relaxation: true,
            parallel: true,
            ..NebSettings::default()
        };
        let err = Neb::new(images, 0.1, ParallelMode::Serial, settings);
        assert!(matches!(err, Err(MepError::ConfigError(_))));
    }

    #[test]
    fn rejects_shared_calculator_instance() {
        let shared: Arc<Mutex<dyn Calculator>> = Arc::new(Mutex::new(DoubleWell));
        let images = vec![
            image_at(-1.0, shared.clone()),
            image_at(-0.3, shared.clone()),
            image_at(0.3, shared.clone()),
            image_at(1.0, shared),
        ];
        let err = Neb::new(images, 0.1, ParallelMode::Serial, NebSettings::default());
        assert!(matches!(err, Err(MepError::SharedCalculator)));
    }

    #[test]
    fn get_forces_identifies_the_higher_energy_interior_image_as_imax() {
        // V(-0.3) == V(0.3), so the first interior image (global index 1)
        // wins the tie under strict '>' comparison.
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, NebSettings::default()).unwrap();
        neb.get_forces().unwrap();
        let state = neb.state.as_ref().unwrap();
        assert_eq!(state.imax, 1);
        assert_relative_eq!(state.emax, (0.3_f64 * 0.3 - 1.0).powi(2), epsilon = 1e-10);
    }

    #[test]
    fn climbing_image_force_has_no_downhill_component_along_the_path() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let settings = NebSettings {
            climb: true,
            ..NebSettings::default()
        };
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, settings).unwrap();
        let forces = neb.get_forces().unwrap();
        // The climbing image is the imax image (interior index 0, x = -0.3).
        // Its raw force points downhill, away from the barrier at x = 0
        // (negative x); the climbing force must invert that to point uphill,
        // towards the barrier (positive x).
        let raw_force_x = -4.0 * -0.3 * (0.09 - 1.0);
        assert!(raw_force_x < 0.0);
        assert!(forces[0][0].x > 0.0);
        assert_relative_eq!(forces[0][0].x, -raw_force_x, epsilon = 1e-10);
    }

    #[test]
    fn aseneb_is_stationary_on_a_linear_flat_pes() {
        let images: Vec<Configuration> = [-1.0, -0.5, 0.0, 0.5, 1.0]
            .iter()
            .map(|&x| image_at(x, Arc::new(Mutex::new(FlatPes))))
            .collect();
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, NebSettings::default()).unwrap();
        let forces = neb.get_forces().unwrap();
        for f in &forces {
            assert!(row_max_norm(f) < 1e-12);
        }
    }

    #[test]
    fn three_image_chain_computes_a_tangent_from_both_endpoints() {
        let images = double_well_chain(&[-1.0, 0.0, 1.0]);
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, NebSettings::default()).unwrap();
        let forces = neb.get_forces().unwrap();
        assert_eq!(forces.len(), 1);
        assert!(forces[0][0].x.is_finite());
    }

    #[test]
    fn eb_method_spring_force_vanishes_on_an_evenly_spaced_flat_pes() {
        let images: Vec<Configuration> = [-1.0, -0.5, 0.0, 0.5, 1.0]
            .iter()
            .map(|&x| image_at(x, Arc::new(Mutex::new(FlatPes))))
            .collect();
        let settings = NebSettings {
            method: Method::Eb,
            ..NebSettings::default()
        };
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, settings).unwrap();
        let forces = neb.get_forces().unwrap();
        for f in &forces {
            assert_relative_eq!(f[0].x, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn dynamic_relaxation_exempts_only_the_imax_image_from_freezing() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let settings = NebSettings {
            dynamic_relaxation: true,
            fmax: 1.0e9,
            ..NebSettings::default()
        };
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, settings).unwrap();
        let forces = neb.get_forces().unwrap();
        assert_eq!(neb.state.as_ref().unwrap().frozen, vec![false, true]);
        // The frozen image's effective force is reported as zero, not just
        // skipped by set_dofs.
        assert_relative_eq!(forces[1][0].x, 0.0, epsilon = 1e-12);

        let zeros = DVector::from_vec(vec![0.0; 6]);
        neb.set_dofs(&zeros).unwrap();
        // Interior index 0 (global image 1, x = -0.3) is the imax image and
        // was updated; interior index 1 (global image 2, x = 0.3) was frozen.
        assert_relative_eq!(neb.chain.images()[1].positions[0].x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(neb.chain.images()[2].positions[0].x, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn all_equal_interior_energies_tie_break_to_the_first_interior_image() {
        let images: Vec<Configuration> = [-1.0, -0.5, 0.0, 0.5, 1.0]
            .iter()
            .map(|&x| image_at(x, Arc::new(Mutex::new(FlatPes))))
            .collect();
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, NebSettings::default()).unwrap();
        neb.get_forces().unwrap();
        assert_eq!(neb.state.as_ref().unwrap().imax, 1);
    }

    #[test]
    fn dynamic_relaxation_with_every_image_already_converged_returns_an_all_zero_force_vector() {
        let images: Vec<Configuration> = [-1.0, -0.5, 0.0, 0.5, 1.0]
            .iter()
            .map(|&x| image_at(x, Arc::new(Mutex::new(FlatPes))))
            .collect();
        let settings = NebSettings {
            dynamic_relaxation: true,
            fmax: 1.0,
            ..NebSettings::default()
        };
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, settings).unwrap();
        let forces = neb.get_forces().unwrap();
        for f in &forces {
            assert_relative_eq!(f[0].x, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn set_dofs_without_prior_get_forces_is_a_config_error_under_dynamic_relaxation() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let settings = NebSettings {
            dynamic_relaxation: true,
            ..NebSettings::default()
        };
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, settings).unwrap();
        let zeros = DVector::from_vec(vec![0.0; 6]);
        assert!(matches!(neb.set_dofs(&zeros), Err(MepError::ConfigError(_))));
    }

    #[test]
    fn rotation_translation_removal_never_touches_either_endpoint() {
        let images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let settings = NebSettings {
            remove_rotation_and_translation: true,
            ..NebSettings::default()
        };
        let mut neb = Neb::new(images, 0.1, ParallelMode::Serial, settings).unwrap();
        neb.get_forces().unwrap();
        assert_relative_eq!(neb.chain.images()[0].positions[0].x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(neb.chain.images()[3].positions[0].x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn threaded_mode_matches_serial_mode() {
        let serial_images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let mut serial = Neb::new(serial_images, 0.1, ParallelMode::Serial, NebSettings::default()).unwrap();
        let serial_forces = serial.get_forces().unwrap();

        let threaded_images = double_well_chain(&[-1.0, -0.3, 0.3, 1.0]);
        let mut threaded = Neb::new(threaded_images, 0.1, ParallelMode::Threaded, NebSettings::default()).unwrap();
        let threaded_forces = threaded.get_forces().unwrap();

        for (a, b) in serial_forces.iter().zip(threaded_forces.iter()) {
            assert_relative_eq!(a[0].x, b[0].x, epsilon = 1e-12);
        }
    }
}
