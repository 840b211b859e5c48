//! `ImageChain`: an ordered sequence of images sharing atom count and
//! species, plus interpolation of the interior images between two fixed end
//! points.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::calculator::Calculator;
use crate::configuration::Configuration;
use crate::error::{MepError, Result};
use crate::geometry::{flatten, mic, unflatten};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMethod {
    Linear,
    Idpp,
}

pub struct ImageChain {
    images: Vec<Configuration>,
}

impl ImageChain {
    /// Validates that every image shares atom count and species ordering
    /// with the first, and that there are at least three images (two ends
    /// plus at least one movable interior image).
    pub fn new(images: Vec<Configuration>) -> Result<Self> {
        if images.len() < 3 {
            return Err(MepError::ShapeMismatch(format!(
                "a chain needs at least 3 images (2 endpoints + 1 interior), got {}",
                images.len()
            )));
        }
        let n = images[0].n_atoms();
        let species = &images[0].atomic_numbers;
        for (k, image) in images.iter().enumerate() {
            if image.n_atoms() != n {
                return Err(MepError::ShapeMismatch(format!(
                    "image {k} has {} atoms, expected {n}",
                    image.n_atoms()
                )));
            }
            if &image.atomic_numbers != species {
                return Err(MepError::ShapeMismatch(format!(
                    "image {k} has a different species ordering than image 0"
                )));
            }
        }
        Ok(ImageChain { images })
    }

    pub fn n_images(&self) -> usize {
        self.images.len()
    }

    pub fn n_atoms(&self) -> usize {
        self.images[0].n_atoms()
    }

    pub fn n_dofs(&self) -> usize {
        3 * self.n_atoms() * (self.n_images() - 2)
    }

    pub fn images(&self) -> &[Configuration] {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut [Configuration] {
        &mut self.images
    }

    pub fn interior(&self) -> &[Configuration] {
        &self.images[1..self.n_images() - 1]
    }

    pub fn interior_mut(&mut self) -> &mut [Configuration] {
        let n = self.n_images();
        &mut self.images[1..n - 1]
    }

    /// The interior degrees of freedom flattened into one vector, image by
    /// image, atom by atom, `(x, y, z)` each.
    pub fn get_dofs(&self) -> DVector<f64> {
        let mut flat = Vec::with_capacity(self.n_dofs());
        for image in self.interior() {
            for p in &image.positions {
                flat.push(p.x);
                flat.push(p.y);
                flat.push(p.z);
            }
        }
        DVector::from_vec(flat)
    }

    pub fn set_dofs(&mut self, dofs: &DVector<f64>) {
        debug_assert_eq!(dofs.len(), self.n_dofs());
        let n_atoms = self.n_atoms();
        for (k, image) in self.interior_mut().iter_mut().enumerate() {
            for a in 0..n_atoms {
                let base = 3 * (k * n_atoms + a);
                image.positions[a] = Vector3::new(dofs[base], dofs[base + 1], dofs[base + 2]);
            }
        }
    }

    /// Linear or IDPP-seeded interpolation of the interior images between
    /// the fixed end images.
    pub fn interpolate(&mut self, method: InterpolationMethod, mic_corrected: bool) -> Result<()> {
        match method {
            InterpolationMethod::Linear => self.interpolate_linear(mic_corrected),
            InterpolationMethod::Idpp => self.interpolate_idpp(mic_corrected),
        }
    }

    fn interpolate_linear(&mut self, mic_corrected: bool) -> Result<()> {
        let m = self.n_images();
        let cell = self.images[0].cell;
        let pbc = self.images[0].pbc;
        let p0 = self.images[0].positions.clone();
        let plast = self.images[m - 1].positions.clone();
        let n_atoms = self.n_atoms();

        let mut raw_diff: Vec<Vector3<f64>> = Vec::with_capacity(n_atoms);
        for a in 0..n_atoms {
            let d = plast[a] - p0[a];
            raw_diff.push(if mic_corrected { mic(d, &cell, pbc) } else { d });
        }

        for k in 1..m - 1 {
            let t = k as f64 / (m - 1) as f64;
            let image = &mut self.images[k];
            for a in 0..n_atoms {
                image.positions[a] = p0[a] + raw_diff[a] * t;
            }
        }
        Ok(())
    }

    /// Seeds interior positions by linear interpolation, then relaxes the
    /// whole band through a real internal NEB (per-image [`Idpp`] calculator,
    /// full tangent/spring/projection pipeline) whose target distance matrix
    /// is linearly interpolated between the two end images' pairwise
    /// distance matrices. This is deliberately a full NEB, not an
    /// independent per-image descent: the seeded path should be a locally
    /// force-balanced band, not just each image sitting at its own IDPP
    /// minimum with no coupling to its neighbors.
    fn interpolate_idpp(&mut self, mic_corrected: bool) -> Result<()> {
        use std::sync::{Arc, Mutex};

        use crate::config::NebSettings;
        use crate::idpp::Idpp;
        use crate::neb::Neb;
        use crate::projector::row_max_norm;
        use crate::world::ParallelMode;

        self.interpolate_linear(mic_corrected)?;

        let m = self.n_images();
        let n = self.n_atoms();
        let cell = self.images[0].cell;
        let pbc = self.images[0].pbc;

        let distance_matrix = |positions: &[Vector3<f64>]| -> DMatrix<f64> {
            let mut d = DMatrix::zeros(n, n);
            for i in 0..n {
                for j in (i + 1)..n {
                    let raw = positions[j] - positions[i];
                    let v = if mic_corrected { mic(raw, &cell, pbc) } else { raw };
                    d[(i, j)] = v.norm();
                    d[(j, i)] = d[(i, j)];
                }
            }
            d
        };

        let d0 = distance_matrix(&self.images[0].positions);
        let dlast = distance_matrix(&self.images[m - 1].positions);

        // Build a standalone seed chain with per-interior-image IDPP
        // calculators; `self.images`' own calculators are left untouched.
        let mut seed_images: Vec<Configuration> = self.images.clone();
        for k in 1..m - 1 {
            let t = k as f64 / (m - 1) as f64;
            let target = &d0 * (1.0 - t) + &dlast * t;
            let calc: Arc<Mutex<dyn Calculator>> = Arc::new(Mutex::new(Idpp::new(target, mic_corrected)));
            seed_images[k].set_calculator(calc);
        }

        let mut neb = Neb::new(seed_images, 0.1, ParallelMode::Serial, NebSettings::default())?;
        let step_size = 0.01;
        let fmax = 0.1;
        for _ in 0..100 {
            let forces = neb.get_forces()?;
            let row_max = forces.iter().map(|f| row_max_norm(f)).fold(0.0, f64::max);
            if row_max <= fmax {
                break;
            }
            let mut dofs = neb.get_dofs();
            let mut idx = 0;
            for f in &forces {
                for v in f {
                    dofs[idx] += v.x * step_size;
                    idx += 1;
                    dofs[idx] += v.y * step_size;
                    idx += 1;
                    dofs[idx] += v.z * step_size;
                    idx += 1;
                }
            }
            neb.set_dofs(&dofs)?;
        }

        for (image, relaxed) in self.images[1..m - 1].iter_mut().zip(neb.chain().interior()) {
            image.positions = relaxed.positions.clone();
        }
        Ok(())
    }

    pub fn iter_images(&self) -> std::slice::Iter<'_, Configuration> {
        self.images.iter()
    }

    pub fn flatten_field(field: &[Vector3<f64>]) -> DVector<f64> {
        flatten(field)
    }

    pub fn unflatten_field(v: &DVector<f64>) -> Vec<Vector3<f64>> {
        unflatten(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn bare_image(pos: Vec<Vector3<f64>>) -> Configuration {
        Configuration::new(vec![1; pos.len()], pos, Matrix3::identity(), [false; 3])
    }

    #[test]
    fn rejects_too_few_images() {
        let images = vec![bare_image(vec![Vector3::zeros()]); 2];
        assert!(matches!(
            ImageChain::new(images),
            Err(MepError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn rejects_mismatched_atom_counts() {
        let images = vec![
            bare_image(vec![Vector3::zeros()]),
            bare_image(vec![Vector3::zeros()]),
            bare_image(vec![Vector3::zeros(), Vector3::zeros()]),
        ];
        assert!(matches!(
            ImageChain::new(images),
            Err(MepError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn linear_interpolation_is_evenly_spaced() {
        let p0 = vec![Vector3::new(0.0, 0.0, 0.0)];
        let p1 = vec![Vector3::new(4.0, 0.0, 0.0)];
        let images = vec![bare_image(p0), bare_image(vec![Vector3::zeros()]), bare_image(p1)];
        let mut chain = ImageChain::new(images).unwrap();
        chain.interpolate(InterpolationMethod::Linear, false).unwrap();
        assert_relative_eq!(chain.images()[1].positions[0].x, 2.0, epsilon = 1e-10);
    }

    #[test]
    fn linear_interpolation_is_idempotent() {
        let p0 = vec![Vector3::new(0.0, 0.0, 0.0)];
        let p1 = vec![Vector3::new(2.0, 0.0, 0.0)];
        let images = vec![bare_image(p0), bare_image(vec![Vector3::zeros()]), bare_image(p1)];
        let mut chain = ImageChain::new(images).unwrap();
        chain.interpolate(InterpolationMethod::Linear, false).unwrap();
        let once = chain.images()[1].positions[0];
        chain.interpolate(InterpolationMethod::Linear, false).unwrap();
        let twice = chain.images()[1].positions[0];
        assert_relative_eq!(once, twice, epsilon = 1e-12);
    }

    #[test]
    fn idpp_recovers_a_rigid_translation_between_two_h2_molecules() {
        // Both end images are the same H2 molecule (bond length 0.74), one
        // translated by (2, 0, 0) relative to the other. The true minimum
        // energy path is the rigid translation itself, which already has
        // zero IDPP penalty at every point, so the interior image should
        // land on (within tolerance) the plain linear interpolation of it.
        let bond = 0.74;
        let p0 = vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(bond, 0.0, 0.0)];
        let shift = Vector3::new(2.0, 0.0, 0.0);
        let plast = vec![p0[0] + shift, p0[1] + shift];
        let interior_guess = vec![Vector3::new(10.0, 10.0, 10.0), Vector3::new(10.0 + bond, 10.0, 10.0)];
        let images = vec![bare_image(p0.clone()), bare_image(interior_guess), bare_image(plast)];
        let mut chain = ImageChain::new(images).unwrap();
        chain.interpolate(InterpolationMethod::Idpp, false).unwrap();

        let expected = vec![p0[0] + shift * 0.5, p0[1] + shift * 0.5];
        for (got, want) in chain.images()[1].positions.iter().zip(expected.iter()) {
            assert_relative_eq!(got.x, want.x, epsilon = 1e-3);
            assert_relative_eq!(got.y, want.y, epsilon = 1e-3);
            assert_relative_eq!(got.z, want.z, epsilon = 1e-3);
        }
    }

    #[test]
    fn dof_round_trip() {
        let p0 = vec![Vector3::new(0.0, 0.0, 0.0)];
        let p1 = vec![Vector3::new(1.0, 1.0, 1.0)];
        let p2 = vec![Vector3::new(2.0, 2.0, 2.0)];
        let pl = vec![Vector3::new(4.0, 4.0, 4.0)];
        let images = vec![
            bare_image(p0),
            bare_image(p1),
            bare_image(p2),
            bare_image(pl),
        ];
        let mut chain = ImageChain::new(images).unwrap();
        let dofs = chain.get_dofs();
        chain.set_dofs(&dofs);
        let dofs2 = chain.get_dofs();
        assert_relative_eq!(dofs, dofs2, epsilon = 1e-12);
    }
}
