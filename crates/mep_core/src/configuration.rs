//! A single atomistic image: species, geometry, periodicity, and an
//! optionally-attached [`Calculator`].

use std::sync::{Arc, Mutex};

use nalgebra::{Matrix3, Vector3};

use crate::calculator::Calculator;
use crate::error::{MepError, Result};

/// A shared, interior-mutable handle to a calculator. `Arc<Mutex<_>>` rather
/// than `Rc<RefCell<_>>`: interior images are evaluated from a fork-join
/// thread scope in `world::ParallelMode::Threaded`, so the handle must be
/// `Send`/`Sync`-capable even though any single evaluation only ever touches
/// one image's calculator.
#[derive(Clone)]
pub struct Configuration {
    pub atomic_numbers: Vec<u32>,
    pub positions: Vec<Vector3<f64>>,
    pub cell: Matrix3<f64>,
    pub pbc: [bool; 3],
    pub calculator: Option<Arc<Mutex<dyn Calculator>>>,
}

impl Configuration {
    pub fn new(
        atomic_numbers: Vec<u32>,
        positions: Vec<Vector3<f64>>,
        cell: Matrix3<f64>,
        pbc: [bool; 3],
    ) -> Self {
        Configuration {
            atomic_numbers,
            positions,
            cell,
            pbc,
            calculator: None,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.positions.len()
    }

    pub fn set_calculator(&mut self, calculator: Arc<Mutex<dyn Calculator>>) {
        self.calculator = Some(calculator);
    }

    /// Identity key for the attached calculator, if any: the address of the
    /// underlying allocation. Used to detect images that accidentally share
    /// one mutable calculator instance (see `MepError::SharedCalculator`).
    pub fn calculator_identity(&self) -> Option<usize> {
        self.calculator
            .as_ref()
            .map(|rc| Arc::as_ptr(rc) as *const () as usize)
    }

    pub fn get_potential_energy(&self, force_consistent: bool) -> Result<f64> {
        let calc = self
            .calculator
            .as_ref()
            .ok_or_else(|| MepError::ConfigError("image has no attached calculator".into()))?;
        let mut guard = calc
            .lock()
            .map_err(|_| MepError::CalculatorError("calculator lock poisoned".into()))?;
        guard
            .get_potential_energy(&self.positions, &self.cell, self.pbc, force_consistent)
            .map_err(|e| MepError::CalculatorError(e.to_string()))
    }

    pub fn get_forces(&self) -> Result<Vec<Vector3<f64>>> {
        let calc = self
            .calculator
            .as_ref()
            .ok_or_else(|| MepError::ConfigError("image has no attached calculator".into()))?;
        let mut guard = calc
            .lock()
            .map_err(|_| MepError::CalculatorError("calculator lock poisoned".into()))?;
        guard
            .get_forces(&self.positions, &self.cell, self.pbc)
            .map_err(|e| MepError::CalculatorError(e.to_string()))
    }
}
