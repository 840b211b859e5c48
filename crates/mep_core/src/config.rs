//! Settings surfaces, in the style of the teacher's `ContinuationSettings`
//! (`continuation/types.rs`): plain-data structs with an explicit `Default`
//! impl and no hidden defaults.

use serde::{Deserialize, Serialize};

use crate::tangent::Method;

/// Spring constants along the chain: either one scalar broadcast to every
/// spring, or one value per spring (`n_images - 1` entries).
#[derive(Debug, Clone)]
pub enum SpringConstants {
    Uniform(f64),
    PerSpring(Vec<f64>),
}

impl SpringConstants {
    pub fn resolve(&self, n_springs: usize) -> Vec<f64> {
        match self {
            SpringConstants::Uniform(k) => vec![*k; n_springs],
            SpringConstants::PerSpring(v) => v.clone(),
        }
    }
}

impl From<f64> for SpringConstants {
    fn from(k: f64) -> Self {
        SpringConstants::Uniform(k)
    }
}

impl Default for SpringConstants {
    fn default() -> Self {
        SpringConstants::Uniform(0.1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NebSettings {
    pub fmax: f64,
    pub climb: bool,
    pub parallel: bool,
    pub remove_rotation_and_translation: bool,
    pub dynamic_relaxation: bool,
    pub scale_fmax: f64,
    pub method: Method,
}

impl Default for NebSettings {
    fn default() -> Self {
        NebSettings {
            fmax: 0.05,
            climb: false,
            parallel: false,
            remove_rotation_and_translation: false,
            dynamic_relaxation: false,
            scale_fmax: 0.0,
            method: Method::AseNeb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconMethod {
    Neb,
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreconSettings {
    pub precon_name: String,
    pub method: PreconMethod,
    pub fmax: f64,
    /// For `PreconMethod::Neb`: scale spring constants between `k_min` and
    /// `k_max` by local energy, stiffer near the barrier.
    pub adapt_springs: bool,
    pub k_min: f64,
    pub k_max: f64,
}

impl Default for PreconSettings {
    fn default() -> Self {
        PreconSettings {
            precon_name: "Exp".to_string(),
            method: PreconMethod::String,
            fmax: 0.05,
            adapt_springs: false,
            k_min: 0.1,
            k_max: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OdeSettings {
    pub fmax: f64,
    pub rtol: f64,
    pub c1: f64,
    pub c2: f64,
    pub max_steps: usize,
}

impl Default for OdeSettings {
    fn default() -> Self {
        OdeSettings {
            fmax: 0.05,
            rtol: 0.1,
            c1: 0.2,
            c2: 2.0,
            max_steps: 1000,
        }
    }
}
