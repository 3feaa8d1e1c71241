//! Pre-sim/post-sim noise injection (spec §4.6 steps 1, 3).
//!
//! Grounded in `wattson/util/noise.py`: the original applies a relative
//! perturbation to a handful of named measures before handing values to the
//! solver, then reads them back afterwards. This crate generalizes that to
//! any numeric [`GridValue`], since the solver seam itself is generic
//! (DESIGN.md Open Question 4) rather than pandapower-specific.

use rand::Rng;
use serde_json::Value;

use super::grid_model::GridModel;
use wattson_core::model::grid::GridValueContext;

/// A perturbation strategy applied around a simulation iteration.
///
/// `apply_pre_sim` runs on configuration-context values before the solver,
/// returning the values it changed so the loop can undo the perturbation
/// once the solver has consumed them (spec: "captures the current
/// configuration state; applies pre-sim noise" / "reverts pre-sim noise").
/// `apply_post_sim` runs on measurement-context values after the solver,
/// and is not reverted: it represents sensor noise the outside world
/// would see, not a transient input perturbation.
pub trait Noise: Send + Sync {
    fn apply_pre_sim(&self, model: &GridModel) -> Vec<(String, Value)>;
    fn revert_pre_sim(&self, model: &GridModel, captured: Vec<(String, Value)>);
    fn apply_post_sim(&self, model: &GridModel);
}

/// The default: no perturbation at all. Matches a scenario that configures
/// no noise profile (`noise.py`'s callers all tolerate a missing config).
#[derive(Debug, Default)]
pub struct NoNoise;

impl Noise for NoNoise {
    fn apply_pre_sim(&self, _model: &GridModel) -> Vec<(String, Value)> {
        Vec::new()
    }

    fn revert_pre_sim(&self, _model: &GridModel, _captured: Vec<(String, Value)>) {}

    fn apply_post_sim(&self, _model: &GridModel) {}
}

/// Applies independent Gaussian relative noise (`value * (1 + N(0, sigma))`)
/// to every numeric value in a context, mirroring the "X%" noise profile
/// strings the original configuration accepts (e.g. `"1%"` → `sigma = 0.01`).
#[derive(Debug, Clone, Copy)]
pub struct GaussianNoise {
    pub pre_sim_sigma: f64,
    pub post_sim_sigma: f64,
}

impl GaussianNoise {
    pub fn new(pre_sim_sigma: f64, post_sim_sigma: f64) -> Self {
        Self { pre_sim_sigma, post_sim_sigma }
    }

    fn perturb(&self, value: &Value, sigma: f64) -> Option<Value> {
        let number = value.as_f64()?;
        if sigma <= 0.0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        let factor = 1.0 + sample_standard_normal(&mut rng) * sigma;
        Some(serde_json::json!(number * factor))
    }
}

impl Noise for GaussianNoise {
    fn apply_pre_sim(&self, model: &GridModel) -> Vec<(String, Value)> {
        if self.pre_sim_sigma <= 0.0 {
            return Vec::new();
        }
        let mut captured = Vec::new();
        for value in model.values_in_context(GridValueContext::Configuration) {
            let identifier = value.identifier();
            if let Some(perturbed) = self.perturb(&value.value, self.pre_sim_sigma) {
                captured.push((identifier.clone(), value.value.clone()));
                let _ = model.set_value_by_identifier(&identifier, perturbed, true);
            }
        }
        captured
    }

    fn revert_pre_sim(&self, model: &GridModel, captured: Vec<(String, Value)>) {
        for (identifier, original) in captured {
            let _ = model.set_value_by_identifier(&identifier, original, true);
        }
    }

    fn apply_post_sim(&self, model: &GridModel) {
        if self.post_sim_sigma <= 0.0 {
            return;
        }
        for value in model.values_in_context(GridValueContext::Measurement) {
            let identifier = value.identifier();
            if let Some(perturbed) = self.perturb(&value.value, self.post_sim_sigma) {
                let _ = model.set_value_by_identifier(&identifier, perturbed, true);
            }
        }
    }
}

/// Box-Muller sample from the standard normal distribution, avoiding a
/// dependency on `rand_distr` for a single distribution.
fn sample_standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_noise_leaves_values_untouched() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.0), false).unwrap();
        let noise = NoNoise;
        let captured = noise.apply_pre_sim(&model);
        assert!(captured.is_empty());
        noise.apply_post_sim(&model);
        let value = model.get_value("bus.1", GridValueContext::Configuration, "voltage_setpoint").unwrap();
        assert_eq!(value.value, json!(1.0));
    }

    #[test]
    fn pre_sim_noise_reverts_to_the_captured_original() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.0), false).unwrap();
        let noise = GaussianNoise::new(0.05, 0.0);
        let captured = noise.apply_pre_sim(&model);
        assert_eq!(captured.len(), 1);
        noise.revert_pre_sim(&model, captured);
        let value = model.get_value("bus.1", GridValueContext::Configuration, "voltage_setpoint").unwrap();
        assert_eq!(value.value, json!(1.0));
    }

    #[test]
    fn zero_sigma_perturbs_nothing() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Measurement, "voltage", json!(1.0), false).unwrap();
        let noise = GaussianNoise::new(0.0, 0.0);
        noise.apply_post_sim(&model);
        let value = model.get_value("bus.1", GridValueContext::Measurement, "voltage").unwrap();
        assert_eq!(value.value, json!(1.0));
    }
}
