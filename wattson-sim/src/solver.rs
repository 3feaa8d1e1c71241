//! The power-flow solver seam (DESIGN.md Open Question 4).
//!
//! Power-flow numerics are an explicit non-goal: this crate's job is the
//! co-simulation control plane around a grid model, not a load-flow
//! implementation. [`PowerFlowSolver`] exists so a deployment can plug in a
//! real one without [`crate::physical`] caring how convergence is reached.

use crate::physical::grid_model::GridModel;

/// Computes derived state (e.g. bus voltages, line loading) from the grid
/// model's configuration- and property-context values, writing results back
/// as measurement-context `GridValue`s.
///
/// Implementations run once per simulation iteration, after any pending
/// configuration writes have been applied and before noise injection.
pub trait PowerFlowSolver: Send + Sync {
    fn solve(&self, model: &GridModel);
}

/// The default solver: applies no numerical correction at all.
///
/// Configuration writes (`bus.1.CONFIGURATION.voltage_setpoint`, and so on)
/// already land directly in the model; this solver only mirrors them into
/// the corresponding measurement-context value so a `GET_GRID_VALUE` on
/// `MEASUREMENT` reads back whatever was last configured, without pretending
/// to compute a load flow.
#[derive(Debug, Default)]
pub struct PassthroughSolver;

impl PowerFlowSolver for PassthroughSolver {
    fn solve(&self, model: &GridModel) {
        model.mirror_configuration_to_measurement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattson_core::model::grid::GridValueContext;

    #[test]
    fn passthrough_solver_mirrors_configuration_into_measurement() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", serde_json::json!(1.05), false).unwrap();

        let solver = PassthroughSolver;
        solver.solve(&model);

        let measured = model.get_value("bus.1", GridValueContext::Measurement, "voltage_setpoint").unwrap();
        assert_eq!(measured.observed(), &serde_json::json!(1.05));
    }
}
