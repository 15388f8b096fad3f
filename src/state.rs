//! Simulation state snapshots and the increment-to-physics mapping.
//!
//! A [`SimulationState`] is a plain value: cell pressure, water and gas
//! saturation, dissolved-gas ratio `Rs`, vaporized-oil ratio `Rv`, per-cell
//! [`PhaseStatus`] flags, and the well solution (bottom-hole pressures plus
//! per-phase surface rates). Oil saturation is never stored: it is always
//! `1 - sw - sg` (the saturation closure).
//!
//! Two rules keep the Newton loop well behaved:
//!
//! - **Lagged status**: phase status is decided once per timestep by
//!   [`SimulationState::refresh_phase_status`] before the first iteration
//!   and never recomputed mid-loop. The shared "x" primary variable means
//!   `sg`, `Rs`, or `Rv` depending on these frozen flags, so flipping them
//!   between iterations would change the meaning of the unknowns under the
//!   solver's feet.
//! - **Limited updates**: raw Newton increments pass through the caps in
//!   [`UpdateLimits`], and saturations are clamped and renormalized to sum
//!   to one after *every* update, not just at convergence.

use nalgebra::DVector;
use num_dual::Dual64;

use crate::fluid::FluidProperties;
use crate::wells::WellControl;

/// Phase presence of one cell, frozen for the duration of a timestep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Free gas and oil coexist; x means `sg`, Rs and Rv sit on their
    /// saturated curves
    Saturated,
    /// No free gas; x means `Rs` (below its saturated value)
    UndersaturatedOil,
    /// No oil; x means `Rv` (below its saturated value)
    UndersaturatedGas,
}

/// Bottom-hole pressures and per-phase surface rates, one entry per well.
#[derive(Debug, Clone, Default)]
pub struct WellSolution {
    /// Bottom-hole pressure [Pa]
    pub bhp: DVector<f64>,
    /// Water surface rate [sm3/s], positive = production
    pub water_rate: DVector<f64>,
    /// Oil surface rate [sm3/s]
    pub oil_rate: DVector<f64>,
    /// Gas surface rate [sm3/s]
    pub gas_rate: DVector<f64>,
}

impl WellSolution {
    /// All-zero solution for `n_wells` wells with bhp initialized to `bhp0`.
    pub fn new(n_wells: usize, bhp0: f64) -> Self {
        WellSolution {
            bhp: DVector::from_element(n_wells, bhp0),
            water_rate: DVector::zeros(n_wells),
            oil_rate: DVector::zeros(n_wells),
            gas_rate: DVector::zeros(n_wells),
        }
    }

    /// Number of wells.
    pub fn len(&self) -> usize {
        self.bhp.len()
    }

    /// True when no wells are present.
    pub fn is_empty(&self) -> bool {
        self.bhp.len() == 0
    }
}

/// Output-oriented quantities refreshed by every assembly.
///
/// Purely diagnostic; nothing in the solver reads these back.
#[derive(Debug, Clone, Default)]
pub struct StateDiagnostics {
    /// Per-phase face fluxes from the latest assembly [reservoir m3/s]
    pub phase_flux: Vec<(crate::Phase, DVector<f64>)>,
    /// Per-phase inverse formation-volume factors per cell [-]
    pub recip_fvf: Vec<(crate::Phase, DVector<f64>)>,
}

/// Caps applied to raw Newton increments before they touch the state.
#[derive(Debug, Clone, Copy)]
pub struct UpdateLimits {
    /// Max pressure change relative to the current cell pressure
    pub dp_max_rel: f64,
    /// Max absolute saturation change per update
    pub ds_max: f64,
    /// Max Rs/Rv change relative to the current cell value
    pub drs_max_rel: f64,
    /// Max bhp change relative to the current well bhp
    pub dbhp_max_rel: f64,
}

impl Default for UpdateLimits {
    fn default() -> Self {
        UpdateLimits { dp_max_rel: 0.2, ds_max: 0.2, drs_max_rel: 0.2, dbhp_max_rel: 0.25 }
    }
}

impl UpdateLimits {
    /// Overrides the relative pressure cap.
    pub fn with_dp_max_rel(mut self, cap: f64) -> Self {
        self.dp_max_rel = cap;
        self
    }

    /// Overrides the absolute saturation cap.
    pub fn with_ds_max(mut self, cap: f64) -> Self {
        self.ds_max = cap;
        self
    }

    /// Overrides the relative Rs/Rv cap.
    pub fn with_drs_max_rel(mut self, cap: f64) -> Self {
        self.drs_max_rel = cap;
        self
    }

    /// Overrides the relative bhp cap.
    pub fn with_dbhp_max_rel(mut self, cap: f64) -> Self {
        self.dbhp_max_rel = cap;
        self
    }
}

/// Full solution snapshot at one point in time.
#[derive(Debug, Clone)]
pub struct SimulationState {
    /// Oil-phase (reference) pressure per cell [Pa]
    pub pressure: DVector<f64>,
    /// Water saturation per cell [-]
    pub sw: DVector<f64>,
    /// Free-gas saturation per cell [-]
    pub sg: DVector<f64>,
    /// Dissolved gas-oil ratio per cell [sm3/sm3]
    pub rs: DVector<f64>,
    /// Vaporized oil-gas ratio per cell [sm3/sm3]
    pub rv: DVector<f64>,
    /// Polymer concentration per cell [kg/sm3]; empty unless a polymer
    /// model is in play
    pub polymer: DVector<f64>,
    /// Lagged phase status per cell
    pub status: Vec<PhaseStatus>,
    /// Well solution variables
    pub wells: WellSolution,
    /// Diagnostics cache; not part of the solution
    pub diagnostics: StateDiagnostics,
}

impl SimulationState {
    /// Uniform two-phase (water/oil) initial state: no gas anywhere.
    pub fn two_phase(n_cells: usize, p0: f64, sw0: f64, n_wells: usize) -> Self {
        SimulationState {
            pressure: DVector::from_element(n_cells, p0),
            sw: DVector::from_element(n_cells, sw0),
            sg: DVector::zeros(n_cells),
            rs: DVector::zeros(n_cells),
            rv: DVector::zeros(n_cells),
            polymer: DVector::zeros(0),
            status: vec![PhaseStatus::UndersaturatedOil; n_cells],
            wells: WellSolution::new(n_wells, p0),
            diagnostics: StateDiagnostics::default(),
        }
    }

    /// Uniform three-phase initial state.
    ///
    /// Rs and Rv start at zero; call [`refresh_phase_status`] with the
    /// fluid before the first step to place them on consistent curves.
    ///
    /// [`refresh_phase_status`]: SimulationState::refresh_phase_status
    pub fn three_phase(n_cells: usize, p0: f64, sw0: f64, sg0: f64, n_wells: usize) -> Self {
        SimulationState {
            sg: DVector::from_element(n_cells, sg0),
            status: vec![PhaseStatus::Saturated; n_cells],
            ..Self::two_phase(n_cells, p0, sw0, n_wells)
        }
    }

    /// Attaches an initial polymer concentration field.
    pub fn with_polymer(mut self, concentration: DVector<f64>) -> Self {
        self.polymer = concentration;
        self
    }

    /// Number of cells.
    pub fn n_cells(&self) -> usize {
        self.pressure.len()
    }

    /// Number of wells.
    pub fn n_wells(&self) -> usize {
        self.wells.len()
    }

    /// Derived oil saturation, `1 - sw - sg`.
    pub fn so(&self) -> DVector<f64> {
        self.sw.zip_map(&self.sg, |w, g| 1.0 - w - g)
    }

    /// Recomputes the per-cell phase status and pins Rs/Rv to their
    /// saturated curves where the status demands it.
    ///
    /// Called exactly once per timestep, before the Newton loop. The
    /// `epsilon` threshold decides when a phase counts as present.
    pub fn refresh_phase_status<F: FluidProperties>(&mut self, fluid: &F, epsilon: f64) {
        for i in 0..self.n_cells() {
            let p = Dual64::from(self.pressure[i]);
            let so = 1.0 - self.sw[i] - self.sg[i];
            if self.sg[i] > epsilon && so > epsilon {
                self.status[i] = PhaseStatus::Saturated;
                self.rs[i] = fluid.rs_sat(p).re;
                self.rv[i] = fluid.rv_sat(p).re;
            } else if so > epsilon {
                self.status[i] = PhaseStatus::UndersaturatedOil;
                self.sg[i] = 0.0;
                self.rv[i] = fluid.rv_sat(p).re;
            } else {
                self.status[i] = PhaseStatus::UndersaturatedGas;
                self.sg[i] = 1.0 - self.sw[i];
                self.rs[i] = fluid.rs_sat(p).re;
            }
        }
    }

    /// Applies a pressure increment with the relative cap.
    pub fn apply_pressure_update(&mut self, dp: &DVector<f64>, limits: &UpdateLimits) {
        for i in 0..self.pressure.len() {
            let cap = limits.dp_max_rel * self.pressure[i].abs();
            self.pressure[i] += clamp_abs(dp[i], cap);
        }
    }

    /// Applies a water-saturation increment: absolute cap, then closure.
    pub fn apply_sw_update(&mut self, ds: &DVector<f64>, limits: &UpdateLimits) {
        for i in 0..self.sw.len() {
            self.sw[i] += clamp_abs(ds[i], limits.ds_max);
        }
        self.enforce_saturation_closure();
    }

    /// Applies the shared "x" increment, routed per cell by the lagged
    /// status: `sg` for saturated cells, `Rs` for undersaturated oil,
    /// `Rv` for undersaturated gas.
    pub fn apply_x_update(&mut self, dx: &DVector<f64>, limits: &UpdateLimits) {
        for i in 0..dx.len() {
            match self.status[i] {
                PhaseStatus::Saturated => {
                    self.sg[i] += clamp_abs(dx[i], limits.ds_max);
                }
                PhaseStatus::UndersaturatedOil => {
                    let cap = limits.drs_max_rel * self.rs[i].abs();
                    let step = if cap > 0.0 { clamp_abs(dx[i], cap) } else { dx[i] };
                    self.rs[i] = (self.rs[i] + step).max(0.0);
                }
                PhaseStatus::UndersaturatedGas => {
                    let cap = limits.drs_max_rel * self.rv[i].abs();
                    let step = if cap > 0.0 { clamp_abs(dx[i], cap) } else { dx[i] };
                    self.rv[i] = (self.rv[i] + step).max(0.0);
                }
            }
        }
        self.enforce_saturation_closure();
    }

    /// Applies a polymer-concentration increment; concentrations stay
    /// nonnegative.
    pub fn apply_polymer_update(&mut self, dc: &DVector<f64>) {
        for i in 0..self.polymer.len() {
            self.polymer[i] = (self.polymer[i] + dc[i]).max(0.0);
        }
    }

    /// Applies well increments: bhp with its relative cap, rates unlimited.
    ///
    /// Bhp-controlled wells are then pinned to their target exactly; the
    /// control equation made the increment drive bhp there anyway, and the
    /// reassignment removes the leftover rounding.
    pub fn apply_well_updates(
        &mut self,
        dbhp: &DVector<f64>,
        rate_updates: &[(crate::Phase, &DVector<f64>)],
        controls: &[WellControl],
        limits: &UpdateLimits,
    ) {
        for w in 0..self.wells.bhp.len() {
            let cap = limits.dbhp_max_rel * self.wells.bhp[w].abs();
            self.wells.bhp[w] += clamp_abs(dbhp[w], cap);
            if let WellControl::Bhp(target) = controls[w] {
                self.wells.bhp[w] = target;
            }
        }
        for (phase, dq) in rate_updates {
            let rates = match phase {
                crate::Phase::Water => &mut self.wells.water_rate,
                crate::Phase::Oil => &mut self.wells.oil_rate,
                crate::Phase::Gas => &mut self.wells.gas_rate,
            };
            *rates += *dq;
        }
    }

    /// Clamps saturations into [0, 1] and rescales where they oversum.
    ///
    /// After this, `sw + sg <= 1` holds in every cell and the derived oil
    /// saturation is nonnegative, so the three saturations sum to one.
    pub fn enforce_saturation_closure(&mut self) {
        for i in 0..self.sw.len() {
            self.sw[i] = self.sw[i].clamp(0.0, 1.0);
            self.sg[i] = self.sg[i].clamp(0.0, 1.0);
            let total = self.sw[i] + self.sg[i];
            if total > 1.0 {
                self.sw[i] /= total;
                self.sg[i] /= total;
            }
        }
    }
}

fn clamp_abs(x: f64, cap: f64) -> f64 {
    x.clamp(-cap, cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::AnalyticFluid;
    use approx::assert_relative_eq;

    #[test]
    fn test_pressure_limiting() {
        let mut state = SimulationState::two_phase(2, 100.0, 0.3, 0);
        let limits = UpdateLimits::default();
        state.apply_pressure_update(&DVector::from_vec(vec![500.0, -5.0]), &limits);
        // Capped at 20% of 100, uncapped small step.
        assert_relative_eq!(state.pressure[0], 120.0);
        assert_relative_eq!(state.pressure[1], 95.0);
    }

    #[test]
    fn test_saturations_sum_to_one_after_every_update() {
        let mut state = SimulationState::three_phase(3, 200e5, 0.3, 0.2, 0);
        let limits = UpdateLimits::default().with_ds_max(1.0);
        // Deliberately violent updates.
        state.apply_sw_update(&DVector::from_vec(vec![0.9, -0.9, 0.5]), &limits);
        state.apply_x_update(&DVector::from_vec(vec![0.8, 0.8, -0.9]), &limits);
        for i in 0..3 {
            let so = 1.0 - state.sw[i] - state.sg[i];
            assert!(state.sw[i] >= 0.0 && state.sw[i] <= 1.0);
            assert!(state.sg[i] >= 0.0 && state.sg[i] <= 1.0);
            assert!(so >= -1e-12, "cell {i}: so = {so}");
        }
    }

    #[test]
    fn test_x_routing_follows_lagged_status() {
        let mut state = SimulationState::three_phase(3, 200e5, 0.3, 0.2, 0);
        state.status = vec![
            PhaseStatus::Saturated,
            PhaseStatus::UndersaturatedOil,
            PhaseStatus::UndersaturatedGas,
        ];
        state.sg[1] = 0.0;
        state.rs[1] = 10.0;
        state.rv[2] = 1.0e-3;
        let limits = UpdateLimits::default();
        let (sg0, rs0, rv0) = (state.sg[0], state.rs[1], state.rv[2]);
        state.apply_x_update(&DVector::from_vec(vec![0.05, 1.0, 1e-4]), &limits);
        assert_relative_eq!(state.sg[0], sg0 + 0.05);
        assert_relative_eq!(state.rs[1], rs0 + 1.0);
        assert_relative_eq!(state.rv[2], rv0 + 1e-4);
        // Each cell moved only its own slot.
        assert_relative_eq!(state.sg[1], 0.0);
        assert_relative_eq!(state.rs[0], 0.0);
    }

    #[test]
    fn test_refresh_phase_status_pins_saturated_curves() {
        let fluid = AnalyticFluid::default();
        let mut state = SimulationState::three_phase(3, 200e5, 0.3, 0.2, 0);
        state.sg[1] = 0.0;
        state.sw[2] = 0.4;
        state.sg[2] = 0.6;
        state.refresh_phase_status(&fluid, 1e-8);
        assert_eq!(state.status[0], PhaseStatus::Saturated);
        assert_eq!(state.status[1], PhaseStatus::UndersaturatedOil);
        assert_eq!(state.status[2], PhaseStatus::UndersaturatedGas);
        assert_relative_eq!(state.rs[0], fluid.rs_slope * state.pressure[0]);
        // Undersaturated-gas cell fills the pore space with water + gas.
        assert_relative_eq!(state.sw[2] + state.sg[2], 1.0);
    }

    #[test]
    fn test_bhp_controlled_well_pinned_exactly() {
        let mut state = SimulationState::two_phase(1, 200e5, 0.3, 2);
        let limits = UpdateLimits::default();
        let controls = vec![WellControl::Bhp(150e5), WellControl::OilRate(-0.01)];
        let dq = DVector::from_vec(vec![1e-3, -2e-3]);
        state.apply_well_updates(
            &DVector::from_vec(vec![-30e5, 10e5]),
            &[(crate::Phase::Oil, &dq)],
            &controls,
            &limits,
        );
        assert_eq!(state.wells.bhp[0], 150e5);
        // Rate-controlled well keeps its limited bhp update.
        assert_relative_eq!(state.wells.bhp[1], 210e5);
        assert_relative_eq!(state.wells.oil_rate[1], -2e-3);
    }
}
