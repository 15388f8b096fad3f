//! Residual assembly: the [`ReservoirModel`] contract and its data types.
//!
//! A model variant (two-phase, black-oil, polymer) is an assembler: given
//! the previous and current state snapshots, a timestep, and driving
//! forces, it produces a [`LinearizedProblem`], the bundle of named
//! residual equations plus the primary-variable ordering the Newton driver
//! needs to solve and to route increments back through
//! [`ReservoirModel::update_state`].
//!
//! Assembly is fully vectorized: every equation is built by bulk AD
//! operations over all cells or faces at once. The shared discretization
//! pieces (gravity-corrected potential differences, single-point upstream
//! fluxes, accumulation terms, degenerate-row stabilization) live here so
//! the variants differ only in their physics.

pub mod blackoil;
pub mod oilwater;
pub mod polymer;

use nalgebra::DVector;
use sprs::CsMat;

use crate::autodiff::{AdError, AdVector};
use crate::operators::DiscreteOperators;
use crate::state::SimulationState;
use crate::{DrivingForces, Phase};

/// Errors that make an assembly structurally impossible.
///
/// These are programming or configuration errors, not convergence
/// trouble; the driver treats them as fatal for the step.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// A primary variable was requested under a name the assembler never
    /// declared
    #[error("unknown primary variable '{0}'")]
    UnknownVariable(String),
    /// Array sizes disagree with the grid or well set
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// An AD operation failed; always indicates inconsistent assembly
    #[error(transparent)]
    Ad(#[from] AdError),
}

/// The implemented model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Two-phase water/oil
    OilWater,
    /// Three-phase black-oil with dissolved gas and vaporized oil
    BlackOil,
    /// Two-phase water/oil with a water-borne polymer tracer
    Polymer,
}

/// Role of a residual equation in the coupled system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    /// Per-cell component conservation
    CellConservation,
    /// Per-well surface-rate closure
    WellFlux,
    /// Per-well control closure
    WellControl,
}

/// One named residual equation of the assembled system.
#[derive(Debug, Clone)]
pub struct ResidualEquation {
    /// Diagnostic name, e.g. `"water"` or `"well_control"`
    pub name: String,
    /// Structural role
    pub kind: EquationKind,
    /// Conserved phase, where one applies
    pub phase: Option<Phase>,
    /// Residual value with its Jacobian blocks
    pub value: AdVector,
}

/// Scaling data the CNV/MB convergence criterion needs.
#[derive(Debug, Clone)]
pub struct ConvergenceAux {
    /// Effective pore volume per cell [m^3]
    pub pore_volume: DVector<f64>,
    /// Field-average formation-volume factor per phase [-]
    pub avg_fvf: Vec<(Phase, f64)>,
}

/// The ordered set of seeded (or residual-only) primary variables.
///
/// Declaration order is the contract between the assembler, the stacked
/// linear system, and `update_state`.
#[derive(Debug, Clone)]
pub struct PrimaryVariables {
    entries: Vec<(String, AdVector)>,
}

impl PrimaryVariables {
    /// Seeds the named fields as independent AD groups, or wraps them as
    /// derivative-free constants when `res_only` is set.
    pub fn seed(fields: Vec<(&str, DVector<f64>)>, res_only: bool) -> Self {
        let names: Vec<String> = fields.iter().map(|(n, _)| n.to_string()).collect();
        let values: Vec<AdVector> = if res_only {
            let layout = crate::autodiff::BlockLayout::empty();
            fields
                .into_iter()
                .map(|(_, v)| AdVector::constant(v, &layout))
                .collect()
        } else {
            AdVector::seed_groups(fields.into_iter().map(|(_, v)| v).collect())
        };
        PrimaryVariables { entries: names.into_iter().zip(values).collect() }
    }

    /// Looks a variable up by name.
    pub fn get(&self, name: &str) -> Result<&AdVector, AssemblyError> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| AssemblyError::UnknownVariable(name.to_string()))
    }

    /// Declared names, in order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Unknown counts per variable, in order.
    pub fn group_sizes(&self) -> Vec<usize> {
        self.entries.iter().map(|(_, v)| v.len()).collect()
    }
}

/// One assembled, linearized nonlinear system: consumed by a single
/// solve-and-update, then rebuilt from scratch.
#[derive(Debug, Clone)]
pub struct LinearizedProblem {
    /// Residual equations in assembly order
    pub equations: Vec<ResidualEquation>,
    /// Primary-variable names in seeding order
    pub variable_names: Vec<String>,
    /// Unknown counts per variable, in the same order
    pub group_sizes: Vec<usize>,
    /// Timestep this system was assembled for [s]
    pub dt: f64,
    /// Scaling data for CNV/MB checks, when the model provides it
    pub aux: Option<ConvergenceAux>,
}

impl LinearizedProblem {
    /// Total number of unknowns.
    pub fn n_unknowns(&self) -> usize {
        self.group_sizes.iter().sum()
    }

    /// Total number of residual rows.
    pub fn n_rows(&self) -> usize {
        self.equations.iter().map(|e| e.value.len()).sum()
    }

    /// Stacks all residual values into one vector, equation order.
    pub fn residual_vector(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_rows(),
            self.equations.iter().flat_map(|e| e.value.values().iter().copied()),
        )
    }

    /// Infinity norm per equation, for logging and simple convergence.
    pub fn residual_norms(&self) -> Vec<(String, f64)> {
        self.equations
            .iter()
            .map(|e| (e.name.clone(), e.value.inf_norm()))
            .collect()
    }

    /// Assembles the full sparse Jacobian: per-equation blocks stacked
    /// horizontally, equations stacked vertically.
    ///
    /// # Errors
    ///
    /// [`AdError::NoJacobian`] (as [`AssemblyError::Ad`]) for
    /// residual-only problems.
    pub fn jacobian(&self) -> Result<CsMat<f64>, AssemblyError> {
        let rows: Vec<CsMat<f64>> = self
            .equations
            .iter()
            .map(|e| e.value.full_jacobian())
            .collect::<Result<_, AdError>>()?;
        let views: Vec<_> = rows.iter().map(|m| m.view()).collect();
        Ok(sprs::vstack(&views))
    }

    /// Splits a stacked Newton increment back into named per-variable
    /// pieces, honoring the seeding order.
    ///
    /// # Errors
    ///
    /// [`AssemblyError::DimensionMismatch`] when the increment length
    /// disagrees with the unknown count.
    pub fn split_increments(&self, dx: &DVector<f64>) -> Result<Increments, AssemblyError> {
        if dx.len() != self.n_unknowns() {
            return Err(AssemblyError::DimensionMismatch(format!(
                "increment of length {} for {} unknowns",
                dx.len(),
                self.n_unknowns()
            )));
        }
        let mut entries = Vec::with_capacity(self.variable_names.len());
        let mut offset = 0;
        for (name, &size) in self.variable_names.iter().zip(self.group_sizes.iter()) {
            entries.push((name.clone(), dx.rows(offset, size).clone_owned()));
            offset += size;
        }
        Ok(Increments { entries })
    }
}

/// Newton increments split per primary variable.
#[derive(Debug, Clone)]
pub struct Increments {
    entries: Vec<(String, DVector<f64>)>,
}

impl Increments {
    /// Looks an increment up by variable name.
    pub fn get(&self, name: &str) -> Result<&DVector<f64>, AssemblyError> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| AssemblyError::UnknownVariable(name.to_string()))
    }
}

/// Per-assembly switches passed down from the driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyOptions {
    /// Skip derivative tracking; the result carries residual values only
    pub res_only: bool,
    /// Newton iteration number, for logging
    pub iteration: usize,
}

/// A residual assembler for one physics variant.
pub trait ReservoirModel {
    /// Which variant this is.
    fn kind(&self) -> ModelKind;

    /// Cell count of the underlying grid.
    fn n_cells(&self) -> usize;

    /// Once-per-timestep preparation on the initial iterate, before any
    /// assembly. The black-oil model refreshes the lagged phase status
    /// here; other variants need nothing.
    fn prepare_step(&self, _state: &mut SimulationState) {}

    /// Builds the linearized system at the current iterate.
    fn assemble(
        &self,
        prev: &SimulationState,
        current: &mut SimulationState,
        dt: f64,
        forces: &DrivingForces,
        options: &AssemblyOptions,
    ) -> Result<LinearizedProblem, AssemblyError>;

    /// Applies split increments to the state, with limiting and routing.
    fn update_state(
        &self,
        state: &mut SimulationState,
        increments: &Increments,
    ) -> Result<(), AssemblyError>;

    /// True for models whose step function is linear in the unknowns; the
    /// driver then solves once and skips the Newton loop.
    fn is_linear(&self) -> bool {
        false
    }
}

/// Gravity-corrected phase potential difference per face:
/// `grad(p_phase) - g * avg(rho_phase) * grad(z)`.
pub(crate) fn phase_potential_diff(
    ops: &DiscreteOperators,
    p_phase: &AdVector,
    rho_cell: &AdVector,
    gravity: f64,
) -> Result<AdVector, AdError> {
    let dp = ops.grad(p_phase)?;
    if gravity == 0.0 {
        return Ok(dp);
    }
    let rho_face = ops.face_avg(rho_cell)?;
    let g_dz = AdVector::constant(ops.depth_gradient() * gravity, &dp.layout());
    Ok(&dp - &(&rho_face * &g_dz))
}

/// Single-point upstream Darcy flux per face:
/// `-T * mob_upstream * dpot`, with the upstream cell chosen by the sign
/// of the potential difference. Returns the flux and the upstream mask.
pub(crate) fn upstream_flux(
    ops: &DiscreteOperators,
    dpot: &AdVector,
    mobility: &AdVector,
) -> Result<(AdVector, Vec<bool>), AdError> {
    // dpot = pot[c2] - pot[c1]; flow goes c1 -> c2 when dpot <= 0.
    let toward_second = dpot.le_scalar(0.0);
    let mob_face = ops.upstream(&toward_second, mobility)?;
    let neg_trans =
        AdVector::constant(-ops.transmissibility(), &dpot.layout());
    Ok((&(&mob_face * dpot) * &neg_trans, toward_second))
}

/// Accumulation term `(pv / dt) * (quantity - quantity_prev)`.
pub(crate) fn accumulation(
    pv_eff: &AdVector,
    quantity: &AdVector,
    quantity_prev: &DVector<f64>,
    dt: f64,
) -> Result<AdVector, AdError> {
    let prev = AdVector::constant(quantity_prev.clone(), &quantity.layout());
    let delta = quantity.try_sub(&prev)?;
    Ok(&(pv_eff.try_mul(&delta)?) * (1.0 / dt))
}

/// Replaces the rows flagged `absent` with the trivial equation
/// `x - x_current = 0`.
///
/// An absent phase makes its conservation row identically zero together
/// with its Jacobian column, which would leave the linear system singular.
/// The substituted row has value zero and a unit diagonal in the frozen
/// variable's block, so Newton leaves that unknown alone.
pub(crate) fn stabilize_degenerate_rows(
    equation: &AdVector,
    frozen: &AdVector,
    absent: &[bool],
) -> Result<AdVector, AdError> {
    if !absent.iter().any(|&a| a) {
        return Ok(equation.clone());
    }
    let pinned = AdVector::constant(frozen.values().clone(), &frozen.layout());
    let trivial = frozen.try_sub(&pinned)?;
    AdVector::select(absent, &trivial, equation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_primary_variables_lookup() {
        let vars = PrimaryVariables::seed(
            vec![
                ("pressure", DVector::from_vec(vec![1.0, 2.0])),
                ("sw", DVector::from_vec(vec![0.3, 0.4])),
            ],
            false,
        );
        assert_eq!(vars.names(), vec!["pressure", "sw"]);
        assert_eq!(vars.group_sizes(), vec![2, 2]);
        assert_eq!(vars.get("sw").unwrap().values()[1], 0.4);
        assert!(matches!(
            vars.get("sx"),
            Err(AssemblyError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_res_only_seeding_carries_no_jacobian() {
        let vars = PrimaryVariables::seed(
            vec![("pressure", DVector::from_vec(vec![1.0, 2.0]))],
            true,
        );
        assert!(vars.get("pressure").unwrap().is_residual_only());
    }

    #[test]
    fn test_split_increments() {
        let vars = PrimaryVariables::seed(
            vec![
                ("pressure", DVector::from_vec(vec![1.0, 2.0])),
                ("bhp", DVector::from_vec(vec![5.0])),
            ],
            false,
        );
        let problem = LinearizedProblem {
            equations: Vec::new(),
            variable_names: vars.names(),
            group_sizes: vars.group_sizes(),
            dt: 1.0,
            aux: None,
        };
        let inc = problem
            .split_increments(&DVector::from_vec(vec![0.1, 0.2, 0.9]))
            .unwrap();
        assert_eq!(inc.get("pressure").unwrap().as_slice(), &[0.1, 0.2]);
        assert_eq!(inc.get("bhp").unwrap().as_slice(), &[0.9]);
        assert!(problem.split_increments(&DVector::zeros(2)).is_err());
    }

    #[test]
    fn test_stabilize_degenerate_rows() {
        let seeded = AdVector::seed_groups(vec![
            DVector::from_vec(vec![0.5, 0.0]), // the frozen variable
        ]);
        let x = &seeded[0];
        let equation = x.scale(3.0).shift(1.0);
        let fixed = stabilize_degenerate_rows(&equation, x, &[false, true]).unwrap();
        // Live row untouched, degenerate row zeroed with unit diagonal.
        assert_relative_eq!(fixed.values()[0], 2.5);
        assert_relative_eq!(fixed.values()[1], 0.0);
        let j = fixed.full_jacobian().unwrap().to_dense();
        assert_relative_eq!(j[[0, 0]], 3.0);
        assert_relative_eq!(j[[1, 1]], 1.0);
        assert_relative_eq!(j[[1, 0]], 0.0);
    }

    #[test]
    fn test_upstream_flux_direction() {
        let ops = DiscreteOperators::cartesian_1d(2, 2.0, 1.0).unwrap();
        let vars = AdVector::seed_groups(vec![DVector::from_vec(vec![10.0, 4.0])]);
        let mob = AdVector::constant(DVector::from_vec(vec![7.0, 3.0]), &vars[0].layout());
        let dpot = ops.grad(&vars[0]).unwrap();
        let (flux, mask) = upstream_flux(&ops, &dpot, &mob).unwrap();
        // Pressure falls from cell 0 to cell 1: upstream is cell 0.
        assert_eq!(mask, vec![true]);
        assert_relative_eq!(flux.values()[0], -2.0 * 7.0 * -6.0);
    }
}
