//! Well model: perforations, controls, and source-term plumbing.
//!
//! Wellbore hydraulics are an external collaborator; what the assembler
//! needs from a well is small and static:
//!
//! - a perforation-to-cell map with per-perforation well indices (the
//!   Peaceman productivity factors, precomputed elsewhere),
//! - a control per well (bhp target or one surface-rate target),
//! - for injectors, the injected surface-volume composition.
//!
//! [`WellSet`] precomputes the sparse scatter/gather matrices between
//! cells, perforations, and wells, and evaluates the perforation source
//! terms: reservoir-volume inflow per phase from well index times upstream
//! mobility times drawdown. The upstream side is chosen per perforation by
//! the drawdown sign, so cross-flowing connections stay well posed: a
//! backflowing producer perforation injects the well's lagged produced
//! mixture, not a phantom fluid.
//!
//! Connection pressure is bhp plus a hydrostatic head computed from a
//! previous-state mixture density; the head is constant within a Newton
//! loop, which keeps wellbore storage out of the unknowns.

use nalgebra::DVector;
use num_dual::Dual64;
use sprs::{CsMat, TriMat};

use crate::autodiff::{AdError, AdVector};
use crate::fluid::FluidProperties;
use crate::state::SimulationState;
use crate::Phase;

/// Errors raised while validating a well set.
#[derive(Debug, thiserror::Error)]
pub enum WellError {
    /// A perforation references a cell outside the grid
    #[error("well '{well}' perforates cell {cell}, but the grid has {n_cells} cells")]
    PerforationOutOfRange { well: String, cell: usize, n_cells: usize },
    /// A well has no perforations
    #[error("well '{well}' has no perforations")]
    NoPerforations { well: String },
    /// Well-index array length differs from the perforation count
    #[error("well '{well}' has {n_wi} well indices for {n_perf} perforations")]
    WellIndexMismatch { well: String, n_wi: usize, n_perf: usize },
    /// Injection composition entries must be nonnegative and sum to one
    #[error("well '{well}' has an invalid injection composition {composition:?}")]
    BadComposition { well: String, composition: [f64; 3] },
}

/// Operating target of a well, one active control at a time.
///
/// Rate targets are surface-volume rates with the reservoir-inflow sign
/// convention: positive injects, negative produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WellControl {
    /// Fixed bottom-hole pressure [Pa]
    Bhp(f64),
    /// Fixed water surface rate [sm3/s]
    WaterRate(f64),
    /// Fixed oil surface rate [sm3/s]
    OilRate(f64),
    /// Fixed gas surface rate [sm3/s]
    GasRate(f64),
    /// Fixed liquid (water + oil) surface rate [sm3/s]
    LiquidRate(f64),
}

/// Static description of one well.
#[derive(Debug, Clone)]
pub struct Well {
    /// Display name used in logs and equation diagnostics
    pub name: String,
    /// Perforated cell indices
    pub cells: Vec<usize>,
    /// Well index (connection transmissibility) per perforation [m^3]
    pub well_index: Vec<f64>,
    /// Datum depth for the bhp [m]
    pub ref_depth: f64,
    /// Active control
    pub control: WellControl,
    /// Injected surface-volume fractions (water, oil, gas); `None` marks
    /// a producer
    pub injection: Option<[f64; 3]>,
}

impl Well {
    /// True when the well injects by design.
    pub fn is_injector(&self) -> bool {
        self.injection.is_some()
    }
}

/// A validated collection of wells over a fixed grid.
#[derive(Debug, Clone)]
pub struct WellSet {
    wells: Vec<Well>,
    n_cells: usize,
    perf_cells: Vec<usize>,
    perf_well: Vec<usize>,
    well_index: DVector<f64>,
    /// n_perf x n_cells gather of cell fields onto perforations
    from_cells: CsMat<f64>,
    /// n_perf x n_wells gather of well fields onto perforations
    from_wells: CsMat<f64>,
    /// n_wells x n_perf summation of perforation contributions per well
    to_wells: CsMat<f64>,
    /// n_cells x n_perf scatter of perforation sources into cells
    to_cells: CsMat<f64>,
}

impl WellSet {
    /// Validates the wells against a grid of `n_cells` cells and builds
    /// the scatter/gather matrices.
    ///
    /// # Errors
    ///
    /// [`WellError`] on out-of-range perforations, empty completions,
    /// mismatched well-index arrays, or bad injection compositions.
    pub fn new(wells: Vec<Well>, n_cells: usize) -> Result<Self, WellError> {
        for w in &wells {
            if w.cells.is_empty() {
                return Err(WellError::NoPerforations { well: w.name.clone() });
            }
            if w.well_index.len() != w.cells.len() {
                return Err(WellError::WellIndexMismatch {
                    well: w.name.clone(),
                    n_wi: w.well_index.len(),
                    n_perf: w.cells.len(),
                });
            }
            for &c in &w.cells {
                if c >= n_cells {
                    return Err(WellError::PerforationOutOfRange {
                        well: w.name.clone(),
                        cell: c,
                        n_cells,
                    });
                }
            }
            if let Some(comp) = w.injection {
                let sum: f64 = comp.iter().sum();
                if comp.iter().any(|&f| f < 0.0) || (sum - 1.0).abs() > 1e-9 {
                    return Err(WellError::BadComposition {
                        well: w.name.clone(),
                        composition: comp,
                    });
                }
            }
        }

        let mut perf_cells = Vec::new();
        let mut perf_well = Vec::new();
        let mut wi = Vec::new();
        for (wix, w) in wells.iter().enumerate() {
            for (&c, &index) in w.cells.iter().zip(w.well_index.iter()) {
                perf_cells.push(c);
                perf_well.push(wix);
                wi.push(index);
            }
        }
        let n_perf = perf_cells.len();
        let n_wells = wells.len();

        let mut from_cells = TriMat::new((n_perf, n_cells));
        let mut from_wells = TriMat::new((n_perf, n_wells));
        let mut to_wells = TriMat::new((n_wells, n_perf));
        let mut to_cells = TriMat::new((n_cells, n_perf));
        for k in 0..n_perf {
            from_cells.add_triplet(k, perf_cells[k], 1.0);
            from_wells.add_triplet(k, perf_well[k], 1.0);
            to_wells.add_triplet(perf_well[k], k, 1.0);
            to_cells.add_triplet(perf_cells[k], k, 1.0);
        }

        Ok(WellSet {
            wells,
            n_cells,
            perf_cells,
            perf_well,
            well_index: DVector::from_vec(wi),
            from_cells: from_cells.to_csr(),
            from_wells: from_wells.to_csr(),
            to_wells: to_wells.to_csr(),
            to_cells: to_cells.to_csr(),
        })
    }

    /// A well set with no wells; valid over any grid.
    pub fn empty() -> Self {
        WellSet {
            wells: Vec::new(),
            n_cells: 0,
            perf_cells: Vec::new(),
            perf_well: Vec::new(),
            well_index: DVector::zeros(0),
            from_cells: CsMat::zero((0, 0)),
            from_wells: CsMat::zero((0, 0)),
            to_wells: CsMat::zero((0, 0)),
            to_cells: CsMat::zero((0, 0)),
        }
    }

    /// True when no wells are present.
    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }

    /// Number of wells.
    pub fn n_wells(&self) -> usize {
        self.wells.len()
    }

    /// Cell count of the grid the wells were validated against.
    pub fn grid_cells(&self) -> usize {
        self.n_cells
    }

    /// Total perforation count.
    pub fn n_perforations(&self) -> usize {
        self.perf_cells.len()
    }

    /// The wells, in declaration order.
    pub fn wells(&self) -> &[Well] {
        &self.wells
    }

    /// Active controls, one per well.
    pub fn controls(&self) -> Vec<WellControl> {
        self.wells.iter().map(|w| w.control).collect()
    }

    /// Perforated cell index per perforation.
    pub fn perforation_cells(&self) -> &[usize] {
        &self.perf_cells
    }

    /// Owning well index per perforation.
    pub fn perforation_to_well(&self) -> &[usize] {
        &self.perf_well
    }

    /// Gathers a per-cell AD field onto the perforations.
    pub fn gather_cells(&self, x: &AdVector) -> Result<AdVector, AdError> {
        crate::autodiff::apply_matrix(&self.from_cells, x)
    }

    /// Expands a per-well AD field onto the perforations.
    pub fn expand_wells(&self, x: &AdVector) -> Result<AdVector, AdError> {
        crate::autodiff::apply_matrix(&self.from_wells, x)
    }

    /// Sums a per-perforation AD field into per-well totals.
    pub fn sum_perforations(&self, x: &AdVector) -> Result<AdVector, AdError> {
        crate::autodiff::apply_matrix(&self.to_wells, x)
    }

    /// Scatters a per-perforation AD field into per-cell totals.
    pub fn scatter_to_cells(&self, x: &AdVector) -> Result<AdVector, AdError> {
        crate::autodiff::apply_matrix(&self.to_cells, x)
    }

    /// Hydrostatic head per perforation from a frozen density estimate:
    /// `rho * g * (z_cell - z_ref)`.
    pub fn hydrostatic_head(
        &self,
        perf_density: &DVector<f64>,
        cell_depth: &DVector<f64>,
        gravity: f64,
    ) -> DVector<f64> {
        DVector::from_iterator(
            self.n_perforations(),
            (0..self.n_perforations()).map(|k| {
                let w = &self.wells[self.perf_well[k]];
                perf_density[k] * gravity * (cell_depth[self.perf_cells[k]] - w.ref_depth)
            }),
        )
    }

    /// Per-perforation mixture density from a previous state.
    ///
    /// Saturation-weighted sum of the phase reservoir densities at the
    /// connected cell, evaluated at the lagged pressure.
    pub fn perforation_mixture_density<F: FluidProperties>(
        &self,
        prev: &SimulationState,
        fluid: &F,
    ) -> DVector<f64> {
        DVector::from_iterator(
            self.n_perforations(),
            self.perf_cells.iter().map(|&c| {
                let p = Dual64::from(prev.pressure[c]);
                let sw = prev.sw[c];
                let sg = prev.sg[c];
                let so = (1.0 - sw - sg).max(0.0);
                let rho = |ph: Phase| {
                    fluid.surface_density(ph) * fluid.recip_fvf(ph, p).re
                };
                sw * rho(Phase::Water) + so * rho(Phase::Oil) + sg * rho(Phase::Gas)
            }),
        )
    }

    /// Injected surface-volume fractions per perforation and phase.
    ///
    /// Injectors use their declared composition. Producers contribute only
    /// under crossflow; their injected mixture is the well's lagged
    /// produced mix (normalized magnitudes of the previous surface rates),
    /// or nothing when the well has not flowed yet.
    pub fn perforation_composition(
        &self,
        prev_wells: &crate::state::WellSolution,
    ) -> [DVector<f64>; 3] {
        let n = self.n_perforations();
        let mut comp = [DVector::zeros(n), DVector::zeros(n), DVector::zeros(n)];
        for k in 0..n {
            let wix = self.perf_well[k];
            let fracs = match self.wells[wix].injection {
                Some(c) => c,
                None => {
                    let q = [
                        prev_wells.water_rate[wix].abs(),
                        prev_wells.oil_rate[wix].abs(),
                        prev_wells.gas_rate[wix].abs(),
                    ];
                    let total: f64 = q.iter().sum();
                    if total > 0.0 {
                        [q[0] / total, q[1] / total, q[2] / total]
                    } else {
                        [0.0; 3]
                    }
                }
            };
            for (slot, &f) in comp.iter_mut().zip(fracs.iter()) {
                slot[k] = f;
            }
        }
        comp
    }

    /// Reservoir-volume inflow per phase and perforation.
    ///
    /// `drawdown = bhp + head - p_cell` per perforation; positive means
    /// flow into the reservoir. Producing perforations carry phase
    /// mobilities of the connected cell; injecting perforations carry the
    /// cell's total mobility split by the injected composition.
    ///
    /// Returns one AD vector per entry of `mobilities`, in the same order.
    pub fn phase_sources(
        &self,
        p_cell: &AdVector,
        bhp: &AdVector,
        head: &DVector<f64>,
        mobilities: &[(Phase, &AdVector)],
        composition: &[DVector<f64>; 3],
    ) -> Result<Vec<(Phase, AdVector)>, AdError> {
        let p_perf = self.gather_cells(p_cell)?;
        let head_ad = AdVector::constant(head.clone(), &p_perf.layout());
        let drawdown = &(&self.expand_wells(bhp)? + &head_ad) - &p_perf;
        let injecting = drawdown.gt_scalar(0.0);

        let mob_perf: Vec<(Phase, AdVector)> = mobilities
            .iter()
            .map(|(ph, m)| Ok((*ph, self.gather_cells(m)?)))
            .collect::<Result<_, AdError>>()?;
        let mut total_mob = mob_perf[0].1.clone();
        for (_, m) in &mob_perf[1..] {
            total_mob = &total_mob + m;
        }

        let wi = AdVector::constant(self.well_index.clone(), &p_perf.layout());
        let wi_dd = &wi * &drawdown;

        mob_perf
            .iter()
            .map(|(ph, mob)| {
                let frac = match ph {
                    Phase::Water => &composition[0],
                    Phase::Oil => &composition[1],
                    Phase::Gas => &composition[2],
                };
                let frac_ad = AdVector::constant(frac.clone(), &p_perf.layout());
                let q_produce = &wi_dd * mob;
                let q_inject = &(&wi_dd * &total_mob) * &frac_ad;
                let q = AdVector::select(&injecting, &q_inject, &q_produce)?;
                Ok((*ph, q))
            })
            .collect()
    }

    /// Control-closure residual, one scalar equation per well.
    ///
    /// Bhp control: `bhp - target`. Rate controls: the corresponding
    /// surface-rate unknown minus the target (liquid = water + oil).
    pub fn control_equations(
        &self,
        bhp: &AdVector,
        qws: &AdVector,
        qos: &AdVector,
        qgs: Option<&AdVector>,
    ) -> Result<AdVector, AdError> {
        let mut rows = Vec::with_capacity(self.n_wells());
        for (w, well) in self.wells.iter().enumerate() {
            let row = match well.control {
                WellControl::Bhp(target) => &bhp.subset(&[w])? - target,
                WellControl::WaterRate(target) => &qws.subset(&[w])? - target,
                WellControl::OilRate(target) => &qos.subset(&[w])? - target,
                WellControl::GasRate(target) => match qgs {
                    Some(qgs) => &qgs.subset(&[w])? - target,
                    None => {
                        return Err(AdError::ShapeMismatch(format!(
                            "well '{}' is gas-rate controlled in a model without gas",
                            well.name
                        )));
                    }
                },
                WellControl::LiquidRate(target) => {
                    &(&qws.subset(&[w])? + &qos.subset(&[w])?) - target
                }
            };
            rows.push(row);
        }
        let refs: Vec<&AdVector> = rows.iter().collect();
        AdVector::concat(&refs)
    }
}
