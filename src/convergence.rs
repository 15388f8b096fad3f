//! Convergence criteria for the Newton loop.
//!
//! Two interchangeable strategies:
//!
//! - [`ConvergenceCriterion::ResidualNorm`]: the residual infinity norm of
//!   every equation must fall below one tolerance. Simple and strict, but
//!   scale-sensitive on heterogeneous grids.
//! - [`ConvergenceCriterion::CnvMb`]: the black-oil standard. Per present
//!   phase,
//!
//!   ```text
//!   CNV = dt * B * max_c( |R_c| / pv_c )      (local saturation error)
//!   MB  = dt * B * |sum_c R_c| / sum_c pv_c   (global mass-balance error)
//!   ```
//!
//!   with `B` the field-average formation-volume factor converting surface
//!   volumes back to pore-volume fractions. CNV bounds the worst cell, MB
//!   the field total; both must pass for every phase. Equations without a
//!   per-cell structure (well closures) fall back to the infinity norm.

use crate::models::{EquationKind, LinearizedProblem};

/// Strategy deciding when the Newton loop is done.
#[derive(Debug, Clone, Copy)]
pub enum ConvergenceCriterion {
    /// Per-equation residual infinity norm below `tolerance`
    ResidualNorm {
        /// Absolute tolerance on every equation's infinity norm
        tolerance: f64,
    },
    /// Black-oil CNV/MB metrics
    CnvMb {
        /// Tolerance on the per-cell (CNV) metric and on non-cell
        /// equations' infinity norms
        cnv_tolerance: f64,
        /// Tolerance on the material-balance (MB) metric
        mb_tolerance: f64,
    },
}

impl Default for ConvergenceCriterion {
    fn default() -> Self {
        ConvergenceCriterion::CnvMb { cnv_tolerance: 1e-3, mb_tolerance: 1e-7 }
    }
}

/// One evaluated convergence measure.
#[derive(Debug, Clone)]
pub struct ConvergenceEntry {
    /// Measure name, e.g. `"cnv_water"` or `"well_control"`
    pub name: String,
    /// Evaluated value
    pub value: f64,
    /// Tolerance it was checked against
    pub tolerance: f64,
    /// Whether the measure passed
    pub ok: bool,
}

/// All measures of one convergence check.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceReport {
    /// Individual measures, in evaluation order
    pub entries: Vec<ConvergenceEntry>,
}

impl ConvergenceReport {
    /// True when every measure passed.
    pub fn converged(&self) -> bool {
        self.entries.iter().all(|e| e.ok)
    }

    /// The largest value-to-tolerance ratio, for logging.
    pub fn worst_ratio(&self) -> f64 {
        self.entries
            .iter()
            .map(|e| e.value / e.tolerance)
            .fold(0.0_f64, f64::max)
    }

    fn push(&mut self, name: String, value: f64, tolerance: f64) {
        self.entries.push(ConvergenceEntry { name, value, tolerance, ok: value < tolerance });
    }
}

impl ConvergenceCriterion {
    /// Evaluates the criterion against an assembled problem.
    pub fn evaluate(&self, problem: &LinearizedProblem) -> ConvergenceReport {
        let mut report = ConvergenceReport::default();
        match *self {
            ConvergenceCriterion::ResidualNorm { tolerance } => {
                for eq in &problem.equations {
                    report.push(eq.name.clone(), eq.value.inf_norm(), tolerance);
                }
            }
            ConvergenceCriterion::CnvMb { cnv_tolerance, mb_tolerance } => {
                for eq in &problem.equations {
                    let cell_scaled = eq.kind == EquationKind::CellConservation;
                    let phase_fvf = problem.aux.as_ref().and_then(|aux| {
                        eq.phase.and_then(|ph| {
                            aux.avg_fvf
                                .iter()
                                .find(|(p, _)| *p == ph)
                                .map(|&(_, b)| (b, &aux.pore_volume))
                        })
                    });
                    match (cell_scaled, phase_fvf) {
                        (true, Some((b_avg, pv))) => {
                            let r = eq.value.values();
                            let cnv = r
                                .iter()
                                .zip(pv.iter())
                                .map(|(&ri, &pvi)| ri.abs() / pvi)
                                .fold(0.0_f64, f64::max)
                                * problem.dt
                                * b_avg;
                            let mb = problem.dt * b_avg * r.sum().abs() / pv.sum();
                            report.push(format!("cnv_{}", eq.name), cnv, cnv_tolerance);
                            report.push(format!("mb_{}", eq.name), mb, mb_tolerance);
                        }
                        _ => {
                            report.push(eq.name.clone(), eq.value.inf_norm(), cnv_tolerance);
                        }
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{AdVector, BlockLayout};
    use crate::models::{ConvergenceAux, EquationKind, ResidualEquation};
    use crate::Phase;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn cell_equation(name: &str, phase: Phase, values: Vec<f64>) -> ResidualEquation {
        ResidualEquation {
            name: name.to_string(),
            kind: EquationKind::CellConservation,
            phase: Some(phase),
            value: AdVector::constant(DVector::from_vec(values), &BlockLayout::empty()),
        }
    }

    fn problem(equations: Vec<ResidualEquation>, aux: Option<ConvergenceAux>) -> LinearizedProblem {
        LinearizedProblem {
            equations,
            variable_names: Vec::new(),
            group_sizes: Vec::new(),
            dt: 100.0,
            aux,
        }
    }

    #[test]
    fn test_residual_norm_criterion() {
        let p = problem(
            vec![
                cell_equation("water", Phase::Water, vec![1e-8, -2e-8]),
                cell_equation("oil", Phase::Oil, vec![5e-5, 0.0]),
            ],
            None,
        );
        let strict = ConvergenceCriterion::ResidualNorm { tolerance: 1e-6 };
        let report = strict.evaluate(&p);
        assert!(!report.converged());
        assert!(report.entries[0].ok);
        assert!(!report.entries[1].ok);
        assert_relative_eq!(report.entries[1].value, 5e-5);

        let loose = ConvergenceCriterion::ResidualNorm { tolerance: 1e-3 };
        assert!(loose.evaluate(&p).converged());
    }

    #[test]
    fn test_cnv_mb_values() {
        let aux = ConvergenceAux {
            pore_volume: DVector::from_vec(vec![10.0, 20.0]),
            avg_fvf: vec![(Phase::Water, 1.5)],
        };
        let p = problem(
            vec![cell_equation("water", Phase::Water, vec![2e-4, -1e-4])],
            Some(aux),
        );
        let crit = ConvergenceCriterion::CnvMb { cnv_tolerance: 1e-3, mb_tolerance: 1e-7 };
        let report = crit.evaluate(&p);
        // CNV = dt * B * max(|R|/pv) = 100 * 1.5 * 2e-5 = 3e-3.
        assert_relative_eq!(report.entries[0].value, 3e-3);
        // MB = dt * B * |sum R| / sum pv = 100 * 1.5 * 1e-4 / 30.
        assert_relative_eq!(report.entries[1].value, 5e-4);
        assert!(!report.converged());
    }

    #[test]
    fn test_cnv_mb_falls_back_to_inf_norm_for_well_equations() {
        let well_eq = ResidualEquation {
            name: "well_control".to_string(),
            kind: EquationKind::WellControl,
            phase: None,
            value: AdVector::constant(DVector::from_vec(vec![2e-4]), &BlockLayout::empty()),
        };
        let p = problem(vec![well_eq], None);
        let crit = ConvergenceCriterion::CnvMb { cnv_tolerance: 1e-3, mb_tolerance: 1e-7 };
        let report = crit.evaluate(&p);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].name, "well_control");
        assert!(report.entries[0].ok);
    }

    #[test]
    fn test_worst_ratio() {
        let p = problem(
            vec![cell_equation("water", Phase::Water, vec![5e-4])],
            None,
        );
        let crit = ConvergenceCriterion::ResidualNorm { tolerance: 1e-3 };
        let report = crit.evaluate(&p);
        assert_relative_eq!(report.worst_ratio(), 0.5);
    }
}
