//! Discrete grid operators for the two-point flux discretization.
//!
//! Grid geometry processing is an external collaborator: this module never
//! computes cell volumes or face areas. It consumes a finished
//! [`GridTopology`] (interior face cell pairs, face transmissibilities, cell
//! pore volumes, cell depths) and exposes the discrete operators the
//! assemblers need as sparse-matrix actions on AD values:
//!
//! - `grad`: cell field to face differences, `(grad x)_f = x[c2] - x[c1]`,
//! - `div`: face fluxes to per-cell net outflow (negative adjoint of grad),
//! - `face_avg`: arithmetic two-point average onto faces,
//! - `upstream`: single-point upstream selection driven by a flow-direction
//!   mask.
//!
//! [`DiscreteOperators::cartesian_1d`] builds a small uniform line grid so
//! tests and demos need no external geometry at all.

use nalgebra::DVector;
use sprs::{CsMat, TriMat};

use crate::autodiff::{self, AdError, AdVector};

/// Errors raised while validating grid topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Grid must contain at least one cell
    #[error("grid has no cells")]
    EmptyGrid,
    /// A face references a cell outside the grid
    #[error("face {face} references cell {cell}, but the grid has {n_cells} cells")]
    CellOutOfRange { face: usize, cell: usize, n_cells: usize },
    /// A per-face or per-cell array has the wrong length
    #[error("{name} has length {got}, expected {expected}")]
    LengthMismatch { name: &'static str, got: usize, expected: usize },
    /// A face connects a cell to itself
    #[error("face {face} connects cell {cell} to itself")]
    DegenerateFace { face: usize, cell: usize },
}

/// Connectivity and static coefficients of a finite-volume grid.
///
/// Faces are interior only; boundary fluxes are out of scope. Face `f`
/// connects `faces[f].0` (the "first" cell, c1) to `faces[f].1` (c2).
#[derive(Debug, Clone)]
pub struct GridTopology {
    /// Number of cells
    pub n_cells: usize,
    /// Interior faces as (c1, c2) cell pairs
    pub faces: Vec<(usize, usize)>,
    /// Face transmissibility [m^3]
    pub transmissibility: DVector<f64>,
    /// Cell pore volume [m^3]
    pub pore_volume: DVector<f64>,
    /// Cell depth, increasing downwards [m]
    pub depth: DVector<f64>,
}

/// Precomputed sparse operators over a fixed topology.
///
/// All matrices are built once at construction; only the upstream selection
/// depends on the (per-iteration) flow direction and is assembled per call.
#[derive(Debug, Clone)]
pub struct DiscreteOperators {
    topo: GridTopology,
    grad: CsMat<f64>,
    div: CsMat<f64>,
    face_avg: CsMat<f64>,
    /// grad applied to the depth field, constant for the life of the grid
    depth_gradient: DVector<f64>,
}

impl DiscreteOperators {
    /// Validates a topology and precomputes its operator matrices.
    ///
    /// # Errors
    ///
    /// [`TopologyError`] on an empty grid, out-of-range or self-connecting
    /// faces, or mismatched array lengths.
    pub fn new(topo: GridTopology) -> Result<Self, TopologyError> {
        let n = topo.n_cells;
        let nf = topo.faces.len();
        if n == 0 {
            return Err(TopologyError::EmptyGrid);
        }
        for (f, &(c1, c2)) in topo.faces.iter().enumerate() {
            for cell in [c1, c2] {
                if cell >= n {
                    return Err(TopologyError::CellOutOfRange { face: f, cell, n_cells: n });
                }
            }
            if c1 == c2 {
                return Err(TopologyError::DegenerateFace { face: f, cell: c1 });
            }
        }
        check_len("transmissibility", topo.transmissibility.len(), nf)?;
        check_len("pore_volume", topo.pore_volume.len(), n)?;
        check_len("depth", topo.depth.len(), n)?;

        let mut grad = TriMat::new((nf, n));
        let mut div = TriMat::new((n, nf));
        let mut avg = TriMat::new((nf, n));
        for (f, &(c1, c2)) in topo.faces.iter().enumerate() {
            grad.add_triplet(f, c1, -1.0);
            grad.add_triplet(f, c2, 1.0);
            // Positive face flux flows c1 -> c2: outflow at c1, inflow at c2.
            div.add_triplet(c1, f, 1.0);
            div.add_triplet(c2, f, -1.0);
            avg.add_triplet(f, c1, 0.5);
            avg.add_triplet(f, c2, 0.5);
        }
        let grad = grad.to_csr();
        let depth_gradient = DVector::from_iterator(
            nf,
            topo.faces.iter().map(|&(c1, c2)| topo.depth[c2] - topo.depth[c1]),
        );
        Ok(DiscreteOperators {
            topo,
            grad,
            div: div.to_csr(),
            face_avg: avg.to_csr(),
            depth_gradient,
        })
    }

    /// Uniform 1D line grid of `n` cells with `n - 1` interior faces.
    ///
    /// All faces share one transmissibility, all cells one pore volume, and
    /// the grid is horizontal (zero depth everywhere).
    ///
    /// # Errors
    ///
    /// [`TopologyError::EmptyGrid`] when `n == 0`.
    pub fn cartesian_1d(n: usize, transmissibility: f64, pore_volume: f64) -> Result<Self, TopologyError> {
        let faces: Vec<(usize, usize)> = (0..n.saturating_sub(1)).map(|i| (i, i + 1)).collect();
        let nf = faces.len();
        Self::new(GridTopology {
            n_cells: n,
            faces,
            transmissibility: DVector::from_element(nf, transmissibility),
            pore_volume: DVector::from_element(n, pore_volume),
            depth: DVector::zeros(n),
        })
    }

    /// Number of cells.
    pub fn n_cells(&self) -> usize {
        self.topo.n_cells
    }

    /// Number of interior faces.
    pub fn n_faces(&self) -> usize {
        self.topo.faces.len()
    }

    /// Face cell pairs.
    pub fn faces(&self) -> &[(usize, usize)] {
        &self.topo.faces
    }

    /// Face transmissibilities.
    pub fn transmissibility(&self) -> &DVector<f64> {
        &self.topo.transmissibility
    }

    /// Cell pore volumes.
    pub fn pore_volume(&self) -> &DVector<f64> {
        &self.topo.pore_volume
    }

    /// Cell depths.
    pub fn depth(&self) -> &DVector<f64> {
        &self.topo.depth
    }

    /// Depth difference across each face, `z[c2] - z[c1]`.
    pub fn depth_gradient(&self) -> &DVector<f64> {
        &self.depth_gradient
    }

    /// Two-point difference of a cell field onto faces.
    pub fn grad(&self, x: &AdVector) -> Result<AdVector, AdError> {
        autodiff::apply_matrix(&self.grad, x)
    }

    /// Net outflow per cell of a face flux field.
    pub fn div(&self, flux: &AdVector) -> Result<AdVector, AdError> {
        autodiff::apply_matrix(&self.div, flux)
    }

    /// Arithmetic average of a cell field onto faces.
    pub fn face_avg(&self, x: &AdVector) -> Result<AdVector, AdError> {
        autodiff::apply_matrix(&self.face_avg, x)
    }

    /// Single-point upstream selection of a cell field onto faces.
    ///
    /// `toward_second[f]` true means flow goes c1 -> c2 across face `f`, so
    /// the upstream cell is c1; false selects c2. Both the value and its
    /// derivatives come from the selected cell only.
    pub fn upstream(&self, toward_second: &[bool], x: &AdVector) -> Result<AdVector, AdError> {
        let nf = self.n_faces();
        if toward_second.len() != nf {
            return Err(AdError::ShapeMismatch(format!(
                "upstream mask of length {} over {} faces",
                toward_second.len(),
                nf
            )));
        }
        let mut sel = TriMat::new((nf, self.n_cells()));
        for (f, (&(c1, c2), &up)) in self.topo.faces.iter().zip(toward_second.iter()).enumerate() {
            sel.add_triplet(f, if up { c1 } else { c2 }, 1.0);
        }
        autodiff::apply_matrix(&sel.to_csr(), x)
    }
}

fn check_len(name: &'static str, got: usize, expected: usize) -> Result<(), TopologyError> {
    if got != expected {
        return Err(TopologyError::LengthMismatch { name, got, expected });
    }
    Ok(())
}
