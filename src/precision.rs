use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Inverse;
use sprs::{CsMat, TriMat};

/// Sparse symmetric precision matrix over a block's unique variants.
///
/// The inverse is the block's LD correlation matrix (unit diagonal by the
/// LDGM convention). Stored in CSR; only structurally nonzero entries are
/// kept.
#[derive(Debug, Clone)]
pub struct PrecisionMatrix {
    mat: CsMat<f64>,
}

impl PrecisionMatrix {
    /// Build from upper-triangle triplets `(row, col, value)` with
    /// `row <= col`; the lower triangle is mirrored. Duplicate entries are
    /// summed.
    pub fn from_triplets(dim: usize, entries: &[(usize, usize, f64)]) -> Result<Self> {
        let mut tri = TriMat::new((dim, dim));
        for &(row, col, val) in entries {
            if row >= dim || col >= dim {
                return Err(anyhow!(
                    "precision entry ({row}, {col}) out of range for dimension {dim}"
                ));
            }
            if row > col {
                return Err(anyhow!(
                    "precision entries must satisfy row <= col; got ({row}, {col})"
                ));
            }
            tri.add_triplet(row, col, val);
            if row != col {
                tri.add_triplet(col, row, val);
            }
        }
        Ok(Self { mat: tri.to_csr() })
    }

    pub fn identity(dim: usize) -> Self {
        let mut tri = TriMat::new((dim, dim));
        for i in 0..dim {
            tri.add_triplet(i, i, 1.0);
        }
        Self { mat: tri.to_csr() }
    }

    /// Dense matrix converted back to sparse, dropping entries below
    /// `drop_tol` in magnitude.
    pub fn from_dense(dense: &Array2<f64>, drop_tol: f64) -> Self {
        let (n, _) = dense.dim();
        let mut tri = TriMat::new((n, n));
        for i in 0..n {
            for j in 0..n {
                let v = dense[(i, j)];
                if v.abs() > drop_tol {
                    tri.add_triplet(i, j, v);
                }
            }
        }
        Self { mat: tri.to_csr() }
    }

    pub fn dim(&self) -> usize {
        self.mat.rows()
    }

    pub fn nnz(&self) -> usize {
        self.mat.nnz()
    }

    pub fn matvec(&self, x: &ArrayView1<f64>) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.dim());
        for (val, (row, col)) in self.mat.iter() {
            out[row] += val * x[col];
        }
        out
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let n = self.dim();
        let mut out = Array2::<f64>::zeros((n, n));
        for (val, (row, col)) in self.mat.iter() {
            out[(row, col)] += val;
        }
        out
    }

    pub fn diag(&self) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.dim());
        for (val, (row, col)) in self.mat.iter() {
            if row == col {
                out[row] += val;
            }
        }
        out
    }

    /// Iterate structural nonzeros as `(row, col, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.mat.iter().map(|(val, (row, col))| (row, col, *val))
    }

    /// `scale * P + diag(d)` as a new sparse matrix with the same pattern
    /// plus the diagonal.
    pub fn scaled_plus_diag(&self, scale: f64, diag: &ArrayView1<f64>) -> PrecisionMatrix {
        let n = self.dim();
        let mut tri = TriMat::new((n, n));
        for (val, (row, col)) in self.mat.iter() {
            tri.add_triplet(row, col, val * scale);
        }
        for i in 0..n {
            tri.add_triplet(i, i, diag[i]);
        }
        PrecisionMatrix { mat: tri.to_csr() }
    }

    /// Restrict the precision matrix to `keep` (strictly increasing row
    /// indices) so that its inverse is the corresponding principal submatrix
    /// of the implied correlation matrix. This is the Schur complement
    /// `P_SS - P_ST P_TT^-1 P_TS`; when nothing is dropped it reduces to a
    /// plain subset.
    pub fn restrict(&self, keep: &[usize]) -> Result<Self> {
        let n = self.dim();
        for window in keep.windows(2) {
            if window[0] >= window[1] {
                return Err(anyhow!("restriction indices must be strictly increasing"));
            }
        }
        if let Some(&last) = keep.last() {
            if last >= n {
                return Err(anyhow!("restriction index {last} out of range for {n}"));
            }
        }
        if keep.len() == n {
            return Ok(self.clone());
        }

        let mut in_keep = vec![false; n];
        for &k in keep {
            in_keep[k] = true;
        }
        let dropped: Vec<usize> = (0..n).filter(|i| !in_keep[*i]).collect();

        let dense = self.to_dense();
        let p_ss = take_submatrix(&dense, keep, keep);
        let p_st = take_submatrix(&dense, keep, &dropped);
        let p_tt = take_submatrix(&dense, &dropped, &dropped);
        let p_tt_inv = p_tt.inv()?;
        let schur = &p_ss - &p_st.dot(&p_tt_inv).dot(&p_st.t());
        Ok(Self::from_dense(&schur, 1e-12))
    }

    /// Conjugate-gradient solve of `P x = b` for a positive-definite matrix.
    pub fn cg_solve(&self, b: &ArrayView1<f64>, tol: f64, max_iter: usize) -> Result<Array1<f64>> {
        let n = self.dim();
        if b.len() != n {
            return Err(anyhow!("rhs length {} does not match {n}", b.len()));
        }
        let mut x = Array1::<f64>::zeros(n);
        let mut r = b.to_owned();
        let mut p = r.clone();
        let mut rs_old = r.dot(&r);
        let b_norm = rs_old.sqrt();
        if b_norm == 0.0 {
            return Ok(x);
        }
        for _ in 0..max_iter {
            let ap = self.matvec(&p.view());
            let denom = p.dot(&ap);
            if !denom.is_finite() || denom.abs() < f64::MIN_POSITIVE {
                return Err(anyhow!("conjugate gradient breakdown"));
            }
            let alpha = rs_old / denom;
            x.scaled_add(alpha, &p);
            r.scaled_add(-alpha, &ap);
            let rs_new = r.dot(&r);
            if rs_new.sqrt() <= tol * b_norm {
                return Ok(x);
            }
            let beta = rs_new / rs_old;
            p = &r + &(&p * beta);
            rs_old = rs_new;
        }
        Err(anyhow!("conjugate gradient did not converge"))
    }
}

fn take_submatrix(dense: &Array2<f64>, rows: &[usize], cols: &[usize]) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((rows.len(), cols.len()));
    for (i_out, &i) in rows.iter().enumerate() {
        for (j_out, &j) in cols.iter().enumerate() {
            out[(i_out, j_out)] = dense[(i, j)];
        }
    }
    out
}
