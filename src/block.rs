use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2};
use tracing::warn;

use crate::precision::PrecisionMatrix;

/// LD-proxy substitution performed during reconciliation: `old_index` was
/// present in the annotations but had no summary statistic, `new_index` is
/// the retained variant standing in for it, `r2` the squared implied LD
/// correlation between the two. `r2` is NaN when the search was degenerate.
#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub block: usize,
    pub old_index: usize,
    pub new_index: usize,
    pub r2: f64,
}

/// One LD-independent genomic region: precision matrix, Z-scores, annotation
/// matrix, and the index sets tying them to a common variant space.
///
/// All per-block arrays are filtered and reordered together by
/// [`Block::reconcile`]; afterwards indices live in the ordinal space of the
/// retained summary-statistic variants and `variant_ids` keeps the original
/// coordinates for reporting.
#[derive(Debug, Clone)]
pub struct Block {
    pub precision: PrecisionMatrix,
    pub annotations: Array2<f64>,
    pub z: Array1<f64>,
    pub annot_indices: Vec<usize>,
    pub sumstat_indices: Vec<usize>,
    pub variant_ids: Vec<usize>,
    /// Annotation row -> ordinal of its resolved summary-statistic variant.
    pub map: Vec<usize>,
}

impl Block {
    /// Identity index mappings: annotation row `i` and Z entry `i` both refer
    /// to variant `i` of the precision matrix.
    pub fn new(precision: PrecisionMatrix, annotations: Array2<f64>, z: Array1<f64>) -> Result<Self> {
        let dim = precision.dim();
        if annotations.nrows() != dim {
            return Err(anyhow!(
                "annotation rows ({}) do not match precision dimension ({dim})",
                annotations.nrows()
            ));
        }
        if z.len() != dim {
            return Err(anyhow!(
                "Z length ({}) does not match precision dimension ({dim})",
                z.len()
            ));
        }
        let annot_indices = (0..dim).collect();
        let sumstat_indices = (0..dim).collect();
        Self::with_indices(precision, annotations, z, annot_indices, sumstat_indices)
    }

    pub fn with_indices(
        precision: PrecisionMatrix,
        annotations: Array2<f64>,
        z: Array1<f64>,
        annot_indices: Vec<usize>,
        sumstat_indices: Vec<usize>,
    ) -> Result<Self> {
        let dim = precision.dim();
        if annot_indices.len() != annotations.nrows() {
            return Err(anyhow!(
                "annotation index count ({}) does not match annotation rows ({})",
                annot_indices.len(),
                annotations.nrows()
            ));
        }
        if sumstat_indices.len() != z.len() {
            return Err(anyhow!(
                "summary-statistic index count ({}) does not match Z length ({})",
                sumstat_indices.len(),
                z.len()
            ));
        }
        for &idx in annot_indices.iter().chain(sumstat_indices.iter()) {
            if idx >= dim {
                return Err(anyhow!("variant index {idx} out of range for dimension {dim}"));
            }
        }
        let variant_ids = (0..dim).collect();
        Ok(Self {
            precision,
            annotations,
            z,
            annot_indices,
            sumstat_indices,
            variant_ids,
            map: Vec::new(),
        })
    }

    pub fn n_ordinals(&self) -> usize {
        self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.z.is_empty()
    }

    pub fn max_chisq(&self) -> Option<f64> {
        self.z
            .iter()
            .map(|v| v * v)
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))))
    }

    /// Align the annotation and summary-statistic index spaces.
    ///
    /// Summary statistics for variants with no annotation row are dropped;
    /// annotated variants with no summary statistic are rewritten to their
    /// best LD proxy among the retained variants. Z is sorted into ascending
    /// variant order, the precision matrix is restricted to the retained set,
    /// and every array is renumbered into the resulting ordinal space.
    /// Running this a second time is a no-op.
    pub fn reconcile(&mut self, block_idx: usize) -> Result<Vec<ProxyRecord>> {
        let dim = self.precision.dim();

        let mut canon = Vec::new();
        let mut canon_set = HashSet::new();
        for &idx in &self.annot_indices {
            if canon_set.insert(idx) {
                canon.push(idx);
            }
        }

        // Retain one Z entry per variant that also has an annotation row.
        let mut present = Vec::new();
        let mut seen = HashSet::new();
        for (pos, &idx) in self.sumstat_indices.iter().enumerate() {
            if canon_set.contains(&idx) && seen.insert(idx) {
                present.push((idx, self.z[pos]));
            }
        }
        if present.is_empty() {
            self.z = Array1::zeros(0);
            self.sumstat_indices.clear();
            self.variant_ids.clear();
            self.map.clear();
            return Ok(Vec::new());
        }
        let present_set: HashSet<usize> = present.iter().map(|(idx, _)| *idx).collect();

        let mut proxies = Vec::new();
        let mut rewrite = HashMap::new();
        for &missing in canon.iter().filter(|idx| !present_set.contains(*idx)) {
            let mut rhs = Array1::<f64>::zeros(dim);
            rhs[missing] = 1.0;
            let column = self.precision.cg_solve(&rhs.view(), 1e-10, 20 * dim.max(10));

            let mut chosen = None;
            if let Ok(x) = &column {
                if x[missing].is_finite() && x[missing] > 0.0 {
                    for &(cand, _) in &present {
                        let r2 = x[cand] * x[cand] / x[missing];
                        if !r2.is_finite() {
                            continue;
                        }
                        match chosen {
                            Some((_, best)) if r2 <= best => {}
                            _ => chosen = Some((cand, r2)),
                        }
                    }
                }
            }
            let (proxy, r2) = match chosen {
                Some(found) => found,
                None => {
                    warn!(
                        "block {block_idx}: no valid LD proxy for variant {}; \
                         falling back to first retained variant",
                        self.variant_ids[missing]
                    );
                    (present[0].0, f64::NAN)
                }
            };
            proxies.push(ProxyRecord {
                block: block_idx,
                old_index: self.variant_ids[missing],
                new_index: self.variant_ids[proxy],
                r2,
            });
            rewrite.insert(missing, proxy);
        }

        for idx in &mut self.annot_indices {
            if let Some(&proxy) = rewrite.get(idx) {
                *idx = proxy;
            }
        }

        present.sort_by_key(|(idx, _)| *idx);
        let keep: Vec<usize> = present.iter().map(|(idx, _)| *idx).collect();
        self.precision = self.precision.restrict(&keep)?;
        self.z = Array1::from_iter(present.iter().map(|(_, z)| *z));
        self.variant_ids = keep.iter().map(|&idx| self.variant_ids[idx]).collect();

        let ordinal_of: HashMap<usize, usize> =
            keep.iter().enumerate().map(|(ord, &idx)| (idx, ord)).collect();
        for idx in &mut self.annot_indices {
            let ordinal = ordinal_of
                .get(idx)
                .copied()
                .ok_or_else(|| anyhow!("annotation variant {idx} missing after reconciliation"))?;
            *idx = ordinal;
        }
        self.sumstat_indices = (0..keep.len()).collect();
        self.map = self.annot_indices.clone();
        Ok(proxies)
    }
}
