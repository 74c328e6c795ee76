use anyhow::Result;
use ndarray::{Array1, Array2, Axis};
use tracing::info;

use crate::block::Block;
use crate::link::LinkFn;

/// How blocks containing a genome-wide-significant large-effect locus are
/// treated. Resolved once before the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeEffectPolicy {
    /// No exclusion beyond empty blocks.
    Keep,
    /// Remove the whole block when its max chi-square exceeds the threshold.
    Discard,
    /// Append an annotation column flagging the lead variant of each
    /// over-threshold block with 1.
    AnnotateSnp,
    /// As `AnnotateSnp`, but the flag carries the excess chi-square above the
    /// threshold.
    AnnotateSnpLinear,
    /// As `AnnotateSnp`, but every variant of an over-threshold block is
    /// flagged.
    AnnotateBlock,
}

#[derive(Debug, Clone)]
pub struct FilterSummary {
    pub dropped_empty: usize,
    pub discarded: usize,
    /// Positions (in the retained block ordering) that triggered the policy.
    pub annotated_blocks: Vec<usize>,
    pub column_added: bool,
    /// The appended annotation column per retained block, when one was
    /// created.
    pub extra_columns: Vec<Array1<f64>>,
    pub threshold: f64,
}

pub fn default_threshold(sample_size: f64) -> f64 {
    (sample_size * 1e-3).max(80.0)
}

/// Drop empty blocks, apply the large-effect policy, and return the filter
/// summary plus the initial value for the appended parameter when a column
/// was created.
pub fn apply_policy(
    blocks: &mut Vec<Block>,
    policy: LargeEffectPolicy,
    threshold: f64,
    link: &dyn LinkFn,
    sample_size: f64,
) -> Result<(FilterSummary, Option<f64>)> {
    let before = blocks.len();
    blocks.retain(|block| !block.is_empty());
    let dropped_empty = before - blocks.len();
    if dropped_empty > 0 {
        info!("Dropped {dropped_empty} block(s) with no summary statistics");
    }

    let mut summary = FilterSummary {
        dropped_empty,
        discarded: 0,
        annotated_blocks: Vec::new(),
        column_added: false,
        extra_columns: Vec::new(),
        threshold,
    };

    match policy {
        LargeEffectPolicy::Keep => Ok((summary, None)),
        LargeEffectPolicy::Discard => {
            let before = blocks.len();
            blocks.retain(|block| block.max_chisq().map_or(false, |c| c <= threshold));
            summary.discarded = before - blocks.len();
            if summary.discarded > 0 {
                info!(
                    "Discarded {} block(s) with max chi-square above {threshold}",
                    summary.discarded
                );
            }
            Ok((summary, None))
        }
        LargeEffectPolicy::AnnotateSnp
        | LargeEffectPolicy::AnnotateSnpLinear
        | LargeEffectPolicy::AnnotateBlock => {
            for (pos, block) in blocks.iter().enumerate() {
                if block.max_chisq().map_or(false, |c| c > threshold) {
                    summary.annotated_blocks.push(pos);
                }
            }
            if summary.annotated_blocks.is_empty() {
                return Ok((summary, None));
            }

            for (pos, block) in blocks.iter_mut().enumerate() {
                let column = policy_column(block, policy, threshold)
                    .filter(|_| summary.annotated_blocks.contains(&pos));
                let n_rows = block.annotations.nrows();
                let values = column.unwrap_or_else(|| vec![0.0; n_rows]);
                let extra = Array2::from_shape_fn((n_rows, 1), |(r, _)| values[r]);
                block.annotations =
                    ndarray::concatenate(Axis(1), &[block.annotations.view(), extra.view()])?;
                summary.extra_columns.push(Array1::from_vec(values));
            }
            summary.column_added = true;
            info!(
                "Flagged {} block(s) under the large-effect policy",
                summary.annotated_blocks.len()
            );

            // E[chi2] = 1 + n h maps the threshold to a per-variant
            // heritability for the appended coefficient's start value.
            let h_at_threshold = ((threshold - 1.0) / sample_size).max(1e-12);
            Ok((summary, Some(link.inverse(h_at_threshold))))
        }
    }
}

fn policy_column(
    block: &Block,
    policy: LargeEffectPolicy,
    threshold: f64,
) -> Option<Vec<f64>> {
    let n_rows = block.annotations.nrows();
    let max_chi = block.max_chisq()?;
    match policy {
        LargeEffectPolicy::AnnotateBlock => Some(vec![1.0; n_rows]),
        LargeEffectPolicy::AnnotateSnp | LargeEffectPolicy::AnnotateSnpLinear => {
            let lead = block
                .z
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| (**a * **a).total_cmp(&(**b * **b)))
                .map(|(ordinal, _)| ordinal)?;
            let flag = match policy {
                LargeEffectPolicy::AnnotateSnpLinear => max_chi - threshold,
                _ => 1.0,
            };
            let mut values = vec![0.0; n_rows];
            for (row, &ordinal) in block.map.iter().enumerate() {
                if ordinal == lead {
                    values[row] = flag;
                }
            }
            Some(values)
        }
        _ => None,
    }
}
