//! Direct feature attribution through attention
//!
//! A decoder trained on the concatenated head outputs of a layer (`hook_z`)
//! encodes a linear function of the attention values. Its pre-activation at a
//! destination position therefore splits exactly into one contribution per
//! source position:
//!
//! ```text
//! dfa[src] = sum_h pattern[h, dest, src] * (v[src, h, :] . W_enc[h * d_head .. (h + 1) * d_head, index])
//! ```
//!
//! The destination is the position where the feature fires hardest. Both
//! inputs come from the recorded forward pass, so attribution never runs the
//! model again.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::cache::ForwardActivations;

/// Per-source-position contributions to one feature at one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub values: Vec<f32>,
    /// Destination position the contributions flow into
    pub target_index: usize,
    pub max_value: f32,
}

pub fn value_hook(layer: usize) -> String {
    format!("blocks.{layer}.attn.hook_v")
}

pub fn pattern_hook(layer: usize) -> String {
    format!("blocks.{layer}.attn.hook_pattern")
}

/// Attribute the feature whose encoder column is `encoder_column` (shape
/// `(n_heads * d_head,)`) at position `target` back to source positions.
pub fn direct_feature_attribution(
    activations: &ForwardActivations,
    layer: usize,
    encoder_column: &Tensor,
    target: usize,
) -> Result<Attribution> {
    let v = activations.require(&value_hook(layer))?.to_dtype(DType::F32)?;
    let pattern = activations.require(&pattern_hook(layer))?.to_dtype(DType::F32)?;
    let (n_src, n_heads, d_head) = v.dims3()?;
    let (_, n_dest, _) = pattern.dims3()?;

    anyhow::ensure!(
        encoder_column.dims() == [n_heads * d_head],
        "Encoder column of shape {:?} does not match {n_heads} heads of width {d_head}",
        encoder_column.dims()
    );
    anyhow::ensure!(target < n_dest, "Target position {target} out of range ({n_dest} positions)");

    let column = encoder_column
        .to_dtype(DType::F32)?
        .reshape((1, n_heads, d_head))?;
    // (src, heads): each head's value vector projected onto the encoder column
    let projected = v.broadcast_mul(&column)?.sum(2)?;
    // (src, heads): how much the target attends to each source, per head
    let weights = pattern.i((.., target, ..))?.t()?;
    let values: Vec<f32> = (projected * weights)?.sum(1)?.to_vec1()?;
    debug_assert_eq!(values.len(), n_src);

    let max_value = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    Ok(Attribution {
        values,
        target_index: target,
        max_value,
    })
}
