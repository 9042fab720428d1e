//! Activation-space interventions
//!
//! Turns caller-specified features and vectors into hook functions that
//! mutate hook-point activations during generation.
//!
//! ## Pipeline
//!
//! 1. **Resolve**: a decoder feature becomes the decoder row at its index (a
//!    one-hot MLP direction for raw-neuron entries). Explicit vectors are used
//!    as given.
//! 2. **Build**: each direction is checked for inf/NaN, optionally
//!    normalized, and paired with `coeff = strength_multiplier * strength`.
//! 3. **Hook**: one hook function per distinct hook point applies that
//!    point's interventions to the steered batch rows only.
//!
//! ## Methods
//!
//! ```text
//! SimpleAdditive:    h' = h + coeff * v
//! OrthogonalDecomp:  h' = (I - P) h + coeff * P h,   P = u u^T,  u = v / |v|
//! ```
//!
//! An ablated feature always uses the orthogonal form with `coeff = 0`,
//! removing the direction from the activation. A per-position mask blends
//! the result so masked positions pass through unmodified:
//! `h' = h * (1 - m) + steered * m`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::decoder::DecoderId;
use crate::engine::HookFn;
use crate::error::{SteerError, SteerResult};
use crate::registry::DecoderHandle;

/// Intervention strategy applied at every hook call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SteerMethod {
    #[default]
    SimpleAdditive,
    OrthogonalDecomp,
}

/// A decoder feature to steer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringFeature {
    /// Decoder whose row (or raw neuron) defines the direction
    pub source: DecoderId,
    pub index: usize,
    pub strength: f32,
    /// Overrides the decoder row when present
    #[serde(default)]
    pub steering_vector: Option<Vec<f32>>,
    #[serde(default)]
    pub ablate: bool,
}

/// An explicit direction applied at a named hook point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringVector {
    pub hook: String,
    pub steering_vector: Vec<f32>,
    pub strength: f32,
    #[serde(default)]
    pub ablate: bool,
}

/// A direction bound to its hook point, before validation.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub hook_name: String,
    /// Shape `(d,)`, F32
    pub direction: Tensor,
    pub strength: f32,
    pub ablate: bool,
}

/// Which sequence positions an intervention touches.
#[derive(Debug, Clone, Default)]
pub enum PositionSelector {
    #[default]
    All,
    /// Per-position weights for the prompt; positions past its end get 1.0
    Masked(Arc<[f32]>),
}

impl PositionSelector {
    /// Mask tensor of shape `(seq_len, 1)`, or `None` for all positions.
    fn mask_tensor(&self, seq_len: usize, dtype: DType, device: &Device) -> Result<Option<Tensor>> {
        match self {
            PositionSelector::All => Ok(None),
            PositionSelector::Masked(mask) => {
                let values: Vec<f32> = (0..seq_len).map(|i| mask.get(i).copied().unwrap_or(1.0)).collect();
                Ok(Some(Tensor::from_vec(values, (seq_len, 1), device)?.to_dtype(dtype)?))
            }
        }
    }
}

/// A fully resolved intervention.
#[derive(Debug, Clone)]
pub struct InterventionSpec {
    pub hook_name: String,
    pub positions: PositionSelector,
    /// Shape `(d,)`, F32; unit length when normalization was requested
    pub direction: Tensor,
    pub coeff: f64,
    pub ablate: bool,
}

/// Resolve decoder features to directions, calling `load` once per decoder.
///
/// Unknown decoders and out-of-range indices are [`SteerError::InvalidFeature`].
pub fn resolve_features(
    load: &mut dyn FnMut(&DecoderId) -> SteerResult<DecoderHandle>,
    features: &[SteeringFeature],
    d_mlp: usize,
    device: &Device,
) -> SteerResult<Vec<ResolvedFeature>> {
    // Group by decoder, keeping first-appearance order
    let mut groups: Vec<(DecoderId, Vec<usize>)> = Vec::new();
    for (i, feature) in features.iter().enumerate() {
        match groups.iter_mut().find(|(id, _)| *id == feature.source) {
            Some((_, members)) => members.push(i),
            None => groups.push((feature.source.clone(), vec![i])),
        }
    }

    let mut resolved: Vec<Option<ResolvedFeature>> = vec![None; features.len()];
    for (id, members) in groups {
        let handle = load(&id).map_err(|e| match e {
            SteerError::UnknownDecoder(id) => SteerError::InvalidFeature(format!("unknown decoder {id}")),
            other => other,
        })?;

        let from_weights: Vec<usize> = members
            .iter()
            .copied()
            .filter(|&i| features[i].steering_vector.is_none())
            .collect();
        let mut rows: HashMap<usize, Tensor> = HashMap::new();
        if !from_weights.is_empty() {
            match &handle.weights {
                Some(weights) => {
                    let indices: Vec<usize> = from_weights.iter().map(|&i| features[i].index).collect();
                    let directions = weights
                        .directions(&indices)
                        .map_err(|e| SteerError::InvalidFeature(format!("{id}: {e}")))?;
                    for (k, &i) in from_weights.iter().enumerate() {
                        rows.insert(i, directions.i(k)?);
                    }
                }
                None => {
                    for &i in &from_weights {
                        rows.insert(i, one_hot(features[i].index, d_mlp, device).map_err(|e| {
                            SteerError::InvalidFeature(format!("{id}: {e}"))
                        })?);
                    }
                }
            }
        }

        for &i in &members {
            let feature = &features[i];
            let direction = match (&feature.steering_vector, rows.remove(&i)) {
                (Some(values), _) => Tensor::new(values.as_slice(), device)?,
                (None, Some(row)) => row,
                (None, None) => return Err(SteerError::InvalidFeature(format!("{id}: no direction"))),
            };
            resolved[i] = Some(ResolvedFeature {
                hook_name: handle.hook_name().to_string(),
                direction,
                strength: feature.strength,
                ablate: feature.ablate,
            });
        }
    }

    resolved
        .into_iter()
        .map(|r| r.ok_or_else(|| SteerError::InvalidFeature("unresolved feature".to_string())))
        .collect()
}

/// Explicit vectors need no lookup.
pub fn resolve_vectors(vectors: &[SteeringVector], device: &Device) -> SteerResult<Vec<ResolvedFeature>> {
    vectors
        .iter()
        .map(|v| {
            Ok(ResolvedFeature {
                hook_name: v.hook.clone(),
                direction: Tensor::new(v.steering_vector.as_slice(), device)?,
                strength: v.strength,
                ablate: v.ablate,
            })
        })
        .collect()
}

fn one_hot(index: usize, width: usize, device: &Device) -> Result<Tensor> {
    anyhow::ensure!(index < width, "neuron index {index} out of range (width {width})");
    let mut values = vec![0f32; width];
    values[index] = 1.0;
    Ok(Tensor::from_vec(values, width, device)?)
}

/// Check an explicit vector before any engine work.
pub fn validate_vector(values: &[f32], normalize: bool) -> SteerResult<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SteerError::DegenerateVector);
    }
    if normalize && values.iter().all(|v| *v == 0.0) {
        return Err(SteerError::ZeroNorm);
    }
    Ok(())
}

/// Validate, optionally normalize, and attach coefficients.
pub fn build_interventions(
    resolved: Vec<ResolvedFeature>,
    strength_multiplier: f32,
    normalize: bool,
    positions: &PositionSelector,
) -> SteerResult<Vec<InterventionSpec>> {
    resolved
        .into_iter()
        .map(|feature| {
            let values: Vec<f32> = feature.direction.to_dtype(DType::F32)?.to_vec1()?;
            validate_vector(&values, normalize)?;

            let direction = if normalize {
                let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm == 0.0 {
                    return Err(SteerError::ZeroNorm);
                }
                (feature.direction.to_dtype(DType::F32)? / f64::from(norm))?
            } else {
                feature.direction.to_dtype(DType::F32)?
            };

            Ok(InterventionSpec {
                hook_name: feature.hook_name,
                positions: positions.clone(),
                direction,
                coeff: f64::from(strength_multiplier) * f64::from(feature.strength),
                ablate: feature.ablate,
            })
        })
        .collect()
}

/// Rank-1 projector onto a direction, computed once per request.
#[derive(Debug, Clone)]
pub struct OrthogonalProjector {
    /// `P = u u^T`, shape `(d, d)`
    p: Tensor,
}

impl OrthogonalProjector {
    pub fn new(direction: &Tensor) -> SteerResult<Self> {
        let v = direction.to_dtype(DType::F32)?;
        let norm = v.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt();
        if !norm.is_finite() {
            return Err(SteerError::DegenerateVector);
        }
        if norm == 0.0 {
            return Err(SteerError::ZeroNorm);
        }
        let u = (v / f64::from(norm))?.unsqueeze(1)?;
        let p = u.matmul(&u.t()?)?;
        Ok(Self { p })
    }

    pub fn matrix(&self) -> &Tensor {
        &self.p
    }

    /// `(I - P) h + coeff * P h` for `h` of shape `(seq_len, d)`.
    pub fn project(&self, h: &Tensor, coeff: f64) -> Result<Tensor> {
        let p = self.p.to_dtype(h.dtype())?;
        // P is symmetric, so each row's projection is h P.
        let along = h.matmul(&p)?;
        Ok((h + (along * (coeff - 1.0))?)?)
    }
}

struct PreparedIntervention {
    spec: InterventionSpec,
    projector: Option<OrthogonalProjector>,
}

impl PreparedIntervention {
    fn apply(&self, h: &Tensor) -> Result<Tensor> {
        let (seq_len, width) = h.dims2()?;
        let d = self.spec.direction.dim(0)?;
        if d != width {
            return Err(SteerError::InvalidFeature(format!(
                "steering vector has width {d} but {} has width {width}",
                self.spec.hook_name
            ))
            .into());
        }

        let steered = match &self.projector {
            Some(projector) => {
                let coeff = if self.spec.ablate { 0.0 } else { self.spec.coeff };
                projector.project(h, coeff)?
            }
            None => {
                let delta = (self.spec.direction.to_dtype(h.dtype())? * self.spec.coeff)?.unsqueeze(0)?;
                h.broadcast_add(&delta)?
            }
        };

        match self.spec.positions.mask_tensor(seq_len, h.dtype(), h.device())? {
            None => Ok(steered),
            Some(mask) => {
                let keep = mask.affine(-1.0, 1.0)?;
                Ok((h.broadcast_mul(&keep)? + steered.broadcast_mul(&mask)?)?)
            }
        }
    }
}

/// One hook function per distinct hook point, steering only `steered_rows`.
///
/// Other rows are returned untouched, bit for bit.
pub fn steering_hooks(
    specs: Vec<InterventionSpec>,
    method: SteerMethod,
    steered_rows: &[usize],
) -> SteerResult<Vec<(String, HookFn)>> {
    let mut by_hook: Vec<(String, Vec<PreparedIntervention>)> = Vec::new();
    for spec in specs {
        let projector = if spec.ablate || method == SteerMethod::OrthogonalDecomp {
            Some(OrthogonalProjector::new(&spec.direction)?)
        } else {
            None
        };
        let prepared = PreparedIntervention { spec, projector };
        match by_hook.iter_mut().find(|(name, _)| *name == prepared.spec.hook_name) {
            Some((_, group)) => group.push(prepared),
            None => by_hook.push((prepared.spec.hook_name.clone(), vec![prepared])),
        }
    }

    let steered_rows: Arc<[usize]> = steered_rows.into();
    Ok(by_hook
        .into_iter()
        .map(|(name, group)| {
            let group = Arc::new(group);
            let rows = Arc::clone(&steered_rows);
            let hook: HookFn = Arc::new(move |activations: &Tensor| -> Result<Tensor> {
                let batch = activations.dim(0)?;
                let out = (0..batch)
                    .map(|r| {
                        let mut row = activations.i(r)?;
                        if rows.contains(&r) {
                            for intervention in group.iter() {
                                row = intervention.apply(&row)?;
                            }
                        }
                        Ok(row)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Tensor::stack(&out, 0)?)
            });
            (name, hook)
        })
        .collect())
}
