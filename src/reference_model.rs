//! Small deterministic transformer implementing [`ForwardEngine`]
//!
//! A byte-level causal transformer with seeded random weights. It has real
//! attention and MLP blocks and exposes the usual hook points, so every code
//! path of the service (caching, decoder encoding, steering, batched
//! generation) runs against it without downloading a model.
//!
//! ## Hook points (per layer `l`)
//!
//! - `blocks.{l}.hook_resid_pre`: residual stream entering the block
//! - `blocks.{l}.attn.hook_z`: concatenated head outputs, width `d_model`
//! - `blocks.{l}.attn.hook_v`, `blocks.{l}.attn.hook_pattern`: recorded
//!   only, shapes `(seq, heads, head_dim)` and `(heads, dest, src)`
//! - `blocks.{l}.mlp.hook_post`: MLP activation, width `d_mlp`
//! - `blocks.{l}.hook_resid_post`: residual stream leaving the block
//!
//! ## Batching
//!
//! Every batch row runs through its own kernels, and rows are only stacked
//! to hand hook functions a `(batch, seq_len, width)` tensor. A row's output
//! therefore does not depend on which other rows share its batch.
//!
//! ## Vocabulary
//!
//! Ids 0..4 are `<bos>`, `<eos>`, `<start_of_turn>`, `<end_of_turn>`; the
//! remaining 256 ids are raw bytes.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, Module, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::ForwardActivations;
use crate::engine::{ForwardEngine, HookRegistry, SamplingParams, TokenStream};
use crate::masks::create_causal_mask;

pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";
pub const START_OF_TURN_TOKEN: &str = "<start_of_turn>";
pub const END_OF_TURN_TOKEN: &str = "<end_of_turn>";

const SPECIAL_TOKENS: [&str; 4] = [BOS_TOKEN, EOS_TOKEN, START_OF_TURN_TOKEN, END_OF_TURN_TOKEN];
const BOS_ID: u32 = 0;
const EOS_ID: u32 = 1;
const BYTE_OFFSET: u32 = SPECIAL_TOKENS.len() as u32;
const VOCAB_SIZE: usize = SPECIAL_TOKENS.len() + 256;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Reference model shape and weight seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub d_model: usize,
    pub d_mlp: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub seed: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            d_model: 32,
            d_mlp: 64,
            n_layers: 4,
            n_heads: 4,
            max_position_embeddings: 512,
            rms_norm_eps: 1e-6,
            seed: 0,
        }
    }
}

/// Model ids [`ReferenceConfig::named`] understands.
pub const REFERENCE_MODEL_IDS: [&str; 2] = ["reference-tiny", "reference-small"];

impl ReferenceConfig {
    /// Shape registered under a model id.
    pub fn named(model_id: &str) -> Result<Self> {
        match model_id {
            "reference-tiny" => Ok(Self::default()),
            "reference-small" => Ok(Self {
                d_model: 64,
                d_mlp: 256,
                n_layers: 6,
                n_heads: 8,
                ..Self::default()
            }),
            other => anyhow::bail!(
                "Unknown model id '{other}', expected one of: {}",
                REFERENCE_MODEL_IDS.join(", ")
            ),
        }
    }

    fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}

// ---------------------------------------------------------------------------
// RmsNorm (weight + 1.0)
// ---------------------------------------------------------------------------

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(dim, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden_size = x.dim(D::Minus1)?;
        let norm_x = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
        let x_normed = x.broadcast_div(&(norm_x + self.eps)?.sqrt()?)?;
        let weight_plus_one = (&self.weight + 1.0)?;
        Ok(x_normed.broadcast_mul(&weight_plus_one)?)
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &ReferenceConfig) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            q_proj: linear_no_bias(d, d, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(d, d, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(d, d, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(d, d, vb.pp("o_proj"))?,
            n_heads: config.n_heads,
            head_dim: config.head_dim(),
        })
    }

    /// `x`: `(seq_len, d_model)`, `mask`: `(1, seq_len, seq_len)`
    fn heads(&self, x: &Tensor, mask: &Tensor) -> Result<AttentionHeads> {
        let seq_len = x.dim(0)?;
        let split_heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((seq_len, self.n_heads, self.head_dim))?
                .transpose(0, 1)?
                .contiguous()?)
        };
        let q = split_heads(self.q_proj.forward(x)?)?;
        let k = split_heads(self.k_proj.forward(x)?)?;
        let v = split_heads(self.v_proj.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let pattern = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let z = pattern
            .matmul(&v)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, self.n_heads * self.head_dim))?;
        Ok(AttentionHeads {
            v: v.transpose(0, 1)?.contiguous()?,
            pattern,
            z,
        })
    }
}

/// Per-head attention internals of one row.
struct AttentionHeads {
    /// `(seq_len, n_heads, head_dim)`
    v: Tensor,
    /// `(n_heads, dest, src)`
    pattern: Tensor,
    /// Concatenated head outputs, `(seq_len, n_heads * head_dim)`
    z: Tensor,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

struct Block {
    attn: Attention,
    fc_in: Linear,
    fc_out: Linear,
    ln_attn: RmsNorm,
    ln_mlp: RmsNorm,
}

impl Block {
    fn load(vb: VarBuilder, config: &ReferenceConfig) -> Result<Self> {
        Ok(Self {
            attn: Attention::load(vb.pp("attn"), config)?,
            fc_in: linear_no_bias(config.d_model, config.d_mlp, vb.pp("mlp.fc_in"))?,
            fc_out: linear_no_bias(config.d_mlp, config.d_model, vb.pp("mlp.fc_out"))?,
            ln_attn: RmsNorm::load(config.d_model, config.rms_norm_eps, vb.pp("ln_attn"))?,
            ln_mlp: RmsNorm::load(config.d_model, config.rms_norm_eps, vb.pp("ln_mlp"))?,
        })
    }

    fn attention_heads(&self, resid_pre: &Tensor, mask: &Tensor) -> Result<AttentionHeads> {
        self.attn.heads(&self.ln_attn.forward(resid_pre)?, mask)
    }

    /// Residual after the attention sublayer.
    fn attention_out(&self, resid_pre: &Tensor, z: &Tensor) -> Result<Tensor> {
        Ok((resid_pre + self.attn.o_proj.forward(z)?)?)
    }

    /// MLP hidden activation (the `mlp.hook_post` point).
    fn mlp_hidden(&self, resid_mid: &Tensor) -> Result<Tensor> {
        let xs = self.ln_mlp.forward(resid_mid)?;
        Ok(self.fc_in.forward(&xs)?.gelu()?)
    }

    fn mlp_out(&self, resid_mid: &Tensor, hidden: &Tensor) -> Result<Tensor> {
        Ok((resid_mid + self.fc_out.forward(hidden)?)?)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Byte-level reference transformer with hook points.
pub struct ReferenceModel {
    config: ReferenceConfig,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: RmsNorm,
    lm_head: Linear,
    hooks: HookRegistry,
    device: Device,
}

impl ReferenceModel {
    pub fn new(config: ReferenceConfig, device: &Device) -> Result<Self> {
        anyhow::ensure!(
            config.n_heads > 0 && config.d_model % config.n_heads == 0,
            "d_model ({}) must be divisible by n_heads ({})",
            config.d_model,
            config.n_heads
        );
        anyhow::ensure!(config.n_layers > 0, "Reference model needs at least one layer");

        let tensors = init_weights(&config, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);

        let wte = embedding(VOCAB_SIZE, config.d_model, vb.pp("wte"))?;
        let wpe = embedding(config.max_position_embeddings, config.d_model, vb.pp("wpe"))?;
        let blocks = (0..config.n_layers)
            .map(|i| Block::load(vb.pp(format!("blocks.{i}")), &config))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = RmsNorm::load(config.d_model, config.rms_norm_eps, vb.pp("ln_f"))?;
        let lm_head = linear_no_bias(config.d_model, VOCAB_SIZE, vb.pp("lm_head"))?;

        info!(
            "Reference model: {} layers, d_model={}, d_mlp={}, vocab={}",
            config.n_layers, config.d_model, config.d_mlp, VOCAB_SIZE
        );

        Ok(Self {
            config,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            hooks: HookRegistry::new(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }

    pub fn eos_token_id(&self) -> u32 {
        EOS_ID
    }

    /// Run hooks registered at `name` over the stacked rows, then record row 0.
    fn hook_point(&self, name: &str, rows: Vec<Tensor>, record: Option<&mut ForwardActivations>) -> Result<Vec<Tensor>> {
        let rows = if self.hooks.contains(name) {
            let batch = Tensor::stack(&rows, 0)?;
            let hooked = self.hooks.apply(name, &batch)?;
            anyhow::ensure!(
                hooked.dims() == batch.dims(),
                "Hook at {name} changed shape {:?} -> {:?}",
                batch.dims(),
                hooked.dims()
            );
            (0..rows.len())
                .map(|r| hooked.i(r))
                .collect::<candle_core::Result<Vec<_>>>()?
        } else {
            rows
        };
        if let (Some(acts), Some(first)) = (record, rows.first()) {
            acts.insert(name, first.clone());
        }
        Ok(rows)
    }

    /// Residual stream per row after `stop_at_layer` blocks (all blocks if `None`).
    fn run(
        &self,
        batch: &[Vec<u32>],
        stop_at_layer: Option<usize>,
        mut record: Option<&mut ForwardActivations>,
    ) -> Result<Vec<Tensor>> {
        let seq_len = batch.first().map(Vec::len).context("Empty batch")?;
        anyhow::ensure!(seq_len > 0, "Empty token sequence");
        anyhow::ensure!(
            batch.iter().all(|row| row.len() == seq_len),
            "Batch rows must have equal length"
        );
        anyhow::ensure!(
            seq_len <= self.config.max_position_embeddings,
            "Sequence of {seq_len} tokens exceeds the {} position limit",
            self.config.max_position_embeddings
        );

        let mask = create_causal_mask(seq_len, &self.device, DType::F32)?;
        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let pos_emb = self.wpe.forward(&positions)?;

        let mut xs = batch
            .iter()
            .map(|row| {
                let ids = Tensor::new(row.as_slice(), &self.device)?;
                Ok((self.wte.forward(&ids)? + &pos_emb)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let n_run = stop_at_layer.unwrap_or(self.blocks.len()).min(self.blocks.len());
        for (idx, block) in self.blocks.iter().enumerate().take(n_run) {
            xs = self.hook_point(&format!("blocks.{idx}.hook_resid_pre"), xs, record.as_deref_mut())?;

            let heads = xs
                .iter()
                .map(|x| block.attention_heads(x, &mask))
                .collect::<Result<Vec<_>>>()?;
            if let (Some(acts), Some(first)) = (record.as_deref_mut(), heads.first()) {
                acts.insert(format!("blocks.{idx}.attn.hook_v"), first.v.clone());
                acts.insert(format!("blocks.{idx}.attn.hook_pattern"), first.pattern.clone());
            }
            let z = self.hook_point(
                &format!("blocks.{idx}.attn.hook_z"),
                heads.into_iter().map(|h| h.z).collect(),
                record.as_deref_mut(),
            )?;
            let mid = xs
                .iter()
                .zip(&z)
                .map(|(x, z)| block.attention_out(x, z))
                .collect::<Result<Vec<_>>>()?;
            let hidden = mid
                .iter()
                .map(|x| block.mlp_hidden(x))
                .collect::<Result<Vec<_>>>()?;
            let hidden = self.hook_point(&format!("blocks.{idx}.mlp.hook_post"), hidden, record.as_deref_mut())?;

            xs = mid
                .iter()
                .zip(&hidden)
                .map(|(m, h)| block.mlp_out(m, h))
                .collect::<Result<Vec<_>>>()?;
            xs = self.hook_point(&format!("blocks.{idx}.hook_resid_post"), xs, record.as_deref_mut())?;
        }
        Ok(xs)
    }

    /// Next-token logits per row, shape `(vocab,)`.
    fn next_token_logits(&self, batch: &[Vec<u32>]) -> Result<Vec<Tensor>> {
        self.run(batch, None, None)?
            .iter()
            .map(|resid| {
                let seq_len = resid.dim(0)?;
                let last = resid.i(seq_len - 1)?.unsqueeze(0)?;
                let normed = self.ln_f.forward(&last)?;
                Ok(self.lm_head.forward(&normed)?.squeeze(0)?)
            })
            .collect()
    }
}

impl ForwardEngine for ReferenceModel {
    fn n_layers(&self) -> usize {
        self.config.n_layers
    }

    fn d_model(&self) -> usize {
        self.config.d_model
    }

    fn d_mlp(&self) -> usize {
        self.config.d_mlp
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn tokenize(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if prepend_bos {
            tokens.push(BOS_ID);
        }
        let bytes = text.as_bytes();
        let mut pos = 0;
        'outer: while pos < bytes.len() {
            for (id, special) in SPECIAL_TOKENS.iter().enumerate() {
                if bytes[pos..].starts_with(special.as_bytes()) {
                    tokens.push(id as u32);
                    pos += special.len();
                    continue 'outer;
                }
            }
            tokens.push(u32::from(bytes[pos]) + BYTE_OFFSET);
            pos += 1;
        }
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            match SPECIAL_TOKENS.get(token as usize) {
                Some(special) => bytes.extend_from_slice(special.as_bytes()),
                None => {
                    let byte = u8::try_from(token - BYTE_OFFSET)
                        .with_context(|| format!("Token id {token} is outside the vocabulary"))?;
                    bytes.push(byte);
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        SPECIAL_TOKENS.iter().position(|s| *s == token).map(|i| i as u32)
    }

    fn forward(&self, tokens: &[u32], stop_at_layer: Option<usize>) -> Result<ForwardActivations> {
        let mut acts = ForwardActivations::new();
        self.run(&[tokens.to_vec()], stop_at_layer, Some(&mut acts))?;
        Ok(acts)
    }

    fn generate_stream<'a>(&'a self, batch: &[Vec<u32>], params: &SamplingParams) -> Result<TokenStream<'a>> {
        let prompt_len = batch.first().map(Vec::len).context("Empty batch")?;
        anyhow::ensure!(params.tokens_per_yield > 0, "tokens_per_yield must be positive");
        anyhow::ensure!(
            prompt_len + params.max_new_tokens <= self.config.max_position_embeddings,
            "Prompt of {prompt_len} tokens plus {} new tokens exceeds the {} position limit",
            params.max_new_tokens,
            self.config.max_position_embeddings
        );
        Ok(Box::new(Generation::new(self, batch.to_vec(), params.clone())))
    }

    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Step-wise generation. Finished rows keep receiving EOS so the batch stays
/// rectangular, but they emit nothing.
struct Generation<'a> {
    model: &'a ReferenceModel,
    rows: Vec<Vec<u32>>,
    rngs: Vec<StdRng>,
    counts: Vec<HashMap<u32, usize>>,
    finished: Vec<bool>,
    produced: usize,
    params: SamplingParams,
}

impl<'a> Generation<'a> {
    fn new(model: &'a ReferenceModel, rows: Vec<Vec<u32>>, params: SamplingParams) -> Self {
        let n = rows.len();
        Self {
            model,
            rows,
            // Same seed on every row: a row samples identically alone or batched.
            rngs: (0..n).map(|_| StdRng::seed_from_u64(params.seed)).collect(),
            counts: vec![HashMap::new(); n],
            finished: vec![false; n],
            produced: 0,
            params,
        }
    }

    fn done(&self) -> bool {
        self.produced >= self.params.max_new_tokens || self.finished.iter().all(|f| *f)
    }

    fn step(&mut self, chunk: &mut [Vec<u32>]) -> Result<()> {
        let logits = self.model.next_token_logits(&self.rows)?;
        for (r, row_logits) in logits.iter().enumerate() {
            if self.finished[r] {
                self.rows[r].push(EOS_ID);
                continue;
            }
            let mut values: Vec<f32> = row_logits.to_dtype(DType::F32)?.to_vec1()?;
            if self.params.freq_penalty != 0.0 {
                for (&token, &count) in &self.counts[r] {
                    values[token as usize] -= self.params.freq_penalty * count as f32;
                }
            }
            let token = sample_token(&values, self.params.temperature, &mut self.rngs[r])?;
            self.rows[r].push(token);
            if self.params.stop_at_eos && token == EOS_ID {
                self.finished[r] = true;
                continue;
            }
            *self.counts[r].entry(token).or_default() += 1;
            chunk[r].push(token);
        }
        self.produced += 1;
        Ok(())
    }
}

impl Iterator for Generation<'_> {
    type Item = Result<Vec<Vec<u32>>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done() {
            return None;
        }
        let mut chunk = vec![Vec::new(); self.rows.len()];
        for _ in 0..self.params.tokens_per_yield {
            if self.done() {
                break;
            }
            if let Err(e) = self.step(&mut chunk) {
                self.produced = self.params.max_new_tokens;
                return Some(Err(e));
            }
        }
        Some(Ok(chunk))
    }
}

/// Sample a token from logits (greedy when `temperature <= 0`).
fn sample_token(logits: &[f32], temperature: f32, rng: &mut StdRng) -> Result<u32> {
    if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature, rng)
    }
}

fn argmax(logits: &[f32]) -> Result<u32> {
    let (max_idx, _) = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
    Ok(max_idx as u32)
}

fn sample_with_temperature(logits: &[f32], temperature: f32, rng: &mut StdRng) -> Result<u32> {
    anyhow::ensure!(!logits.is_empty(), "Empty logits");
    let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();

    // Softmax
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }
    Ok((exp_vals.len() - 1) as u32)
}

fn init_weights(config: &ReferenceConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut tensors = HashMap::new();
    let mut uniform = |name: String, shape: (usize, usize), scale: f32, tensors: &mut HashMap<String, Tensor>| -> Result<()> {
        let data: Vec<f32> = (0..shape.0 * shape.1).map(|_| rng.gen_range(-scale..scale)).collect();
        tensors.insert(name, Tensor::from_vec(data, shape, device)?);
        Ok(())
    };

    let d = config.d_model;
    let in_scale = |fan_in: usize| 1.0 / (fan_in as f32).sqrt();
    uniform("wte.weight".into(), (VOCAB_SIZE, d), 1.0, &mut tensors)?;
    uniform("wpe.weight".into(), (config.max_position_embeddings, d), 0.1, &mut tensors)?;
    for i in 0..config.n_layers {
        let p = format!("blocks.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            uniform(format!("{p}.attn.{proj}.weight"), (d, d), in_scale(d), &mut tensors)?;
        }
        uniform(format!("{p}.mlp.fc_in.weight"), (config.d_mlp, d), in_scale(d), &mut tensors)?;
        uniform(format!("{p}.mlp.fc_out.weight"), (d, config.d_mlp), in_scale(config.d_mlp), &mut tensors)?;
        for norm in ["ln_attn", "ln_mlp"] {
            tensors.insert(format!("{p}.{norm}.weight"), Tensor::zeros(d, DType::F32, device)?);
        }
    }
    tensors.insert("ln_f.weight".into(), Tensor::zeros(d, DType::F32, device)?);
    uniform("lm_head.weight".into(), (VOCAB_SIZE, d), in_scale(d), &mut tensors)?;
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HookFn;
    use std::sync::Arc;

    fn model() -> ReferenceModel {
        ReferenceModel::new(ReferenceConfig::default(), &Device::Cpu).unwrap()
    }

    fn collect(stream: TokenStream<'_>, rows: usize) -> Vec<Vec<u32>> {
        let mut out = vec![Vec::new(); rows];
        for chunk in stream {
            for (r, tokens) in chunk.unwrap().into_iter().enumerate() {
                out[r].extend(tokens);
            }
        }
        out
    }

    #[test]
    fn test_tokenizer_round_trip_with_specials() {
        let model = model();
        let text = "<start_of_turn>user\nhi<end_of_turn>\n";
        let tokens = model.tokenize(text, true).unwrap();
        assert_eq!(tokens[0], BOS_ID);
        assert_eq!(tokens[1], model.token_id(START_OF_TURN_TOKEN).unwrap());
        assert!(tokens.contains(&model.token_id(END_OF_TURN_TOKEN).unwrap()));
        assert_eq!(model.detokenize(&tokens[1..]).unwrap(), text);
        assert_eq!(model.token_id("<pad>"), None);
    }

    #[test]
    fn test_forward_records_hook_points() {
        let model = model();
        let tokens = model.tokenize("hello", true).unwrap();
        let acts = model.forward(&tokens, None).unwrap();
        assert_eq!(acts.len(), 6 * model.n_layers());
        assert_eq!(acts.get("blocks.0.hook_resid_pre").unwrap().dims(), &[6, 32]);
        assert_eq!(acts.get("blocks.3.mlp.hook_post").unwrap().dims(), &[6, 64]);
        assert_eq!(acts.get("blocks.2.attn.hook_v").unwrap().dims(), &[6, 4, 8]);
        assert_eq!(acts.get("blocks.2.attn.hook_pattern").unwrap().dims(), &[4, 6, 6]);
        assert_eq!(acts.get("blocks.2.attn.hook_z").unwrap().dims(), &[6, 32]);

        let truncated = model.forward(&tokens, Some(2)).unwrap();
        assert!(truncated.get("blocks.1.hook_resid_post").is_some());
        assert!(truncated.get("blocks.2.hook_resid_pre").is_none());
    }

    #[test]
    fn test_head_outputs_are_pattern_weighted_values() {
        let model = model();
        let tokens = model.tokenize("attend", true).unwrap();
        let acts = model.forward(&tokens, Some(1)).unwrap();
        let v = acts.get("blocks.0.attn.hook_v").unwrap();
        let pattern = acts.get("blocks.0.attn.hook_pattern").unwrap();
        let z = acts.get("blocks.0.attn.hook_z").unwrap();

        // Causal rows sum to one and never look ahead
        let rows: Vec<Vec<f32>> = pattern.i(1).unwrap().to_vec2().unwrap();
        for (dest, row) in rows.iter().enumerate() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            assert!(row[dest + 1..].iter().all(|p| *p == 0.0));
        }

        // z[dest, h * d_head + d] = sum_src pattern[h, dest, src] * v[src, h, d]
        let rebuilt = pattern
            .matmul(&v.transpose(0, 1).unwrap().contiguous().unwrap())
            .unwrap()
            .transpose(0, 1)
            .unwrap()
            .contiguous()
            .unwrap()
            .reshape(z.dims())
            .unwrap();
        let diff: f32 = (&rebuilt - z).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_named_configs() {
        assert_eq!(ReferenceConfig::named("reference-tiny").unwrap(), ReferenceConfig::default());
        let small = ReferenceConfig::named("reference-small").unwrap();
        assert_eq!(small.n_layers, 6);
        assert_eq!(small.d_model % small.n_heads, 0);
        let err = ReferenceConfig::named("gpt2-small").unwrap_err();
        assert!(err.to_string().contains("reference-tiny"));
    }

    #[test]
    fn test_hooks_change_downstream_activations() {
        let model = model();
        let tokens = model.tokenize("abc", true).unwrap();
        let clean = model.forward(&tokens, None).unwrap();
        {
            let shift: HookFn = Arc::new(|t: &Tensor| -> Result<Tensor> { Ok((t + 1.0)?) });
            let _guard = model
                .hooks()
                .register(vec![("blocks.0.hook_resid_post".to_string(), shift)]);
            let hooked = model.forward(&tokens, None).unwrap();
            let a: Vec<f32> = clean.get("blocks.1.hook_resid_pre").unwrap().flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = hooked.get("blocks.1.hook_resid_pre").unwrap().flatten_all().unwrap().to_vec1().unwrap();
            assert!(a.iter().zip(&b).all(|(x, y)| (y - x - 1.0).abs() < 1e-5));
        }
        let again = model.forward(&tokens, None).unwrap();
        let a: Vec<f32> = clean.get("blocks.3.hook_resid_post").unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let c: Vec<f32> = again.get("blocks.3.hook_resid_post").unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_batched_row_matches_single_run() {
        let model = model();
        let prompt = model.tokenize("The quick", true).unwrap();
        let params = SamplingParams {
            max_new_tokens: 8,
            temperature: 0.8,
            seed: 11,
            tokens_per_yield: 3,
            ..Default::default()
        };
        let single = collect(model.generate_stream(&[prompt.clone()], &params).unwrap(), 1);
        let batched = collect(
            model.generate_stream(&[prompt.clone(), prompt], &params).unwrap(),
            2,
        );
        assert_eq!(batched[0], single[0]);
        assert_eq!(batched[1], single[0]);
    }

    #[test]
    fn test_generation_respects_limits() {
        let model = model();
        let prompt = model.tokenize("x", true).unwrap();
        let params = SamplingParams {
            max_new_tokens: 5,
            tokens_per_yield: 2,
            stop_at_eos: false,
            ..Default::default()
        };
        let chunks: Vec<Vec<Vec<u32>>> = model
            .generate_stream(&[prompt], &params)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        let sizes: Vec<usize> = chunks.iter().map(|c| c[0].len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_overlong_generation_is_rejected() {
        let model = model();
        let prompt = vec![BOS_ID; 500];
        let params = SamplingParams {
            max_new_tokens: 100,
            ..Default::default()
        };
        assert!(model.generate_stream(&[prompt], &params).is_err());
    }

    #[test]
    fn test_sampling() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_token(&[0.1, 3.0, -1.0], 0.0, &mut rng).unwrap(), 1);
        // A dominant logit wins at low temperature
        assert_eq!(sample_token(&[0.0, 50.0, 0.0], 0.5, &mut rng).unwrap(), 1);
        assert!(argmax(&[]).is_err());
    }
}
