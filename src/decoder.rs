//! Feature decoders: identifiers, catalog descriptors, weights and weight sources
//!
//! A trained decoder (sparse autoencoder) maps one hook point's activation
//! vector to a wider, sparse feature vector and back. Raw-neuron entries have
//! no weights: their "features" are the MLP neurons of a layer.
//!
//! # Weight Layout
//!
//! Each decoder is stored as a single safetensors file with:
//! - `W_enc`: shape `[d_in, d_sae]`
//! - `W_dec`: shape `[d_sae, d_in]`
//! - `b_enc`: shape `[d_sae]`
//! - `b_dec`: shape `[d_in]`
//!
//! plus a `cfg.json` next to it naming the hook point (`hook_name`).
//!
//! ```text
//! Encode:  features = ReLU((x - b_dec) @ W_enc + b_enc)
//! Steer:   direction(i) = W_dec[i, :]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use rand::{Rng, SeedableRng};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Source-set name reserved for raw-neuron entries.
pub const NEURONS_SET: &str = "neurons";

// If one of these appears in the set name, downstream attribution is enabled.
const ATTRIBUTION_SEGMENTS: [&str; 2] = ["att-", "att_"];

/// Composite decoder id: layer index plus source-set name.
///
/// Displays as `"5"` for the raw neurons of layer 5 and `"5-res-jb"` for
/// the trained decoder of set `res-jb` at layer 5.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DecoderId {
    pub layer: usize,
    pub set: String,
}

impl DecoderId {
    pub fn new(layer: usize, set: impl Into<String>) -> Self {
        Self {
            layer,
            set: set.into(),
        }
    }

    /// Id of the raw-neuron entry for a layer.
    pub fn neurons(layer: usize) -> Self {
        Self::new(layer, NEURONS_SET)
    }

    pub fn is_neurons(&self) -> bool {
        self.set == NEURONS_SET
    }
}

impl fmt::Display for DecoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_neurons() {
            write!(f, "{}", self.layer)
        } else {
            write!(f, "{}-{}", self.layer, self.set)
        }
    }
}

impl FromStr for DecoderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (layer, set) = match s.split_once('-') {
            Some((layer, set)) => (layer, set),
            None => (s, NEURONS_SET),
        };
        let layer: usize = layer
            .parse()
            .with_context(|| format!("Decoder id '{s}' must start with a layer number"))?;
        anyhow::ensure!(!set.is_empty(), "Decoder id '{s}' has an empty set name");
        Ok(Self::new(layer, set))
    }
}

impl From<DecoderId> for String {
    fn from(id: DecoderId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for DecoderId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Whether an entry is backed by trained weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecoderKind {
    RawNeuron,
    TrainedDecoder,
}

/// Catalog metadata for one decoder. Kept after the weights are unloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderDescriptor {
    pub id: DecoderId,
    /// Hook point the decoder reads from (and steering writes to)
    pub hook_name: String,
    pub kind: DecoderKind,
    /// Enables the downstream-attribution computation
    pub attribution_eligible: bool,
    /// Location understood by the weight source; empty for raw neurons
    pub catalog_ref: String,
}

impl DecoderDescriptor {
    /// Raw-neuron entry for a layer: no weights, reads the MLP post-activation.
    pub fn neurons(layer: usize) -> Self {
        Self {
            id: DecoderId::neurons(layer),
            hook_name: format!("blocks.{layer}.mlp.hook_post"),
            kind: DecoderKind::RawNeuron,
            attribution_eligible: false,
            catalog_ref: String::new(),
        }
    }

    /// Trained decoder entry. The hook name may be refined by the weight source on load.
    pub fn trained(id: DecoderId, hook_name: impl Into<String>, catalog_ref: impl Into<String>) -> Self {
        let attribution_eligible = ATTRIBUTION_SEGMENTS.iter().any(|seg| id.set.contains(seg));
        Self {
            id,
            hook_name: hook_name.into(),
            kind: DecoderKind::TrainedDecoder,
            attribution_eligible,
            catalog_ref: catalog_ref.into(),
        }
    }
}

/// Loaded decoder weights (the heavy resource).
#[derive(Debug)]
pub struct DecoderWeights {
    w_enc: Tensor, // [d_in, d_sae]
    w_dec: Tensor, // [d_sae, d_in]
    b_enc: Tensor, // [d_sae]
    b_dec: Tensor, // [d_in]
}

impl DecoderWeights {
    /// Build from tensors, checking the shapes agree.
    pub fn new(w_enc: Tensor, w_dec: Tensor, b_enc: Tensor, b_dec: Tensor) -> Result<Self> {
        let (d_in, d_sae) = w_enc.dims2()?;
        anyhow::ensure!(
            w_dec.dims() == [d_sae, d_in],
            "W_dec shape {:?} does not match W_enc shape [{d_in}, {d_sae}]",
            w_dec.dims()
        );
        anyhow::ensure!(b_enc.dims() == [d_sae], "b_enc must have shape [{d_sae}]");
        anyhow::ensure!(b_dec.dims() == [d_in], "b_dec must have shape [{d_in}]");
        Ok(Self {
            w_enc,
            w_dec,
            b_enc,
            b_dec,
        })
    }

    /// Input width (hook activation width).
    pub fn d_in(&self) -> usize {
        self.w_dec.dims()[1]
    }

    /// Number of features.
    pub fn d_sae(&self) -> usize {
        self.w_dec.dims()[0]
    }

    /// Encode activations of shape `(seq_len, d_in)` into `(seq_len, d_sae)` features.
    ///
    /// Computed in F32 regardless of the stored dtype.
    pub fn encode(&self, activations: &Tensor) -> Result<Tensor> {
        let x = activations.to_dtype(DType::F32)?;
        let w_enc = self.w_enc.to_dtype(DType::F32)?;
        let b_enc = self.b_enc.to_dtype(DType::F32)?;
        let b_dec = self.b_dec.to_dtype(DType::F32)?;

        let centered = x.broadcast_sub(&b_dec)?;
        let pre_acts = centered.matmul(&w_enc)?.broadcast_add(&b_enc)?;
        Ok(pre_acts.relu()?)
    }

    /// Decoder row for one feature: shape `(d_in,)`, F32.
    pub fn direction(&self, index: usize) -> Result<Tensor> {
        anyhow::ensure!(
            index < self.d_sae(),
            "Feature index {index} out of range (decoder has {} features)",
            self.d_sae()
        );
        Ok(self.w_dec.i(index)?.to_dtype(DType::F32)?)
    }

    /// Encoder column for one feature: shape `(d_in,)`, F32.
    pub fn encoder_column(&self, index: usize) -> Result<Tensor> {
        anyhow::ensure!(
            index < self.d_sae(),
            "Feature index {index} out of range (decoder has {} features)",
            self.d_sae()
        );
        Ok(self.w_enc.i((.., index))?.to_dtype(DType::F32)?)
    }

    /// Decoder rows for several features at once: shape `(n, d_in)`, F32.
    pub fn directions(&self, indices: &[usize]) -> Result<Tensor> {
        for &index in indices {
            anyhow::ensure!(
                index < self.d_sae(),
                "Feature index {index} out of range (decoder has {} features)",
                self.d_sae()
            );
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::new(ids.as_slice(), self.w_dec.device())?;
        Ok(self.w_dec.index_select(&ids, 0)?.to_dtype(DType::F32)?)
    }
}

/// Fetches decoder weights (may perform network I/O).
pub trait DecoderSource: Send + Sync {
    /// Load the weights for a catalog entry. Returns the weights and the hook
    /// name the decoder was trained on.
    fn load(&self, descriptor: &DecoderDescriptor, device: &Device) -> Result<(DecoderWeights, String)>;
}

#[derive(Deserialize)]
struct DecoderFileConfig {
    hook_name: String,
}

/// Read a decoder directory containing `sae_weights.safetensors` and `cfg.json`.
pub fn load_decoder_dir(dir: &Path, device: &Device) -> Result<(DecoderWeights, String)> {
    let cfg_path = dir.join("cfg.json");
    let cfg_text = std::fs::read_to_string(&cfg_path)
        .with_context(|| format!("Failed to read {}", cfg_path.display()))?;
    let cfg: DecoderFileConfig = serde_json::from_str(&cfg_text)
        .with_context(|| format!("Failed to parse {}", cfg_path.display()))?;

    let weights = load_weights_file(&dir.join("sae_weights.safetensors"), device)?;
    Ok((weights, cfg.hook_name))
}

/// Read the four decoder tensors from a safetensors file.
pub fn load_weights_file(path: &Path, device: &Device) -> Result<DecoderWeights> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;

    let get = |name: &str| -> Result<Tensor> {
        let view = st
            .tensor(name)
            .with_context(|| format!("Tensor '{name}' not found in {}", path.display()))?;
        tensor_from_view(&view, device)
    };

    DecoderWeights::new(get("W_enc")?, get("W_dec")?, get("b_enc")?, get("b_dec")?)
}

/// Loads decoders from HuggingFace.
///
/// `catalog_ref` has the form `"<repo_id>:<path/in/repo>"`; the path names a
/// directory holding `sae_weights.safetensors` and `cfg.json`.
pub struct HubDecoderSource;

impl DecoderSource for HubDecoderSource {
    fn load(&self, descriptor: &DecoderDescriptor, device: &Device) -> Result<(DecoderWeights, String)> {
        let (repo_id, path) = descriptor.catalog_ref.split_once(':').with_context(|| {
            format!(
                "Catalog ref '{}' for {} must be '<repo>:<path>'",
                descriptor.catalog_ref, descriptor.id
            )
        })?;
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        info!("Downloading decoder {} from {repo_id}", descriptor.id);
        let weights_path = repo
            .get(&format!("{path}/sae_weights.safetensors"))
            .with_context(|| format!("Failed to download weights for {}", descriptor.id))?;
        repo.get(&format!("{path}/cfg.json"))
            .with_context(|| format!("Failed to download cfg.json for {}", descriptor.id))?;

        let dir = weights_path
            .parent()
            .map(Path::to_path_buf)
            .context("Downloaded weights have no parent directory")?;
        load_decoder_dir(&dir, device)
    }
}

/// Loads decoders from a local directory tree: `catalog_ref` is a relative path.
pub struct DirectoryDecoderSource {
    root: PathBuf,
}

impl DirectoryDecoderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DecoderSource for DirectoryDecoderSource {
    fn load(&self, descriptor: &DecoderDescriptor, device: &Device) -> Result<(DecoderWeights, String)> {
        load_decoder_dir(&self.root.join(&descriptor.catalog_ref), device)
    }
}

/// Generates seeded random weights. Used by the CLI demo and the tests.
///
/// Weights depend only on the seed and the decoder id, so reloading an
/// evicted decoder yields the same tensors.
pub struct SyntheticDecoderSource {
    d_in: usize,
    d_sae: usize,
    seed: u64,
}

impl SyntheticDecoderSource {
    pub fn new(d_in: usize, d_sae: usize, seed: u64) -> Self {
        Self { d_in, d_sae, seed }
    }
}

impl DecoderSource for SyntheticDecoderSource {
    fn load(&self, descriptor: &DecoderDescriptor, device: &Device) -> Result<(DecoderWeights, String)> {
        let mut id_hash = self.seed;
        for b in descriptor.id.to_string().bytes() {
            id_hash = id_hash.wrapping_mul(31).wrapping_add(u64::from(b));
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(id_hash);
        let mut sample = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
        };

        let scale = 1.0 / (self.d_in as f32).sqrt();
        let w_enc = Tensor::from_vec(sample(self.d_in * self.d_sae, scale), (self.d_in, self.d_sae), device)?;
        let w_dec = Tensor::from_vec(sample(self.d_sae * self.d_in, 1.0), (self.d_sae, self.d_in), device)?;
        let b_enc = Tensor::zeros((self.d_sae,), DType::F32, device)?;
        let b_dec = Tensor::zeros((self.d_in,), DType::F32, device)?;

        let weights = DecoderWeights::new(w_enc, w_dec, b_enc, b_dec)?;
        Ok((weights, descriptor.hook_name.clone()))
    }
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported decoder tensor dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

/// Save decoder tensors in the on-disk layout read by [`load_decoder_dir`].
pub fn save_decoder_dir(dir: &Path, weights: &DecoderWeights, hook_name: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let tensors: HashMap<&str, Tensor> = HashMap::from([
        ("W_enc", weights.w_enc.clone()),
        ("W_dec", weights.w_dec.clone()),
        ("b_enc", weights.b_enc.clone()),
        ("b_dec", weights.b_dec.clone()),
    ]);
    candle_core::safetensors::save(&tensors, dir.join("sae_weights.safetensors"))?;
    let cfg = serde_json::json!({ "hook_name": hook_name });
    std::fs::write(dir.join("cfg.json"), serde_json::to_string_pretty(&cfg)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_id_display_and_parse() {
        let id: DecoderId = "5-res-jb".parse().unwrap();
        assert_eq!(id, DecoderId::new(5, "res-jb"));
        assert_eq!(id.to_string(), "5-res-jb");

        let neurons: DecoderId = "7".parse().unwrap();
        assert!(neurons.is_neurons());
        assert_eq!(neurons.to_string(), "7");

        assert!("res-jb".parse::<DecoderId>().is_err());
        assert!("3-".parse::<DecoderId>().is_err());
    }

    #[test]
    fn test_decoder_id_serde_as_string() {
        let id = DecoderId::new(3, "att-kk");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"3-att-kk\"");
        let back: DecoderId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_attribution_flag_from_set_name() {
        let att = DecoderDescriptor::trained(DecoderId::new(7, "att-kk"), "blocks.7.attn.hook_z", "");
        assert!(att.attribution_eligible);
        let res = DecoderDescriptor::trained(DecoderId::new(7, "res-jb"), "blocks.7.hook_resid_pre", "");
        assert!(!res.attribution_eligible);
        assert!(!DecoderDescriptor::neurons(7).attribution_eligible);
    }

    #[test]
    fn test_encode_is_relu_of_affine() {
        let device = Device::Cpu;
        // d_in = 2, d_sae = 2, W_enc = identity, b_dec = [1, 0]
        let w_enc = Tensor::new(&[[1f32, 0.], [0., 1.]], &device).unwrap();
        let w_dec = Tensor::new(&[[1f32, 0.], [0., 1.]], &device).unwrap();
        let b_enc = Tensor::new(&[0f32, 0.], &device).unwrap();
        let b_dec = Tensor::new(&[1f32, 0.], &device).unwrap();
        let weights = DecoderWeights::new(w_enc, w_dec, b_enc, b_dec).unwrap();

        let x = Tensor::new(&[[3f32, -2.], [0., 5.]], &device).unwrap();
        let feats: Vec<Vec<f32>> = weights.encode(&x).unwrap().to_vec2().unwrap();
        assert_eq!(feats, vec![vec![2.0, 0.0], vec![0.0, 5.0]]);
    }

    #[test]
    fn test_direction_bounds() {
        let source = SyntheticDecoderSource::new(4, 8, 1);
        let desc = DecoderDescriptor::trained(DecoderId::new(0, "res"), "blocks.0.hook_resid_post", "");
        let (weights, hook) = source.load(&desc, &Device::Cpu).unwrap();
        assert_eq!(hook, "blocks.0.hook_resid_post");
        assert_eq!(weights.direction(7).unwrap().dims(), &[4]);
        assert!(weights.direction(8).is_err());
        assert_eq!(weights.directions(&[1, 3]).unwrap().dims(), &[2, 4]);
    }

    #[test]
    fn test_synthetic_source_is_deterministic() {
        let source = SyntheticDecoderSource::new(4, 8, 42);
        let desc = DecoderDescriptor::trained(DecoderId::new(1, "res"), "h", "");
        let (a, _) = source.load(&desc, &Device::Cpu).unwrap();
        let (b, _) = source.load(&desc, &Device::Cpu).unwrap();
        let a: Vec<f32> = a.direction(2).unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.direction(2).unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_directory_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let synthetic = SyntheticDecoderSource::new(4, 6, 3);
        let desc = DecoderDescriptor::trained(DecoderId::new(2, "res"), "blocks.2.hook_resid_post", "layer_2");
        let (weights, _) = synthetic.load(&desc, &Device::Cpu).unwrap();
        save_decoder_dir(&dir.path().join("layer_2"), &weights, "blocks.2.hook_resid_pre").unwrap();

        let source = DirectoryDecoderSource::new(dir.path());
        let (loaded, hook) = source.load(&desc, &Device::Cpu).unwrap();
        assert_eq!(hook, "blocks.2.hook_resid_pre");
        assert_eq!(loaded.d_in(), 4);
        assert_eq!(loaded.d_sae(), 6);
        let expected: Vec<f32> = weights.direction(5).unwrap().to_vec1().unwrap();
        let got: Vec<f32> = loaded.direction(5).unwrap().to_vec1().unwrap();
        assert_eq!(expected, got);
    }

    #[test]
    fn test_hub_source_rejects_malformed_ref() {
        let desc = DecoderDescriptor::trained(DecoderId::new(0, "res"), "h", "no-colon-here");
        assert!(HubDecoderSource.load(&desc, &Device::Cpu).is_err());
    }
}
