//! Inference service context
//!
//! Wires the shared engine, the decoder registry, the activation cache and
//! the concurrency gate into one explicitly constructed object. Every
//! operation validates its request first, then acquires the gate and runs the
//! engine work on the blocking pool while holding it.
//!
//! The registry and cache mutexes are only held for bookkeeping. Decoder
//! weights are fetched with the registry unlocked, so status reads and
//! admission checks never wait on I/O.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::attribution::{direct_feature_attribution, Attribution};
use crate::cache::{ActivationCache, CacheStats, ForwardActivations};
use crate::config::ServerConfig;
use crate::decoder::{DecoderId, DecoderSource};
use crate::engine::ForwardEngine;
use crate::error::{SteerError, SteerResult};
use crate::gate::{ConcurrencyGate, GateGuard};
use crate::intervention::validate_vector;
use crate::registry::{DecoderHandle, DecoderRegistry, Resolution, ResidentStats};
use crate::steering::{encode_prompt, plan_steering, run_steering, GenerationOutcome, SteerEnvelope, SteerRequest};

/// Query for one feature's per-token activations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationQuery {
    pub prompt: String,
    pub source: DecoderId,
    pub index: usize,
}

/// Per-token activation of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureActivations {
    pub tokens: Vec<String>,
    pub values: Vec<f32>,
    pub max_value: f32,
    pub max_value_index: usize,
    /// Set for attention decoders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dfa: Option<Attribution>,
}

/// Query projecting the activations at `hook` onto a caller-supplied vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    pub prompt: String,
    pub hook: String,
    pub vector: Vec<f32>,
}

fn default_num_results() -> usize {
    10
}

/// Query ranking the features of several decoders over one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopFeaturesQuery {
    pub prompt: String,
    pub sources: Vec<DecoderId>,
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    /// Drop features whose strongest position is the BOS token
    #[serde(default)]
    pub ignore_bos: bool,
    /// Rank by the summed activation over these positions instead of the max
    #[serde(default)]
    pub sort_by_token_indexes: Vec<usize>,
    /// Only rank these feature indices; needs exactly one source
    #[serde(default)]
    pub feature_filter: Option<Vec<usize>>,
}

impl TopFeaturesQuery {
    fn validate(&self) -> SteerResult<()> {
        if self.sources.is_empty() {
            return Err(SteerError::InvalidRequest("at least one source is required".to_string()));
        }
        if self.num_results == 0 {
            return Err(SteerError::InvalidRequest("num_results must be positive".to_string()));
        }
        if self.feature_filter.is_some() && self.sources.len() != 1 {
            return Err(SteerError::InvalidRequest(
                "feature_filter can only be used with a single source".to_string(),
            ));
        }
        Ok(())
    }
}

/// One feature ranked by [`SteeringService::top_features`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFeature {
    pub source: DecoderId,
    pub index: usize,
    pub values: Vec<f32>,
    /// Zero unless ranking by token positions
    pub sum_values: f32,
    pub max_value: f32,
    pub max_value_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dfa: Option<Attribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopFeatures {
    pub tokens: Vec<String>,
    /// Strongest first
    pub activations: Vec<RankedFeature>,
    /// Active feature count per token, one row per distinct source in query order
    pub counts: Vec<Vec<u32>>,
}

fn default_top_k() -> usize {
    5
}

/// Query for the strongest features of one decoder at every token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopkByTokenQuery {
    pub prompt: String,
    pub source: DecoderId,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub ignore_bos: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFeature {
    pub feature_index: usize,
    pub activation_value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTopFeatures {
    pub token: String,
    /// Counted after any skipped BOS token
    pub token_position: usize,
    pub top_features: Vec<ScoredFeature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopkByToken {
    pub tokens: Vec<String>,
    pub results: Vec<TokenTopFeatures>,
}

/// Advisory snapshot; read without the gate.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub busy: bool,
    pub cache: CacheStats,
    pub decoders: ResidentStats,
}

/// Stream of steering envelopes. The last item is the complete result; an
/// `Err` item ends the stream.
pub type EnvelopeStream = mpsc::Receiver<SteerResult<SteerEnvelope>>;

struct Candidate {
    source: usize,
    index: usize,
    max_value: f32,
    max_value_index: usize,
    sum_values: f32,
}

pub struct SteeringService {
    engine: Arc<dyn ForwardEngine>,
    registry: Mutex<DecoderRegistry>,
    cache: Mutex<ActivationCache>,
    gate: ConcurrencyGate,
    config: ServerConfig,
}

impl SteeringService {
    /// Build the service with a catalog taken from the configured decoder sets.
    pub fn new(engine: Arc<dyn ForwardEngine>, source: Arc<dyn DecoderSource>, config: ServerConfig) -> Arc<Self> {
        let mut registry = DecoderRegistry::new(
            engine.n_layers(),
            config.max_loaded_decoders,
            source,
            engine.device().clone(),
        );
        for descriptor in config.decoder_descriptors() {
            registry.register(descriptor);
        }
        Self::with_registry(engine, registry, config)
    }

    /// Build the service around an already populated registry.
    pub fn with_registry(engine: Arc<dyn ForwardEngine>, registry: DecoderRegistry, config: ServerConfig) -> Arc<Self> {
        info!(
            "Steering service ready: {} layers, {} catalog entries, cache of {}",
            engine.n_layers(),
            registry.stats().catalog_size,
            config.activation_cache_entries
        );
        Arc::new(Self {
            cache: Mutex::new(ActivationCache::new(config.activation_cache_entries)),
            registry: Mutex::new(registry),
            gate: ConcurrencyGate::new(),
            engine,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ForwardEngine> {
        &self.engine
    }

    fn registry(&self) -> MutexGuard<'_, DecoderRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, ActivationCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_token_limit(&self, tokens: &[u32]) -> SteerResult<()> {
        if tokens.len() > self.config.token_limit {
            return Err(SteerError::InvalidRequest(format!(
                "prompt has {} tokens, limit is {}",
                tokens.len(),
                self.config.token_limit
            )));
        }
        Ok(())
    }

    /// Tokenize with BOS and enforce the token limit.
    fn prompt_tokens(&self, prompt: &str) -> SteerResult<Vec<u32>> {
        let tokens = self.engine.tokenize(prompt, true)?;
        self.check_token_limit(&tokens)?;
        Ok(tokens)
    }

    fn starts_with_bos(&self, tokens: &[u32]) -> bool {
        let bos = self.engine.token_id(&self.config.special_tokens.bos);
        bos.is_some() && tokens.first().copied() == bos
    }

    fn str_tokens(&self, tokens: &[u32]) -> SteerResult<Vec<String>> {
        Ok(tokens
            .iter()
            .map(|&t| self.engine.detokenize(&[t]))
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    /// Truncation depth for a pass that must reach `layer`.
    fn stop_depth(&self, layer: usize) -> Option<usize> {
        (layer + 1 < self.engine.n_layers()).then_some(layer + 1)
    }

    /// Run `work` on the blocking pool while holding the gate.
    async fn run_gated<T, F>(self: &Arc<Self>, guard: GateGuard, work: F) -> SteerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SteeringService) -> SteerResult<T> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            work(&this)
        })
        .await
        .map_err(|e| SteerError::Engine(anyhow!("worker task failed: {e}")))?
    }

    /// Materialize a decoder, fetching weights with the registry unlocked.
    ///
    /// Only called under the gate, so no other load of the same id races it.
    fn load_decoder(&self, id: &DecoderId) -> SteerResult<DecoderHandle> {
        let pending = match self.registry().resolve(id)? {
            Resolution::Ready(handle) => return Ok(handle),
            Resolution::Load(pending) => pending,
        };
        let fetched = pending.fetch()?;
        self.registry().install(fetched)
    }

    /// Forward pass for `tokens`, from the cache or the engine.
    fn forward_cached(
        &self,
        tokens: &[u32],
        layer: usize,
        stop_depth: Option<usize>,
    ) -> SteerResult<Arc<ForwardActivations>> {
        let cached = self.cache().get(tokens, layer, stop_depth);
        if let Some(activations) = cached {
            return Ok(activations);
        }
        let computed = self.engine.forward(tokens, stop_depth)?;
        Ok(self.cache().put(tokens, layer, stop_depth, computed))
    }

    /// `(seq_len, width)` features of `handle`, memoized per cache entry.
    fn encoded_features(
        &self,
        tokens: &[u32],
        layer: usize,
        stop_depth: Option<usize>,
        handle: &DecoderHandle,
    ) -> SteerResult<Tensor> {
        let derived = self.cache().get_derived(tokens, layer, handle.id(), stop_depth);
        if let Some(features) = derived {
            return Ok(features);
        }
        let activations = self.forward_cached(tokens, layer, stop_depth)?;
        let hook_activations = activations.require(handle.hook_name())?;
        if hook_activations.rank() != 2 {
            return Err(SteerError::InvalidFeature(format!(
                "{} reads {}, which is not a per-token activation",
                handle.id(),
                handle.hook_name()
            )));
        }
        let features = match &handle.weights {
            Some(weights) => weights.encode(hook_activations)?,
            None => hook_activations.to_dtype(DType::F32)?,
        };
        self.cache()
            .put_derived(tokens, layer, handle.id(), features.clone(), stop_depth);
        Ok(features)
    }

    /// Attention attribution for eligible decoders, from the cached pass.
    fn attribution(
        &self,
        tokens: &[u32],
        layer: usize,
        stop_depth: Option<usize>,
        handle: &DecoderHandle,
        index: usize,
        target: usize,
    ) -> SteerResult<Option<Attribution>> {
        let Some(weights) = handle.weights.as_ref().filter(|_| handle.descriptor.attribution_eligible) else {
            return Ok(None);
        };
        let activations = self.forward_cached(tokens, layer, stop_depth)?;
        let column = weights.encoder_column(index)?;
        let dfa = direct_feature_attribution(&activations, handle.id().layer, &column, target)?;
        Ok(Some(dfa))
    }

    /// Load the starting resident set.
    pub async fn preload(self: &Arc<Self>) -> SteerResult<usize> {
        let guard = self.gate.acquire().await?;
        self.run_gated(guard, |service| {
            let starting = service.registry().starting_set();
            for id in &starting {
                service.load_decoder(id)?;
            }
            info!("Preloaded {} decoders", starting.len());
            Ok(starting.len())
        })
        .await
    }

    /// Per-token activations of one decoder feature.
    pub async fn activations(self: &Arc<Self>, query: ActivationQuery) -> SteerResult<FeatureActivations> {
        let tokens = self.prompt_tokens(&query.prompt)?;
        self.registry().check_capacity([&query.source])?;

        let guard = self.gate.acquire().await?;
        self.run_gated(guard, move |service| {
            service.feature_activations(&tokens, &query).map_err(log_failure)
        })
        .await
    }

    fn feature_activations(&self, tokens: &[u32], query: &ActivationQuery) -> SteerResult<FeatureActivations> {
        let handle = self.load_decoder(&query.source)?;
        let layer = query.source.layer;
        let stop_depth = self.stop_depth(layer);
        let features = self.encoded_features(tokens, layer, stop_depth, &handle)?;

        let width = features.dim(1)?;
        if query.index >= width {
            return Err(SteerError::InvalidFeature(format!(
                "index {} out of range for {} (width {width})",
                query.index, query.source
            )));
        }
        let values: Vec<f32> = features.i((.., query.index))?.to_vec1()?;
        let (max_value_index, max_value) = argmax(&values);
        let dfa = self.attribution(tokens, layer, stop_depth, &handle, query.index, max_value_index)?;

        Ok(FeatureActivations {
            tokens: self.str_tokens(tokens)?,
            values,
            max_value,
            max_value_index,
            dfa,
        })
    }

    /// Per-token dot products of the activations at a hook point with a custom vector.
    pub async fn vector_activations(self: &Arc<Self>, query: VectorQuery) -> SteerResult<FeatureActivations> {
        if query.vector.is_empty() {
            return Err(SteerError::InvalidRequest("vector must not be empty".to_string()));
        }
        validate_vector(&query.vector, false)?;
        let tokens = self.prompt_tokens(&query.prompt)?;

        let guard = self.gate.acquire().await?;
        self.run_gated(guard, move |service| {
            service.vector_projection(&tokens, &query).map_err(log_failure)
        })
        .await
    }

    fn vector_projection(&self, tokens: &[u32], query: &VectorQuery) -> SteerResult<FeatureActivations> {
        // Full pass, keyed like last-layer queries so they share it
        let last = self.engine.n_layers().saturating_sub(1);
        let activations = self.forward_cached(tokens, last, None)?;
        let hooked = activations
            .get(&query.hook)
            .ok_or_else(|| SteerError::InvalidRequest(format!("unknown hook point {}", query.hook)))?;
        let width = match hooked.dims() {
            [_, width] => *width,
            dims => {
                return Err(SteerError::InvalidRequest(format!(
                    "hook point {} has shape {dims:?}, expected (seq_len, width)",
                    query.hook
                )))
            }
        };
        if width != query.vector.len() {
            return Err(SteerError::InvalidRequest(format!(
                "vector has {} values but {} has width {width}",
                query.vector.len(),
                query.hook
            )));
        }

        let vector = Tensor::new(query.vector.as_slice(), hooked.device())?.unsqueeze(1)?;
        let values: Vec<f32> = hooked.to_dtype(DType::F32)?.matmul(&vector)?.squeeze(1)?.to_vec1()?;
        let (max_value_index, max_value) = argmax(&values);
        Ok(FeatureActivations {
            tokens: self.str_tokens(tokens)?,
            values,
            max_value,
            max_value_index,
            dfa: None,
        })
    }

    /// Strongest features across several decoders, from one forward pass.
    pub async fn top_features(self: &Arc<Self>, query: TopFeaturesQuery) -> SteerResult<TopFeatures> {
        query.validate()?;
        let tokens = self.prompt_tokens(&query.prompt)?;
        if let Some(position) = query.sort_by_token_indexes.iter().find(|&&p| p >= tokens.len()) {
            return Err(SteerError::InvalidRequest(format!(
                "sort position {position} out of range for a prompt of {} tokens",
                tokens.len()
            )));
        }
        self.registry().check_capacity(&query.sources)?;

        let guard = self.gate.acquire().await?;
        self.run_gated(guard, move |service| {
            service.rank_features(&tokens, &query).map_err(log_failure)
        })
        .await
    }

    fn rank_features(&self, tokens: &[u32], query: &TopFeaturesQuery) -> SteerResult<TopFeatures> {
        // Deep enough for every source; all of them read this one pass
        let layer = query.sources.iter().map(|s| s.layer).max().unwrap_or(0);
        let stop_depth = self.stop_depth(layer);

        let mut seen = HashSet::new();
        let mut sources: Vec<(DecoderHandle, Tensor)> = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut counts = Vec::new();
        for id in query.sources.iter().filter(|id| seen.insert(*id)) {
            let handle = self.load_decoder(id)?;
            let features = self.encoded_features(tokens, layer, stop_depth, &handle)?;
            let width = features.dim(1)?;

            let rows: Vec<Vec<f32>> = features.to_vec2()?;
            counts.push(rows.iter().map(|row| row.iter().filter(|v| **v > 0.0).count() as u32).collect());

            let max_values: Vec<f32> = features.max(0)?.to_vec1()?;
            let max_indices: Vec<u32> = features.argmax(0)?.to_vec1()?;
            let sums: Vec<f32> = if query.sort_by_token_indexes.is_empty() {
                vec![0.0; width]
            } else {
                let positions: Vec<u32> = query.sort_by_token_indexes.iter().map(|&p| p as u32).collect();
                let positions = Tensor::new(positions.as_slice(), features.device())?;
                features.index_select(&positions, 0)?.sum(0)?.to_vec1()?
            };

            let indices: Vec<usize> = match &query.feature_filter {
                Some(filter) => {
                    if let Some(bad) = filter.iter().find(|&&i| i >= width) {
                        return Err(SteerError::InvalidFeature(format!(
                            "index {bad} out of range for {id} (width {width})"
                        )));
                    }
                    filter.clone()
                }
                None => (0..width).collect(),
            };
            candidates.extend(indices.into_iter().map(|index| Candidate {
                source: sources.len(),
                index,
                max_value: max_values[index],
                max_value_index: max_indices[index] as usize,
                sum_values: sums[index],
            }));
            sources.push((handle, features));
        }

        let by_sum = !query.sort_by_token_indexes.is_empty();
        let score = |c: &Candidate| if by_sum { c.sum_values } else { c.max_value };
        candidates.sort_by(|a, b| score(b).total_cmp(&score(a)));
        if query.ignore_bos && self.starts_with_bos(tokens) {
            candidates.retain(|c| c.max_value_index != 0);
        }
        candidates.truncate(query.num_results);
        debug!("Ranked {} features over {} sources", candidates.len(), sources.len());

        let activations = candidates
            .iter()
            .map(|c| -> SteerResult<RankedFeature> {
                let (handle, features) = &sources[c.source];
                let values: Vec<f32> = features.i((.., c.index))?.to_vec1()?;
                let dfa = self.attribution(tokens, layer, stop_depth, handle, c.index, c.max_value_index)?;
                Ok(RankedFeature {
                    source: handle.id().clone(),
                    index: c.index,
                    values,
                    sum_values: c.sum_values,
                    max_value: c.max_value,
                    max_value_index: c.max_value_index,
                    dfa,
                })
            })
            .collect::<SteerResult<Vec<_>>>()?;

        Ok(TopFeatures {
            tokens: self.str_tokens(tokens)?,
            activations,
            counts,
        })
    }

    /// The `top_k` strongest features of one decoder at every token.
    pub async fn topk_by_token(self: &Arc<Self>, query: TopkByTokenQuery) -> SteerResult<TopkByToken> {
        if query.top_k == 0 {
            return Err(SteerError::InvalidRequest("top_k must be positive".to_string()));
        }
        let tokens = self.prompt_tokens(&query.prompt)?;
        self.registry().check_capacity([&query.source])?;

        let guard = self.gate.acquire().await?;
        self.run_gated(guard, move |service| {
            service.token_top_features(&tokens, &query).map_err(log_failure)
        })
        .await
    }

    fn token_top_features(&self, tokens: &[u32], query: &TopkByTokenQuery) -> SteerResult<TopkByToken> {
        let handle = self.load_decoder(&query.source)?;
        let layer = query.source.layer;
        let features = self.encoded_features(tokens, layer, self.stop_depth(layer), &handle)?;
        let width = features.dim(1)?;
        if query.top_k > width {
            return Err(SteerError::InvalidRequest(format!(
                "top_k {} exceeds the {width} features of {}",
                query.top_k, query.source
            )));
        }

        let skip = usize::from(query.ignore_bos && self.starts_with_bos(tokens));
        let str_tokens = self.str_tokens(tokens)?;
        let rows: Vec<Vec<f32>> = features.to_vec2()?;
        let results = rows
            .iter()
            .zip(&str_tokens)
            .skip(skip)
            .enumerate()
            .map(|(token_position, (row, token))| {
                let mut order: Vec<usize> = (0..row.len()).collect();
                order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
                TokenTopFeatures {
                    token: token.clone(),
                    token_position,
                    top_features: order
                        .into_iter()
                        .take(query.top_k)
                        .map(|feature_index| ScoredFeature {
                            feature_index,
                            activation_value: row[feature_index],
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(TopkByToken {
            tokens: str_tokens[skip..].to_vec(),
            results,
        })
    }

    /// Start a steering request. Envelopes arrive on the returned channel,
    /// one buffered at a time; dropping the receiver cancels generation and
    /// releases the gate.
    pub async fn steer(self: &Arc<Self>, request: SteerRequest) -> SteerResult<EnvelopeStream> {
        request.validate()?;
        if let Some(features) = &request.features {
            self.registry().check_capacity(features.iter().map(|f| &f.source))?;
        }
        let special = &self.config.special_tokens;
        let tokens = encode_prompt(self.engine.as_ref(), &request.prompt, special)?;
        self.check_token_limit(&tokens)?;

        let guard = self.gate.acquire().await?;
        let (tx, rx) = mpsc::channel(1);
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            match this.run_steering_blocking(&request, tokens, &tx) {
                Ok(GenerationOutcome::Completed) => debug!("Steering request completed"),
                Ok(GenerationOutcome::Cancelled) => info!("Steering consumer went away, generation stopped"),
                Err(e) => {
                    if tx.blocking_send(Err(log_failure(e))).is_err() {
                        debug!("Steering consumer went away before the error was delivered");
                    }
                }
            }
        });
        Ok(rx)
    }

    fn run_steering_blocking(
        &self,
        request: &SteerRequest,
        tokens: Vec<u32>,
        tx: &mpsc::Sender<SteerResult<SteerEnvelope>>,
    ) -> SteerResult<GenerationOutcome> {
        let tokens_per_yield = if request.is_chat() {
            self.config.chat_tokens_per_yield
        } else {
            self.config.tokens_per_yield
        };
        let plan = plan_steering(
            self.engine.as_ref(),
            &mut |id| self.load_decoder(id),
            request,
            tokens,
            &self.config.special_tokens,
            tokens_per_yield,
        )?;
        run_steering(self.engine.as_ref(), &plan, &mut |envelope| {
            tx.blocking_send(Ok(envelope)).is_ok()
        })
    }

    /// Run a steering request to completion and return the final envelope.
    pub async fn steer_collect(self: &Arc<Self>, request: SteerRequest) -> SteerResult<SteerEnvelope> {
        let mut stream = self.steer(request).await?;
        let mut last = None;
        while let Some(item) = stream.recv().await {
            last = Some(item?);
        }
        last.ok_or_else(|| SteerError::Engine(anyhow!("generation produced no output")))
    }

    /// Release a decoder's weights. Returns true if it was resident.
    pub async fn unload_decoder(self: &Arc<Self>, id: DecoderId) -> SteerResult<bool> {
        if self.registry().descriptor(&id).is_none() {
            return Err(SteerError::UnknownDecoder(id.to_string()));
        }
        let _guard = self.gate.acquire().await?;
        Ok(self.registry().unload(&id))
    }

    pub async fn clear_cache(self: &Arc<Self>) -> SteerResult<()> {
        let _guard = self.gate.acquire().await?;
        self.cache().clear();
        Ok(())
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            busy: self.gate.is_busy(),
            cache: self.cache().stats(),
            decoders: self.registry().stats(),
        }
    }

    /// Stop admitting requests. In-flight work finishes normally.
    pub fn shutdown(&self) {
        info!("Steering service shutting down");
        self.gate.close();
    }
}

/// Position and value of the first maximum.
fn argmax(values: &[f32]) -> (usize, f32) {
    values
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
}

fn log_failure(err: SteerError) -> SteerError {
    if let SteerError::Engine(inner) = &err {
        error!("Engine failure: {inner:#}");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecoderDescriptor, SyntheticDecoderSource};
    use crate::intervention::SteeringFeature;
    use crate::reference_model::{ReferenceConfig, ReferenceModel};
    use candle_core::Device;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    /// Synthetic weights, but each load announces itself and then waits to be released.
    struct SlowSource {
        inner: SyntheticDecoderSource,
        started: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl DecoderSource for SlowSource {
        fn load(
            &self,
            descriptor: &DecoderDescriptor,
            device: &Device,
        ) -> anyhow::Result<(crate::decoder::DecoderWeights, String)> {
            self.started.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv_timeout(Duration::from_secs(30))?;
            self.inner.load(descriptor, device)
        }
    }

    fn service(max_resident: usize) -> Arc<SteeringService> {
        service_with_source(Arc::new(SyntheticDecoderSource::new(32, 16, 11)), max_resident)
    }

    fn service_with_source(source: Arc<dyn DecoderSource>, max_resident: usize) -> Arc<SteeringService> {
        let engine = Arc::new(ReferenceModel::new(ReferenceConfig::default(), &Device::Cpu).unwrap());
        let mut registry = DecoderRegistry::new(4, max_resident, source, Device::Cpu);
        for layer in 0..4 {
            registry.register(DecoderDescriptor::trained(
                DecoderId::new(layer, "res"),
                format!("blocks.{layer}.hook_resid_post"),
                "",
            ));
        }
        let config = ServerConfig {
            max_loaded_decoders: max_resident,
            activation_cache_entries: 2,
            ..ServerConfig::default()
        };
        SteeringService::with_registry(engine, registry, config)
    }

    fn query(layer: usize, index: usize) -> ActivationQuery {
        ActivationQuery {
            prompt: "hello world".to_string(),
            source: DecoderId::new(layer, "res"),
            index,
        }
    }

    #[tokio::test]
    async fn test_activations_reuse_cached_forward_pass() {
        let service = service(2);
        let first = service.activations(query(1, 3)).await.unwrap();
        assert_eq!(first.tokens.len(), first.values.len());
        assert_eq!(first.tokens[0], "<bos>");
        assert!(first.values.iter().all(|v| *v >= 0.0));
        assert_eq!(first.max_value, first.values[first.max_value_index]);

        let second = service.activations(query(1, 3)).await.unwrap();
        assert_eq!(first, second);
        let stats = service.status().cache;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries[0].derived_entries, 1);
    }

    #[tokio::test]
    async fn test_activations_for_raw_neurons() {
        let service = service(2);
        let result = service.activations(ActivationQuery {
            prompt: "abc".to_string(),
            source: DecoderId::neurons(3),
            index: 63,
        })
        .await
        .unwrap();
        assert_eq!(result.values.len(), 4);
        // Last layer: no truncation
        assert!(service.status().cache.entries[0].key.ends_with("_full"));
    }

    #[tokio::test]
    async fn test_activations_errors() {
        let service = service(2);
        let unknown = service.activations(ActivationQuery {
            prompt: "abc".to_string(),
            source: DecoderId::new(0, "missing"),
            index: 0,
        })
        .await;
        assert!(matches!(unknown, Err(SteerError::UnknownDecoder(_))));

        let out_of_range = service.activations(query(0, 99)).await;
        assert!(matches!(out_of_range, Err(SteerError::InvalidFeature(_))));
        assert!(!service.status().busy);
    }

    #[tokio::test]
    async fn test_token_limit_is_checked_before_the_gate() {
        let service = service(2);
        let long = "x".repeat(service.config().token_limit + 5);
        let _held = service.gate.try_acquire().unwrap();
        let result = service.activations(ActivationQuery {
            prompt: long,
            source: DecoderId::new(0, "res"),
            index: 0,
        })
        .await;
        assert!(matches!(result, Err(SteerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_capacity_rejected_before_loading() {
        let service = service(1);
        let features = (0..2)
            .map(|layer| SteeringFeature {
                source: DecoderId::new(layer, "res"),
                index: 0,
                strength: 1.0,
                steering_vector: None,
                ablate: false,
            })
            .collect();
        let result = service.steer(SteerRequest::text("hi", features)).await;
        assert!(matches!(
            result,
            Err(SteerError::CapacityExceeded { requested: 2, max: 1 })
        ));
        assert_eq!(service.status().decoders.loads, 0);
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let service = service(2);
        service.activations(query(2, 0)).await.unwrap();
        assert_eq!(service.status().decoders.resident, vec!["2-res".to_string()]);

        assert!(service.unload_decoder(DecoderId::new(2, "res")).await.unwrap());
        assert!(!service.unload_decoder(DecoderId::new(2, "res")).await.unwrap());
        assert!(service.status().decoders.resident.is_empty());
        assert!(matches!(
            service.unload_decoder(DecoderId::new(9, "res")).await,
            Err(SteerError::UnknownDecoder(_))
        ));

        service.clear_cache().await.unwrap();
        assert_eq!(service.status().cache.size, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_answers_while_a_decoder_loads() {
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let source = Arc::new(SlowSource {
            inner: SyntheticDecoderSource::new(32, 16, 11),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let service = service_with_source(source, 2);

        let worker = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.activations(query(1, 3)).await })
        };
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .expect("load never started");

        // The load is parked inside the source
        let status = {
            let service = Arc::clone(&service);
            tokio::time::timeout(Duration::from_secs(5), tokio::task::spawn_blocking(move || service.status()))
        };
        let status = match status.await {
            Ok(status) => status.unwrap(),
            Err(_) => {
                release_tx.send(()).unwrap();
                panic!("status blocked behind a decoder load");
            }
        };
        assert!(status.busy);
        assert!(status.decoders.resident.is_empty());
        assert_eq!(status.decoders.loads, 0);

        release_tx.send(()).unwrap();
        let result = worker.await.unwrap().unwrap();
        assert_eq!(result.values.len(), 12);
        let status = service.status();
        assert!(!status.busy);
        assert_eq!(status.decoders.resident, vec!["1-res".to_string()]);
        assert_eq!(status.decoders.loads, 1);
    }

    #[tokio::test]
    async fn test_failed_steering_plan_reaches_the_stream() {
        let service = service(2);
        let bad = SteeringFeature {
            source: DecoderId::new(1, "res"),
            index: 999,
            strength: 1.0,
            steering_vector: None,
            ablate: false,
        };
        let mut stream = service.steer(SteerRequest::text("hi", vec![bad.clone()])).await.unwrap();
        assert!(matches!(stream.recv().await, Some(Err(SteerError::InvalidFeature(_)))));
        assert!(stream.recv().await.is_none());

        // Nobody listening for the error: the worker still finishes and frees the gate
        drop(service.steer(SteerRequest::text("hi", vec![bad])).await.unwrap());
        let freed = tokio::time::timeout(Duration::from_secs(10), async {
            while service.status().busy {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(freed.is_ok());
        assert!(service.activations(query(1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let service = service(2);
        service.shutdown();
        assert!(matches!(service.clear_cache().await, Err(SteerError::ShuttingDown)));
    }
}
