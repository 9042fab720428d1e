//! Forward-pass engine contract
//!
//! The engine owns tokenization, layer computation, hook dispatch and the
//! sampling loop. The core only talks to it through [`ForwardEngine`].
//!
//! Hooks are registered through [`HookRegistry::register`], which returns a
//! [`HookGuard`]; the hooks stay active exactly as long as the guard lives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::cache::ForwardActivations;

/// Interception function applied to the tensor at a hook point.
///
/// Receives `(batch, seq_len, width)` and returns a tensor of the same shape.
pub type HookFn = Arc<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>;

/// Lazy sequence of generated token chunks.
///
/// Each item holds, per batch row, the tokens produced since the previous
/// item (at most `tokens_per_yield`; empty for rows that already stopped).
pub type TokenStream<'a> = Box<dyn Iterator<Item = Result<Vec<Vec<u32>>>> + 'a>;

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    /// 0.0 = greedy
    pub temperature: f32,
    pub freq_penalty: f32,
    /// Every call re-seeds from this value
    pub seed: u64,
    pub tokens_per_yield: usize,
    pub stop_at_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            temperature: 0.0,
            freq_penalty: 0.0,
            seed: 0,
            tokens_per_yield: 1,
            stop_at_eos: true,
        }
    }
}

/// Contract of the shared, stateful forward-pass engine.
pub trait ForwardEngine: Send + Sync {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn d_mlp(&self) -> usize;
    fn device(&self) -> &Device;

    // --- Tokens ---
    fn tokenize(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>>;
    fn detokenize(&self, tokens: &[u32]) -> Result<String>;
    /// Id of a named special token, if the vocabulary has it.
    fn token_id(&self, token: &str) -> Option<u32>;

    // --- Computation ---
    /// Run one sequence, recording every hook point up to `stop_at_layer` (exclusive).
    fn forward(&self, tokens: &[u32], stop_at_layer: Option<usize>) -> Result<ForwardActivations>;

    /// Autoregressive generation over a batch of equal-length prompts.
    ///
    /// Registered hooks apply at every step.
    fn generate_stream<'a>(&'a self, batch: &[Vec<u32>], params: &SamplingParams) -> Result<TokenStream<'a>>;

    fn hooks(&self) -> &HookRegistry;
}

struct RegisteredHook {
    id: u64,
    hook: HookFn,
}

/// Hook-point table of an engine.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<HashMap<String, Vec<RegisteredHook>>>,
    next_id: AtomicU64,
}

/// Keeps a set of hooks registered. Dropping it unregisters them.
#[must_use = "hooks are removed as soon as the guard is dropped"]
pub struct HookGuard<'a> {
    registry: &'a HookRegistry,
    ids: Vec<u64>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<RegisteredHook>>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register hooks for the lifetime of the returned guard.
    pub fn register(&self, hooks: Vec<(String, HookFn)>) -> HookGuard<'_> {
        let mut table = self.table();
        let mut ids = Vec::with_capacity(hooks.len());
        for (name, hook) in hooks {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            table.entry(name).or_default().push(RegisteredHook { id, hook });
            ids.push(id);
        }
        HookGuard { registry: self, ids }
    }

    /// Run every hook registered at `hook_name` in registration order.
    ///
    /// Returns the input unchanged when nothing is registered.
    pub fn apply(&self, hook_name: &str, tensor: &Tensor) -> Result<Tensor> {
        let hooks: Vec<HookFn> = match self.table().get(hook_name) {
            Some(registered) => registered.iter().map(|r| Arc::clone(&r.hook)).collect(),
            None => return Ok(tensor.clone()),
        };
        let mut out = tensor.clone();
        for hook in hooks {
            out = hook(&out)?;
        }
        Ok(out)
    }

    /// Whether any hook is registered at `hook_name`.
    pub fn contains(&self, hook_name: &str) -> bool {
        self.table().contains_key(hook_name)
    }

    /// Number of registered hooks across all hook points.
    pub fn len(&self) -> usize {
        self.table().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, ids: &[u64]) {
        let mut table = self.table();
        for registered in table.values_mut() {
            registered.retain(|r| !ids.contains(&r.id));
        }
        table.retain(|_, registered| !registered.is_empty());
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.ids);
    }
}
