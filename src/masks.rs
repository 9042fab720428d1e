//! Mask utilities
//!
//! - Cached causal attention masks used by the reference model's attention.
//! - Per-position steering masks for chat prompts: special tokens are left
//!   unsteered so the turn structure stays intact.
//!
//! ## Caching Strategy
//!
//! Causal masks are cached by `(seq_len, device_id, dtype)`. Generation
//! recomputes the full context every step, so the same handful of sizes is
//! requested over and over. Cached tensors are returned as shallow clones.
//! At most [`MAX_CACHED_MASKS`] masks are kept; the least recently used one
//! is dropped first.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

use crate::lru::RecencyList;

/// Upper bound on cached causal masks across all devices and dtypes.
pub const MAX_CACHED_MASKS: usize = 64;

type MaskKey = (usize, usize, DType);

#[derive(Default)]
struct MaskCache {
    masks: HashMap<MaskKey, Tensor>,
    order: RecencyList<MaskKey>,
}

impl MaskCache {
    fn get(&mut self, key: &MaskKey) -> Option<Tensor> {
        let mask = self.masks.get(key)?.clone();
        self.order.touch(key);
        Some(mask)
    }

    fn insert(&mut self, key: MaskKey, mask: Tensor) {
        self.masks.insert(key, mask);
        self.order.push(key);
        while self.order.len() > MAX_CACHED_MASKS {
            match self.order.pop_lru() {
                Some(evicted) => {
                    self.masks.remove(&evicted);
                }
                None => break,
            }
        }
    }
}

static CAUSAL_MASK_CACHE: LazyLock<Mutex<MaskCache>> = LazyLock::new(|| Mutex::new(MaskCache::default()));

/// Positions zeroed after a start-of-turn marker, the marker included.
pub const START_OF_TURN_WINDOW: usize = 3;
/// Positions zeroed after an end-of-turn marker, the marker included.
pub const END_OF_TURN_WINDOW: usize = 2;

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn mask_cache() -> MutexGuard<'static, MaskCache> {
    CAUSAL_MASK_CACHE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Some(cached) = mask_cache().get(&cache_key) {
        return Ok(cached);
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    mask_cache().insert(cache_key, mask_tensor.clone());
    Ok(mask_tensor)
}

/// Clear all cached causal masks
pub fn clear_mask_caches() {
    let mut cache = mask_cache();
    cache.masks.clear();
    cache.order.clear();
}

/// Number of cached causal masks
pub fn mask_cache_size() -> usize {
    mask_cache().masks.len()
}

/// Token ids that delimit chat turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub bos: Option<u32>,
    pub start_of_turn: Option<u32>,
    pub end_of_turn: Option<u32>,
}

/// Per-position steering mask: 1.0 where steering applies, 0.0 where it is skipped.
///
/// Zeroes beginning-of-sequence positions, each start-of-turn marker plus the
/// two positions after it (role name and newline), and each end-of-turn
/// marker plus the newline after it. With `steer_special_tokens` the mask is
/// all ones.
pub fn special_token_mask(tokens: &[u32], special: &SpecialTokenIds, steer_special_tokens: bool) -> Vec<f32> {
    let mut mask = vec![1.0f32; tokens.len()];
    if steer_special_tokens {
        return mask;
    }

    let mut zero_window = |start: usize, width: usize| {
        let end = (start + width).min(mask.len());
        mask[start..end].iter_mut().for_each(|m| *m = 0.0);
    };

    for (pos, &token) in tokens.iter().enumerate() {
        if Some(token) == special.bos {
            zero_window(pos, 1);
        } else if Some(token) == special.start_of_turn {
            zero_window(pos, START_OF_TURN_WINDOW);
        } else if Some(token) == special.end_of_turn {
            zero_window(pos, END_OF_TURN_WINDOW);
        }
    }
    mask
}
