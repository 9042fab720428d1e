//! Decoder catalog and resident-set manager
//!
//! Tracks every known decoder and keeps at most `max_resident` trained
//! decoders loaded, evicting the least recently used one when a load pushes
//! the set over capacity. Raw-neuron entries are synthesized for every layer
//! at construction; they have no weights, are always resident and never count
//! against the capacity.
//!
//! The registry does no locking of its own. Loading is split into
//! [`resolve`][DecoderRegistry::resolve], [`PendingLoad::fetch`] and
//! [`install`][DecoderRegistry::install] so a caller sharing the registry
//! behind a lock can release it while weights are read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::decoder::{DecoderDescriptor, DecoderId, DecoderKind, DecoderSource, DecoderWeights};
use crate::error::{SteerError, SteerResult};
use crate::lru::RecencyList;

/// A materialized catalog entry handed to request handlers.
#[derive(Debug, Clone)]
pub struct DecoderHandle {
    pub descriptor: DecoderDescriptor,
    /// `None` for raw-neuron entries
    pub weights: Option<Arc<DecoderWeights>>,
}

impl DecoderHandle {
    pub fn id(&self) -> &DecoderId {
        &self.descriptor.id
    }

    pub fn hook_name(&self) -> &str {
        &self.descriptor.hook_name
    }

    pub fn is_neurons(&self) -> bool {
        self.descriptor.kind == DecoderKind::RawNeuron
    }
}

/// Outcome of [`DecoderRegistry::resolve`].
pub enum Resolution {
    /// Raw neurons or a resident hit
    Ready(DecoderHandle),
    /// Weights must be fetched, then handed to [`DecoderRegistry::install`]
    Load(PendingLoad),
}

/// Everything needed to fetch one decoder's weights without the registry.
pub struct PendingLoad {
    descriptor: DecoderDescriptor,
    source: Arc<dyn DecoderSource>,
    device: Device,
}

impl PendingLoad {
    pub fn id(&self) -> &DecoderId {
        &self.descriptor.id
    }

    /// Read the weights from the decoder source.
    pub fn fetch(&self) -> SteerResult<FetchedDecoder> {
        let id = self.id();
        info!("Loading decoder: {id}");
        let start = Instant::now();
        let (weights, hook_name) = self.source.load(&self.descriptor, &self.device).map_err(|e| {
            error!("Failed to load decoder {id}: {e:#}");
            SteerError::Engine(e)
        })?;
        debug!("Fetched decoder {id} in {:.2}s", start.elapsed().as_secs_f64());
        Ok(FetchedDecoder {
            id: id.clone(),
            weights: Arc::new(weights),
            hook_name,
        })
    }
}

/// Weights read by [`PendingLoad::fetch`], not yet resident.
pub struct FetchedDecoder {
    id: DecoderId,
    weights: Arc<DecoderWeights>,
    hook_name: String,
}

struct CatalogEntry {
    descriptor: DecoderDescriptor,
    weights: Option<Arc<DecoderWeights>>,
}

/// Introspection snapshot for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentStats {
    /// Resident trained decoders, least recently used first
    pub resident: Vec<String>,
    pub max_resident: usize,
    pub catalog_size: usize,
    pub loads: u64,
    pub evictions: u64,
}

/// Catalog of decoders plus the LRU-bounded resident set.
pub struct DecoderRegistry {
    catalog: HashMap<DecoderId, CatalogEntry>,
    catalog_order: Vec<DecoderId>,
    resident: RecencyList<DecoderId>,
    max_resident: usize,
    source: Arc<dyn DecoderSource>,
    device: Device,
    loads: u64,
    evictions: u64,
}

impl DecoderRegistry {
    /// Create an empty resident set with raw-neuron entries for `0..n_layers`.
    pub fn new(n_layers: usize, max_resident: usize, source: Arc<dyn DecoderSource>, device: Device) -> Self {
        let mut registry = Self {
            catalog: HashMap::new(),
            catalog_order: Vec::new(),
            resident: RecencyList::new(),
            max_resident: max_resident.max(1),
            source,
            device,
            loads: 0,
            evictions: 0,
        };
        for layer in 0..n_layers {
            registry.register(DecoderDescriptor::neurons(layer));
        }
        registry
    }

    /// Add (or replace the metadata of) a catalog entry.
    ///
    /// Raw-neuron entries are fixed: a descriptor colliding with one is
    /// ignored. Returns false when the descriptor was not registered.
    pub fn register(&mut self, descriptor: DecoderDescriptor) -> bool {
        let id = descriptor.id.clone();
        match self.catalog.get_mut(&id) {
            Some(entry) if entry.descriptor.kind == DecoderKind::RawNeuron => {
                warn!("Refusing to replace raw-neuron entry {id} with {:?}", descriptor.kind);
                return false;
            }
            Some(entry) => entry.descriptor = descriptor,
            None => {
                self.catalog_order.push(id.clone());
                self.catalog.insert(
                    id,
                    CatalogEntry {
                        descriptor,
                        weights: None,
                    },
                );
            }
        }
        true
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    /// Return the handle for `id`, loading it (and evicting the LRU entry) if needed.
    pub fn get(&mut self, id: &DecoderId) -> SteerResult<DecoderHandle> {
        match self.resolve(id)? {
            Resolution::Ready(handle) => Ok(handle),
            Resolution::Load(pending) => {
                let fetched = pending.fetch()?;
                self.install(fetched)
            }
        }
    }

    /// Return the handle for `id` if no I/O is needed, touching resident hits.
    pub fn resolve(&mut self, id: &DecoderId) -> SteerResult<Resolution> {
        let entry = self.catalog.get(id).ok_or_else(|| SteerError::unknown(id))?;

        if entry.descriptor.kind == DecoderKind::RawNeuron {
            return Ok(Resolution::Ready(DecoderHandle {
                descriptor: entry.descriptor.clone(),
                weights: None,
            }));
        }

        if let Some(weights) = entry.weights.as_ref().filter(|_| self.resident.contains(id)) {
            let handle = DecoderHandle {
                descriptor: entry.descriptor.clone(),
                weights: Some(Arc::clone(weights)),
            };
            self.resident.touch(id);
            return Ok(Resolution::Ready(handle));
        }

        Ok(Resolution::Load(PendingLoad {
            descriptor: entry.descriptor.clone(),
            source: Arc::clone(&self.source),
            device: self.device.clone(),
        }))
    }

    /// Make fetched weights resident, evicting the LRU entry when over capacity.
    ///
    /// If the decoder became resident while the weights were being fetched,
    /// the new weights replace the old ones and no load is counted.
    pub fn install(&mut self, fetched: FetchedDecoder) -> SteerResult<DecoderHandle> {
        let FetchedDecoder {
            id,
            weights,
            hook_name,
        } = fetched;
        let entry = self
            .catalog
            .get_mut(&id)
            .ok_or_else(|| SteerError::unknown(&id))?;
        entry.descriptor.hook_name = hook_name;
        entry.weights = Some(Arc::clone(&weights));
        let handle = DecoderHandle {
            descriptor: entry.descriptor.clone(),
            weights: Some(weights),
        };

        if self.resident.contains(&id) {
            self.resident.touch(&id);
            return Ok(handle);
        }

        self.resident.push(id.clone());
        self.loads += 1;
        if self.resident.len() > self.max_resident {
            if let Some(lru) = self.resident.peek_lru().cloned() {
                info!("Resident set over capacity ({}), evicting {lru}", self.max_resident);
                self.unload(&lru);
                self.evictions += 1;
            }
        }

        info!(
            "Loaded decoder {id} ({}/{} resident)",
            self.resident.len(),
            self.max_resident
        );
        Ok(handle)
    }

    /// Release the weights of `id` and drop it from the resident order.
    ///
    /// Idempotent; catalog metadata is kept. Returns true if weights were released.
    pub fn unload(&mut self, id: &DecoderId) -> bool {
        let released = match self.catalog.get_mut(id) {
            Some(entry) => entry.weights.take().is_some(),
            None => false,
        };
        self.resident.remove(id);
        if released {
            info!("Unloaded decoder: {id}");
        }
        released
    }

    /// The first `max_resident` trained decoders in catalog order.
    pub fn starting_set(&self) -> Vec<DecoderId> {
        self.catalog_order
            .iter()
            .filter(|id| !id.is_neurons())
            .take(self.max_resident)
            .cloned()
            .collect()
    }

    /// Load the starting set.
    pub fn preload(&mut self) -> SteerResult<usize> {
        let starting = self.starting_set();
        for id in &starting {
            self.get(id)?;
        }
        info!("Preloaded {} decoders", starting.len());
        Ok(starting.len())
    }

    /// Reject requests needing more distinct trained decoders than can be resident.
    ///
    /// Also rejects unknown ids, so this runs before any loading work.
    pub fn check_capacity<'a>(&self, ids: impl IntoIterator<Item = &'a DecoderId>) -> SteerResult<()> {
        let mut trained = HashSet::new();
        for id in ids {
            let entry = self.catalog.get(id).ok_or_else(|| SteerError::unknown(id))?;
            if entry.descriptor.kind == DecoderKind::TrainedDecoder {
                trained.insert(id);
            }
        }
        if trained.len() > self.max_resident {
            return Err(SteerError::CapacityExceeded {
                requested: trained.len(),
                max: self.max_resident,
            });
        }
        Ok(())
    }

    /// Resident trained decoders, least recently used first.
    pub fn list_resident(&self) -> Vec<DecoderId> {
        self.resident.iter().cloned().collect()
    }

    /// Raw-neuron entries always count as resident.
    pub fn is_resident(&self, id: &DecoderId) -> bool {
        match self.catalog.get(id) {
            Some(entry) if entry.descriptor.kind == DecoderKind::RawNeuron => true,
            Some(_) => self.resident.contains(id),
            None => false,
        }
    }

    /// Catalog ids in registration order.
    pub fn catalog_ids(&self) -> Vec<DecoderId> {
        self.catalog_order.clone()
    }

    pub fn descriptor(&self, id: &DecoderId) -> Option<&DecoderDescriptor> {
        self.catalog.get(id).map(|e| &e.descriptor)
    }

    pub fn stats(&self) -> ResidentStats {
        ResidentStats {
            resident: self.resident.iter().map(ToString::to_string).collect(),
            max_resident: self.max_resident,
            catalog_size: self.catalog.len(),
            loads: self.loads,
            evictions: self.evictions,
        }
    }
}
