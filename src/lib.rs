// Pedantic clippy configuration for tensor/serving code
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in tensor math
#![allow(clippy::cast_possible_truncation)] // usize→u32 in token ids
#![allow(clippy::module_name_repetitions)] // DecoderRegistry in registry.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! sae-steer: resident decoders, activation caching and steering
//!
//! The core of a model-inference server that lets callers read and steer the
//! intermediate computations of a language model through sparse feature
//! decoders.
//!
//! ## Architecture
//!
//! - `error`: Typed error taxonomy (client errors vs engine failures)
//! - `config`: Server configuration (TOML + environment overrides)
//! - `lru`: Recency order shared by the resident set and the activation cache
//! - `decoder`: Decoder ids, descriptors, weights and weight sources
//! - `registry`: Decoder catalog and LRU resident set
//! - `cache`: Content-addressed activation cache with a derived sub-cache
//! - `attribution`: Per-source-position attribution for attention decoders
//! - `gate`: Single-flight concurrency gate around the engine
//! - `engine`: Forward-pass engine contract and scoped hook registry
//! - `masks`: Causal and special-token masks
//! - `intervention`: Feature resolution, interventions and steering hooks
//! - `steering`: Batched dual-branch generation with a sequential fallback
//! - `reference_model`: Small deterministic candle transformer implementing the engine
//! - `service`: The service context tying everything together

pub mod attribution;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod gate;
pub mod intervention;
pub mod lru;
pub mod masks;
pub mod reference_model;
pub mod registry;
pub mod service;
pub mod steering;

pub use attribution::Attribution;
pub use cache::{ActivationCache, CacheKey, CacheStats, ForwardActivations};
pub use config::{DecoderSetConfig, ServerConfig, SpecialTokenNames};
pub use decoder::{
    DecoderDescriptor, DecoderId, DecoderKind, DecoderSource, DecoderWeights, DirectoryDecoderSource,
    HubDecoderSource, SyntheticDecoderSource,
};
pub use engine::{ForwardEngine, HookFn, HookGuard, HookRegistry, SamplingParams, TokenStream};
pub use error::{SteerError, SteerResult};
pub use gate::{ConcurrencyGate, GateGuard};
pub use intervention::{
    build_interventions, resolve_features, steering_hooks, InterventionSpec, OrthogonalProjector, PositionSelector,
    SteerMethod, SteeringFeature, SteeringVector,
};
pub use masks::{clear_mask_caches, create_causal_mask, special_token_mask, SpecialTokenIds};
pub use reference_model::{ReferenceConfig, ReferenceModel};
pub use registry::{DecoderHandle, DecoderRegistry, FetchedDecoder, PendingLoad, Resolution, ResidentStats};
pub use service::{
    ActivationQuery, EnvelopeStream, FeatureActivations, RankedFeature, ScoredFeature, ServiceStatus, SteeringService,
    TokenTopFeatures, TopFeatures, TopFeaturesQuery, TopkByToken, TopkByTokenQuery, VectorQuery,
};
pub use steering::{
    parse_chat, render_chat, run_steering, ChatMessage, GenerationOutcome, SteerEnvelope, SteerOutput, SteerPrompt,
    SteerRequest, SteerType, SteeringPlan,
};
