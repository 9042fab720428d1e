//! Steered generation
//!
//! Runs one steering request against the engine and streams envelopes.
//!
//! ## Flow
//!
//! ```text
//! resolve features -> build interventions -> batched dual | sequential -> stream -> done
//!                                                 |  on failure
//!                                                 +-----> sequential
//! ```
//!
//! When both a steered and a default continuation are requested, a single
//! batch of two rows is generated first: row 0 carries the intervention and
//! row 1 is the untouched baseline. If that attempt fails for any reason the
//! branches are regenerated one after the other, in the order of the type
//! list, each re-seeded from the request seed.
//!
//! Every emitted envelope holds the accumulated text of every requested
//! branch, so the last envelope is the complete result.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SpecialTokenNames;
use crate::decoder::DecoderId;
use crate::engine::{ForwardEngine, HookFn, SamplingParams};
use crate::error::{SteerError, SteerResult};
use crate::intervention::{
    build_interventions, resolve_features, resolve_vectors, steering_hooks, validate_vector, InterventionSpec,
    PositionSelector, SteerMethod, SteeringFeature, SteeringVector,
};
use crate::masks::{special_token_mask, SpecialTokenIds};
use crate::registry::DecoderHandle;

/// Which continuation a branch produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SteerType {
    Steered,
    Default,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Prompt of a steering request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SteerPrompt {
    Text(String),
    Chat(Vec<ChatMessage>),
}

fn default_strength_multiplier() -> f32 {
    1.0
}

fn default_completion_tokens() -> usize {
    32
}

/// A steering request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteerRequest {
    pub prompt: SteerPrompt,
    pub types: Vec<SteerType>,
    #[serde(default)]
    pub features: Option<Vec<SteeringFeature>>,
    #[serde(default)]
    pub vectors: Option<Vec<SteeringVector>>,
    #[serde(default = "default_strength_multiplier")]
    pub strength_multiplier: f32,
    #[serde(default = "default_completion_tokens")]
    pub n_completion_tokens: usize,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub freq_penalty: f32,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub steer_method: SteerMethod,
    #[serde(default)]
    pub normalize_steering: bool,
    /// Chat only: also steer turn markers and `<bos>`
    #[serde(default)]
    pub steer_special_tokens: bool,
}

impl SteerRequest {
    /// Steered-vs-default request over a plain-text prompt.
    pub fn text(prompt: impl Into<String>, features: Vec<SteeringFeature>) -> Self {
        Self::with_prompt(SteerPrompt::Text(prompt.into()), features)
    }

    /// Steered-vs-default request over a chat prompt.
    pub fn chat(messages: Vec<ChatMessage>, features: Vec<SteeringFeature>) -> Self {
        Self::with_prompt(SteerPrompt::Chat(messages), features)
    }

    fn with_prompt(prompt: SteerPrompt, features: Vec<SteeringFeature>) -> Self {
        Self {
            prompt,
            types: vec![SteerType::Steered, SteerType::Default],
            features: Some(features),
            vectors: None,
            strength_multiplier: default_strength_multiplier(),
            n_completion_tokens: default_completion_tokens(),
            temperature: 0.0,
            freq_penalty: 0.0,
            seed: 0,
            steer_method: SteerMethod::SimpleAdditive,
            normalize_steering: false,
            steer_special_tokens: false,
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self.prompt, SteerPrompt::Chat(_))
    }

    /// Shape checks that need neither the engine nor the registry.
    pub fn validate(&self) -> SteerResult<()> {
        if self.types.is_empty() {
            return Err(SteerError::InvalidRequest("at least one steer type is required".to_string()));
        }
        if self.types.iter().enumerate().any(|(i, t)| self.types[..i].contains(t)) {
            return Err(SteerError::InvalidRequest("steer types must not repeat".to_string()));
        }
        match (&self.features, &self.vectors) {
            (Some(features), None) if !features.is_empty() => {
                for feature in features {
                    if let Some(values) = &feature.steering_vector {
                        validate_vector(values, self.normalize_steering)?;
                    }
                }
            }
            (None, Some(vectors)) if !vectors.is_empty() => {
                for vector in vectors {
                    validate_vector(&vector.steering_vector, self.normalize_steering)?;
                }
            }
            _ => {
                return Err(SteerError::InvalidRequest(
                    "exactly one of features or vectors must be provided".to_string(),
                ))
            }
        }
        if self.n_completion_tokens == 0 {
            return Err(SteerError::InvalidRequest("n_completion_tokens must be positive".to_string()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SteerError::InvalidRequest("temperature must be non-negative".to_string()));
        }
        Ok(())
    }

    pub fn sampling_params(&self, tokens_per_yield: usize) -> SamplingParams {
        SamplingParams {
            max_new_tokens: self.n_completion_tokens,
            temperature: self.temperature,
            freq_penalty: self.freq_penalty,
            seed: self.seed,
            tokens_per_yield,
            stop_at_eos: true,
        }
    }
}

/// Render chat turns with the turn template, leaving a model turn open.
pub fn render_chat(messages: &[ChatMessage], special: &SpecialTokenNames) -> String {
    let mut text = String::new();
    for message in messages {
        let role = if message.role == "assistant" { "model" } else { message.role.as_str() };
        text.push_str(&format!(
            "{}{role}\n{}{}\n",
            special.start_of_turn, message.content, special.end_of_turn
        ));
    }
    text.push_str(&format!("{}model\n", special.start_of_turn));
    text
}

/// Split rendered chat text back into turns.
///
/// Text before the first turn marker is dropped; an unterminated last turn
/// (a continuation still being generated) is included.
pub fn parse_chat(text: &str, special: &SpecialTokenNames) -> Vec<ChatMessage> {
    text.split(special.start_of_turn.as_str())
        .skip(1)
        .map(|turn| {
            let (role, rest) = turn.split_once('\n').unwrap_or((turn, ""));
            let content = rest.split(special.end_of_turn.as_str()).next().unwrap_or(rest);
            let role = if role.trim() == "model" { "assistant" } else { role.trim() };
            ChatMessage::new(role, content.trim())
        })
        .collect()
}

/// Tokenize a request prompt.
pub fn encode_prompt(engine: &dyn ForwardEngine, prompt: &SteerPrompt, special: &SpecialTokenNames) -> SteerResult<Vec<u32>> {
    let text = match prompt {
        SteerPrompt::Text(text) => text.clone(),
        SteerPrompt::Chat(messages) => render_chat(messages, special),
    };
    Ok(engine.tokenize(&text, true)?)
}

/// Output of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteerOutput {
    #[serde(rename = "type")]
    pub steer_type: SteerType,
    pub output: String,
    /// Chat requests: `output` parsed back into turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<Vec<ChatMessage>>,
}

/// Snapshot of every requested branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteerEnvelope {
    pub outputs: Vec<SteerOutput>,
}

impl SteerEnvelope {
    pub fn output(&self, steer_type: SteerType) -> Option<&SteerOutput> {
        self.outputs.iter().find(|o| o.steer_type == steer_type)
    }
}

/// How a generation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    /// The consumer stopped accepting envelopes
    Cancelled,
}

/// Everything needed to run one request against the engine.
#[derive(Debug, Clone)]
pub struct SteeringPlan {
    pub prompt_tokens: Vec<u32>,
    pub types: Vec<SteerType>,
    pub specs: Vec<InterventionSpec>,
    pub method: SteerMethod,
    pub params: SamplingParams,
    /// Set for chat prompts
    pub chat: Option<SpecialTokenNames>,
    pub bos_token: Option<u32>,
}

/// Resolve features and build interventions for a validated request.
///
/// `load` materializes decoders, so the caller must hold the concurrency gate.
pub fn plan_steering(
    engine: &dyn ForwardEngine,
    load: &mut dyn FnMut(&DecoderId) -> SteerResult<DecoderHandle>,
    request: &SteerRequest,
    prompt_tokens: Vec<u32>,
    special: &SpecialTokenNames,
    tokens_per_yield: usize,
) -> SteerResult<SteeringPlan> {
    let resolved = match (&request.features, &request.vectors) {
        (Some(features), _) => resolve_features(load, features, engine.d_mlp(), engine.device())?,
        (None, Some(vectors)) => resolve_vectors(vectors, engine.device())?,
        (None, None) => {
            return Err(SteerError::InvalidRequest(
                "exactly one of features or vectors must be provided".to_string(),
            ))
        }
    };

    let positions = if request.is_chat() && !request.steer_special_tokens {
        let ids = SpecialTokenIds {
            bos: engine.token_id(&special.bos),
            start_of_turn: engine.token_id(&special.start_of_turn),
            end_of_turn: engine.token_id(&special.end_of_turn),
        };
        PositionSelector::Masked(special_token_mask(&prompt_tokens, &ids, false).into())
    } else {
        PositionSelector::All
    };

    let specs = build_interventions(
        resolved,
        request.strength_multiplier,
        request.normalize_steering,
        &positions,
    )?;

    Ok(SteeringPlan {
        prompt_tokens,
        types: request.types.clone(),
        specs,
        method: request.steer_method,
        params: request.sampling_params(tokens_per_yield),
        chat: request.is_chat().then(|| special.clone()),
        bos_token: engine.token_id(&special.bos),
    })
}

#[derive(Default)]
struct Accumulated {
    steered: Vec<u32>,
    default: Vec<u32>,
}

impl Accumulated {
    fn slot(&mut self, steer_type: SteerType) -> &mut Vec<u32> {
        match steer_type {
            SteerType::Steered => &mut self.steered,
            SteerType::Default => &mut self.default,
        }
    }

    fn get(&self, steer_type: SteerType) -> &[u32] {
        match steer_type {
            SteerType::Steered => &self.steered,
            SteerType::Default => &self.default,
        }
    }
}

impl SteeringPlan {
    pub fn is_dual(&self) -> bool {
        self.types.contains(&SteerType::Steered) && self.types.contains(&SteerType::Default)
    }

    /// Prompt tokens echoed at the start of every output. Plain-text outputs
    /// drop the leading `<bos>`; chat outputs keep the full rendering.
    fn echoed_prompt(&self) -> &[u32] {
        match (self.chat.as_ref(), self.prompt_tokens.split_first()) {
            (None, Some((&first, rest))) if Some(first) == self.bos_token => rest,
            _ => &self.prompt_tokens,
        }
    }

    fn envelope(&self, engine: &dyn ForwardEngine, acc: &Accumulated) -> anyhow::Result<SteerEnvelope> {
        let echoed = self.echoed_prompt();
        let outputs = self
            .types
            .iter()
            .map(|&steer_type| {
                let mut tokens = echoed.to_vec();
                tokens.extend_from_slice(acc.get(steer_type));
                let output = engine.detokenize(&tokens)?;
                let chat_template = self.chat.as_ref().map(|special| parse_chat(&output, special));
                Ok(SteerOutput {
                    steer_type,
                    output,
                    chat_template,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(SteerEnvelope { outputs })
    }
}

/// Run a plan, handing each envelope to `emit`.
///
/// `emit` returns false once the consumer is gone; generation then stops
/// and the run reports [`GenerationOutcome::Cancelled`]. Hooks are removed
/// on every exit path.
pub fn run_steering(
    engine: &dyn ForwardEngine,
    plan: &SteeringPlan,
    emit: &mut dyn FnMut(SteerEnvelope) -> bool,
) -> SteerResult<GenerationOutcome> {
    let hooks = steering_hooks(plan.specs.clone(), plan.method, &[0])?;

    if plan.is_dual() {
        match run_batched_dual(engine, plan, &hooks, emit) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => warn!("Batched dual generation failed, falling back to sequential: {e:#}"),
        }
    }
    run_sequential(engine, plan, &hooks, emit)
}

fn run_batched_dual(
    engine: &dyn ForwardEngine,
    plan: &SteeringPlan,
    hooks: &[(String, HookFn)],
    emit: &mut dyn FnMut(SteerEnvelope) -> bool,
) -> anyhow::Result<GenerationOutcome> {
    let _guard = engine.hooks().register(hooks.to_vec());
    let batch = [plan.prompt_tokens.clone(), plan.prompt_tokens.clone()];
    let mut acc = Accumulated::default();

    for chunk in engine.generate_stream(&batch, &plan.params)? {
        let chunk = chunk?;
        anyhow::ensure!(chunk.len() == 2, "Expected 2 rows from batched generation, got {}", chunk.len());
        acc.steered.extend_from_slice(&chunk[0]);
        acc.default.extend_from_slice(&chunk[1]);
        if !emit(plan.envelope(engine, &acc)?) {
            return Ok(GenerationOutcome::Cancelled);
        }
    }
    Ok(GenerationOutcome::Completed)
}

fn run_sequential(
    engine: &dyn ForwardEngine,
    plan: &SteeringPlan,
    hooks: &[(String, HookFn)],
    emit: &mut dyn FnMut(SteerEnvelope) -> bool,
) -> SteerResult<GenerationOutcome> {
    let mut acc = Accumulated::default();
    let prompt = [plan.prompt_tokens.clone()];

    for &steer_type in &plan.types {
        info!("Generating {steer_type:?} branch");
        let _guard = (steer_type == SteerType::Steered).then(|| engine.hooks().register(hooks.to_vec()));
        for chunk in engine.generate_stream(&prompt, &plan.params)? {
            let row = chunk?.into_iter().next().unwrap_or_default();
            acc.slot(steer_type).extend(row);
            if !emit(plan.envelope(engine, &acc)?) {
                return Ok(GenerationOutcome::Cancelled);
            }
        }
    }
    Ok(GenerationOutcome::Completed)
}
