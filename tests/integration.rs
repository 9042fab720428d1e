//! End-to-end tests for sae-steer
//!
//! Everything runs on the CPU reference model with synthetic decoders, so no
//! network access or GPU is needed.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use candle_core::Device;
use sae_steer::decoder::save_decoder_dir;
use sae_steer::{
    ActivationQuery, ChatMessage, DecoderDescriptor, DecoderId, DecoderRegistry, DecoderSource,
    DirectoryDecoderSource, ForwardActivations, ForwardEngine, HookRegistry, ReferenceConfig, ReferenceModel,
    SamplingParams, ServerConfig, SteerEnvelope, SteerError, SteerMethod, SteerRequest, SteerType, SteeringFeature,
    SteeringService, SteeringVector, SyntheticDecoderSource, TokenStream, TopFeaturesQuery, TopkByTokenQuery,
    VectorQuery,
};
use tempfile::{NamedTempFile, TempDir};

const D_MODEL: usize = 32;

fn reference_model() -> ReferenceModel {
    ReferenceModel::new(ReferenceConfig::default(), &Device::Cpu).unwrap()
}

fn registry() -> DecoderRegistry {
    let source = Arc::new(SyntheticDecoderSource::new(D_MODEL, 48, 5));
    let mut registry = DecoderRegistry::new(4, 8, source, Device::Cpu);
    for layer in 0..4 {
        registry.register(DecoderDescriptor::trained(
            DecoderId::new(layer, "res"),
            format!("blocks.{layer}.hook_resid_post"),
            "",
        ));
    }
    registry.register(DecoderDescriptor::trained(
        DecoderId::new(1, "att-kk"),
        "blocks.1.attn.hook_z",
        "",
    ));
    registry
}

fn service_with(engine: Arc<dyn ForwardEngine>) -> Arc<SteeringService> {
    SteeringService::with_registry(engine, registry(), ServerConfig::default())
}

fn service() -> Arc<SteeringService> {
    service_with(Arc::new(reference_model()))
}

fn feature(layer: usize, index: usize, strength: f32) -> SteeringFeature {
    SteeringFeature {
        source: DecoderId::new(layer, "res"),
        index,
        strength,
        steering_vector: None,
        ablate: false,
    }
}

fn sampled_request(prompt: &str) -> SteerRequest {
    let mut request = SteerRequest::text(prompt, vec![feature(1, 7, 6.0)]);
    request.n_completion_tokens = 8;
    request.temperature = 0.8;
    request.seed = 7;
    request
}

fn output_of(envelope: &SteerEnvelope, steer_type: SteerType) -> String {
    envelope
        .output(steer_type)
        .map(|o| o.output.clone())
        .unwrap_or_default()
}

/// Reference model whose batched generation fails, either up front or after
/// the first chunk.
struct FlakyBatchEngine {
    inner: ReferenceModel,
    fail_mid_stream: bool,
    batched_attempts: AtomicUsize,
}

impl FlakyBatchEngine {
    fn new(fail_mid_stream: bool) -> Self {
        Self {
            inner: reference_model(),
            fail_mid_stream,
            batched_attempts: AtomicUsize::new(0),
        }
    }
}

impl ForwardEngine for FlakyBatchEngine {
    fn n_layers(&self) -> usize {
        self.inner.n_layers()
    }
    fn d_model(&self) -> usize {
        self.inner.d_model()
    }
    fn d_mlp(&self) -> usize {
        self.inner.d_mlp()
    }
    fn device(&self) -> &Device {
        self.inner.device()
    }
    fn tokenize(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        self.inner.tokenize(text, prepend_bos)
    }
    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        self.inner.detokenize(tokens)
    }
    fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_id(token)
    }
    fn forward(&self, tokens: &[u32], stop_at_layer: Option<usize>) -> Result<ForwardActivations> {
        self.inner.forward(tokens, stop_at_layer)
    }
    fn generate_stream<'a>(&'a self, batch: &[Vec<u32>], params: &SamplingParams) -> Result<TokenStream<'a>> {
        if batch.len() < 2 {
            return self.inner.generate_stream(batch, params);
        }
        self.batched_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.fail_mid_stream {
            anyhow::bail!("out of memory for batch of {}", batch.len());
        }
        let stream = self.inner.generate_stream(batch, params)?;
        Ok(Box::new(stream.enumerate().map(|(i, chunk)| {
            if i == 1 {
                Err(anyhow::anyhow!("device lost"))
            } else {
                chunk
            }
        })))
    }
    fn hooks(&self) -> &HookRegistry {
        self.inner.hooks()
    }
}

/// Reference model that counts forward passes.
struct CountingEngine {
    inner: ReferenceModel,
    forwards: AtomicUsize,
}

impl CountingEngine {
    fn new() -> Self {
        Self {
            inner: reference_model(),
            forwards: AtomicUsize::new(0),
        }
    }

    fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

impl ForwardEngine for CountingEngine {
    fn n_layers(&self) -> usize {
        self.inner.n_layers()
    }
    fn d_model(&self) -> usize {
        self.inner.d_model()
    }
    fn d_mlp(&self) -> usize {
        self.inner.d_mlp()
    }
    fn device(&self) -> &Device {
        self.inner.device()
    }
    fn tokenize(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        self.inner.tokenize(text, prepend_bos)
    }
    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        self.inner.detokenize(tokens)
    }
    fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_id(token)
    }
    fn forward(&self, tokens: &[u32], stop_at_layer: Option<usize>) -> Result<ForwardActivations> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        self.inner.forward(tokens, stop_at_layer)
    }
    fn generate_stream<'a>(&'a self, batch: &[Vec<u32>], params: &SamplingParams) -> Result<TokenStream<'a>> {
        self.inner.generate_stream(batch, params)
    }
    fn hooks(&self) -> &HookRegistry {
        self.inner.hooks()
    }
}

fn top_query(prompt: &str, sources: Vec<DecoderId>) -> TopFeaturesQuery {
    TopFeaturesQuery {
        prompt: prompt.to_string(),
        sources,
        num_results: 6,
        ignore_bos: false,
        sort_by_token_indexes: Vec::new(),
        feature_filter: None,
    }
}

#[tokio::test]
async fn test_baseline_branch_matches_baseline_only_generation() {
    let service = service();
    let dual = service.steer_collect(sampled_request("The weather")).await.unwrap();

    let mut baseline_only = sampled_request("The weather");
    baseline_only.types = vec![SteerType::Default];
    let baseline = service.steer_collect(baseline_only).await.unwrap();

    assert_eq!(
        output_of(&dual, SteerType::Default).as_bytes(),
        output_of(&baseline, SteerType::Default).as_bytes()
    );
    assert_eq!(baseline.outputs.len(), 1);
}

#[tokio::test]
async fn test_strong_steering_changes_the_continuation() {
    let service = service();
    let mut request = SteerRequest::text("Hello", vec![feature(1, 3, 200.0)]);
    request.n_completion_tokens = 8;
    request.normalize_steering = true;
    let envelope = service.steer_collect(request).await.unwrap();
    assert_ne!(
        output_of(&envelope, SteerType::Steered),
        output_of(&envelope, SteerType::Default)
    );
    assert!(output_of(&envelope, SteerType::Steered).starts_with("Hello"));
}

#[tokio::test]
async fn test_batched_failure_falls_back_to_sequential() {
    let expected = service().steer_collect(sampled_request("Fallback")).await.unwrap();

    for fail_mid_stream in [false, true] {
        let engine = Arc::new(FlakyBatchEngine::new(fail_mid_stream));
        let service = service_with(Arc::clone(&engine) as Arc<dyn ForwardEngine>);
        let envelope = service.steer_collect(sampled_request("Fallback")).await.unwrap();

        assert_eq!(engine.batched_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(envelope, expected);
        assert!(engine.hooks().is_empty());
        assert!(!service.status().busy);
    }
}

#[tokio::test]
async fn test_sequential_order_follows_type_list() {
    let engine = Arc::new(FlakyBatchEngine::new(false));
    let service = service_with(Arc::clone(&engine) as Arc<dyn ForwardEngine>);
    let mut request = sampled_request("Order");
    request.types = vec![SteerType::Default, SteerType::Steered];

    let mut stream = service.steer(request).await.unwrap();
    let first = stream.recv().await.unwrap().unwrap();
    let types: Vec<SteerType> = first.outputs.iter().map(|o| o.steer_type).collect();
    assert_eq!(types, vec![SteerType::Default, SteerType::Steered]);
    // The steered branch has not started yet
    assert_eq!(output_of(&first, SteerType::Steered), "Order");
    while stream.recv().await.is_some() {}
}

#[tokio::test]
async fn test_dropping_the_stream_releases_the_gate() {
    let service = service();
    let mut request = sampled_request("Cancel me");
    request.n_completion_tokens = 40;

    let mut stream = service.steer(request).await.unwrap();
    let first = stream.recv().await.unwrap().unwrap();
    assert_eq!(first.outputs.len(), 2);
    drop(stream);

    tokio::time::timeout(Duration::from_secs(30), async {
        while service.status().busy {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gate was never released");

    // The next request runs normally
    let envelope = service.steer_collect(sampled_request("Next")).await.unwrap();
    assert!(output_of(&envelope, SteerType::Default).starts_with("Next"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_are_serialized() {
    let service = service();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let mut request = sampled_request(&format!("Request {i}"));
                request.seed = i;
                service.steer_collect(request).await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let envelope = handle.await.unwrap().unwrap();
        assert!(output_of(&envelope, SteerType::Steered).starts_with(&format!("Request {i}")));
    }
    assert!(!service.status().busy);
    assert!(service.engine().hooks().is_empty());
}

#[tokio::test]
async fn test_client_errors_are_typed() {
    let service = service();

    let mut unknown = SteerRequest::text("x", vec![feature(1, 0, 1.0)]);
    unknown.features = Some(vec![SteeringFeature {
        source: DecoderId::new(1, "missing"),
        ..feature(1, 0, 1.0)
    }]);
    let err = service.steer(unknown).await.unwrap_err();
    assert!(matches!(err, SteerError::UnknownDecoder(_)));
    assert!(err.is_client_error());

    // Out-of-range index surfaces through the stream after the gate
    let mut stream = service
        .steer(SteerRequest::text("x", vec![feature(1, 4096, 1.0)]))
        .await
        .unwrap();
    let err = stream.recv().await.unwrap().unwrap_err();
    assert!(matches!(err, SteerError::InvalidFeature(_)));

    let mut zero = SteerRequest::text("x", vec![]);
    zero.features = None;
    zero.normalize_steering = true;
    zero.vectors = Some(vec![SteeringVector {
        hook: "blocks.0.hook_resid_post".to_string(),
        steering_vector: vec![0.0; D_MODEL],
        strength: 1.0,
        ablate: false,
    }]);
    assert!(matches!(service.steer(zero).await, Err(SteerError::ZeroNorm)));

    let long = "y".repeat(500);
    assert!(matches!(
        service.steer(SteerRequest::text(long, vec![feature(1, 0, 1.0)])).await,
        Err(SteerError::InvalidRequest(_))
    ));
    assert!(!service.status().busy);
}

#[tokio::test]
async fn test_wrong_width_vector_is_a_client_error() {
    let service = service();
    let mut request = SteerRequest::text("x", vec![]);
    request.features = None;
    request.vectors = Some(vec![SteeringVector {
        hook: "blocks.0.hook_resid_post".to_string(),
        steering_vector: vec![1.0; D_MODEL + 1],
        strength: 1.0,
        ablate: false,
    }]);
    request.n_completion_tokens = 2;

    let mut stream = service.steer(request).await.unwrap();
    let mut last = None;
    while let Some(item) = stream.recv().await {
        last = Some(item);
    }
    assert!(matches!(last, Some(Err(SteerError::InvalidFeature(_)))));
    assert!(service.engine().hooks().is_empty());
}

#[tokio::test]
async fn test_orthogonal_ablation_and_chat() {
    let service = service();
    let mut request = SteerRequest::chat(
        vec![ChatMessage::new("user", "Tell me a story")],
        vec![SteeringFeature {
            ablate: true,
            ..feature(2, 1, 1.0)
        }],
    );
    request.steer_method = SteerMethod::OrthogonalDecomp;
    request.n_completion_tokens = 6;

    let mut stream = service.steer(request).await.unwrap();
    let mut envelopes = Vec::new();
    while let Some(item) = stream.recv().await {
        envelopes.push(item.unwrap());
    }
    // Chat yields two tokens per envelope
    assert!(envelopes.len() <= 3);
    let last = envelopes.last().unwrap();
    let turns = last.output(SteerType::Steered).unwrap().chat_template.clone().unwrap();
    assert_eq!(turns[0], ChatMessage::new("user", "Tell me a story"));
    assert!(last.output(SteerType::Steered).unwrap().output.starts_with("<bos><start_of_turn>user\n"));
}

#[tokio::test]
async fn test_activation_queries_share_one_forward_pass() {
    let service = service();
    for index in [0, 5, 9] {
        let result = service
            .activations(ActivationQuery {
                prompt: "shared prompt".to_string(),
                source: DecoderId::new(1, "res"),
                index,
            })
            .await
            .unwrap();
        assert_eq!(result.values.len(), 14);
    }
    let stats = service.status().cache;
    assert_eq!(stats.size, 1);
    assert_eq!(stats.entries[0].access_count, 2);
    assert_eq!(stats.entries[0].derived_entries, 1);
}

#[tokio::test]
async fn test_decoders_from_config_and_directory() {
    let model = reference_model();
    let synthetic = SyntheticDecoderSource::new(D_MODEL, 24, 9);
    let dir = TempDir::new().unwrap();
    for layer in [0, 2] {
        let descriptor = DecoderDescriptor::trained(
            DecoderId::new(layer, "disk"),
            format!("blocks.{layer}.hook_resid_post"),
            "",
        );
        let (weights, hook) = synthetic.load(&descriptor, &Device::Cpu).unwrap();
        save_decoder_dir(&dir.path().join(format!("layer_{layer}")), &weights, &hook).unwrap();
    }

    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
token_limit = 64
max_loaded_decoders = 1

[[decoder_sets]]
name = "disk"
layers = [0, 2]
location_template = "layer_{{layer}}"
"#
    )
    .unwrap();
    let config = ServerConfig::load(file.path()).unwrap();

    let service = SteeringService::new(
        Arc::new(model),
        Arc::new(DirectoryDecoderSource::new(dir.path())),
        config,
    );
    assert_eq!(service.preload().await.unwrap(), 1);
    assert_eq!(service.status().decoders.resident, vec!["0-disk".to_string()]);

    let result = service
        .activations(ActivationQuery {
            prompt: "from disk".to_string(),
            source: DecoderId::new(2, "disk"),
            index: 23,
        })
        .await
        .unwrap();
    assert_eq!(result.values.len(), 10);
    // Capacity of one: loading layer 2 evicted layer 0
    assert_eq!(service.status().decoders.resident, vec!["2-disk".to_string()]);
    assert_eq!(service.status().decoders.evictions, 1);
}

#[tokio::test]
async fn test_top_features_rank_several_sources_from_one_forward_pass() {
    let engine = Arc::new(CountingEngine::new());
    let service = service_with(engine.clone());
    let query = top_query(
        "rank these",
        vec![DecoderId::new(0, "res"), DecoderId::new(2, "res"), DecoderId::neurons(1)],
    );

    let top = service.top_features(query.clone()).await.unwrap();
    assert_eq!(engine.forwards(), 1);
    assert_eq!(top.tokens.len(), 11);
    assert_eq!(top.activations.len(), 6);
    assert!(top.activations.windows(2).all(|w| w[0].max_value >= w[1].max_value));
    for ranked in &top.activations {
        assert_eq!(ranked.values.len(), 11);
        assert_eq!(ranked.values[ranked.max_value_index], ranked.max_value);
        assert!(ranked.dfa.is_none());
    }
    assert_eq!(top.counts.len(), 3);
    assert!(top.counts.iter().all(|row| row.len() == 11));

    let stats = service.status().cache;
    assert_eq!(stats.size, 1);
    assert_eq!(stats.entries[0].derived_entries, 3);

    // Repeating the query is served from the cache
    let again = service.top_features(query).await.unwrap();
    assert_eq!(again, top);
    assert_eq!(engine.forwards(), 1);

    // Per-token ranking at the deepest source reads the same cached pass
    let by_token = service
        .topk_by_token(TopkByTokenQuery {
            prompt: "rank these".to_string(),
            source: DecoderId::new(2, "res"),
            top_k: 3,
            ignore_bos: true,
        })
        .await
        .unwrap();
    assert_eq!(engine.forwards(), 1);
    assert_eq!(by_token.tokens.len(), 10);
    assert_eq!(by_token.results.len(), 10);
    assert_eq!(by_token.results[0].token, "r");
    assert_eq!(by_token.results[0].token_position, 0);
    for token in &by_token.results {
        assert_eq!(token.top_features.len(), 3);
        assert!(token
            .top_features
            .windows(2)
            .all(|w| w[0].activation_value >= w[1].activation_value));
    }
    assert_eq!(service.status().cache.entries[0].derived_entries, 3);
}

#[tokio::test]
async fn test_top_features_options_and_errors() {
    let service = service();
    let mut query = top_query("options", vec![DecoderId::new(1, "res")]);
    query.ignore_bos = true;
    query.sort_by_token_indexes = vec![2, 3];
    query.feature_filter = Some(vec![1, 5, 7]);

    let top = service.top_features(query.clone()).await.unwrap();
    assert!(top.activations.len() <= 3);
    assert!(top
        .activations
        .iter()
        .all(|f| [1, 5, 7].contains(&f.index) && f.max_value_index != 0));
    assert!(top.activations.windows(2).all(|w| w[0].sum_values >= w[1].sum_values));
    for ranked in &top.activations {
        assert!((ranked.sum_values - (ranked.values[2] + ranked.values[3])).abs() < 1e-5);
    }

    let no_sources = top_query("x", Vec::new());
    assert!(matches!(
        service.top_features(no_sources).await,
        Err(SteerError::InvalidRequest(_))
    ));

    let mut filter_two = query.clone();
    filter_two.sources.push(DecoderId::new(2, "res"));
    assert!(matches!(
        service.top_features(filter_two).await,
        Err(SteerError::InvalidRequest(_))
    ));

    let mut past_end = query.clone();
    past_end.sort_by_token_indexes = vec![99];
    assert!(matches!(
        service.top_features(past_end).await,
        Err(SteerError::InvalidRequest(_))
    ));

    let mut wide_filter = query.clone();
    wide_filter.feature_filter = Some(vec![4096]);
    assert!(matches!(
        service.top_features(wide_filter).await,
        Err(SteerError::InvalidFeature(_))
    ));

    let unknown = top_query("x", vec![DecoderId::new(1, "missing")]);
    assert!(matches!(
        service.top_features(unknown).await,
        Err(SteerError::UnknownDecoder(_))
    ));

    let too_many = TopkByTokenQuery {
        prompt: "x".to_string(),
        source: DecoderId::new(1, "res"),
        top_k: 49,
        ignore_bos: false,
    };
    assert!(matches!(
        service.topk_by_token(too_many).await,
        Err(SteerError::InvalidRequest(_))
    ));
    assert!(!service.status().busy);
}

#[tokio::test]
async fn test_vector_projection_matches_neuron_activations() {
    let service = service();
    let mut one_hot = vec![0.0; 64];
    one_hot[10] = 1.0;
    let projected = service
        .vector_activations(VectorQuery {
            prompt: "project me".to_string(),
            hook: "blocks.3.mlp.hook_post".to_string(),
            vector: one_hot,
        })
        .await
        .unwrap();
    let neurons = service
        .activations(ActivationQuery {
            prompt: "project me".to_string(),
            source: DecoderId::neurons(3),
            index: 10,
        })
        .await
        .unwrap();

    assert_eq!(projected.tokens, neurons.tokens);
    assert_eq!(projected.values.len(), 11);
    for (a, b) in projected.values.iter().zip(&neurons.values) {
        assert!((a - b).abs() < 1e-5);
    }
    assert_eq!(projected.max_value_index, neurons.max_value_index);
    // Both read the same full pass
    assert_eq!(service.status().cache.size, 1);

    let vector_query = |hook: &str, vector: Vec<f32>| VectorQuery {
        prompt: "project me".to_string(),
        hook: hook.to_string(),
        vector,
    };
    for (query, expected) in [
        (vector_query("blocks.9.hook_nope", vec![1.0; 32]), "request"),
        (vector_query("blocks.0.hook_resid_post", vec![1.0; 31]), "request"),
        (vector_query("blocks.0.attn.hook_pattern", vec![1.0; 11]), "request"),
        (vector_query("blocks.0.hook_resid_post", Vec::new()), "request"),
        (vector_query("blocks.0.hook_resid_post", vec![f32::NAN; 32]), "degenerate"),
    ] {
        let err = service.vector_activations(query).await.unwrap_err();
        match expected {
            "request" => assert!(matches!(err, SteerError::InvalidRequest(_)), "{err}"),
            _ => assert!(matches!(err, SteerError::DegenerateVector), "{err}"),
        }
        assert!(err.is_client_error());
    }
}

#[tokio::test]
async fn test_attention_decoder_reports_attribution() {
    let service = service();
    let attention = DecoderId::new(1, "att-kk");
    let result = service
        .activations(ActivationQuery {
            prompt: "attend here".to_string(),
            source: attention.clone(),
            index: 4,
        })
        .await
        .unwrap();

    let dfa = result.dfa.clone().expect("attention decoders carry attribution");
    assert_eq!(dfa.target_index, result.max_value_index);
    assert_eq!(dfa.values.len(), result.values.len());
    assert!(dfa.values[dfa.target_index + 1..].iter().all(|v| *v == 0.0));
    assert_eq!(dfa.max_value, dfa.values.iter().copied().fold(f32::NEG_INFINITY, f32::max));
    // Zero biases: contributions add up to the pre-activation, which is the value when positive
    if result.max_value > 0.0 {
        let total: f32 = dfa.values.iter().sum();
        assert!((total - result.max_value).abs() < 1e-3, "{total} vs {}", result.max_value);
    }

    let residual = service
        .activations(ActivationQuery {
            prompt: "attend here".to_string(),
            source: DecoderId::new(1, "res"),
            index: 4,
        })
        .await
        .unwrap();
    assert!(residual.dfa.is_none());

    let top = service
        .top_features(top_query("attend here", vec![attention, DecoderId::new(1, "res")]))
        .await
        .unwrap();
    for ranked in &top.activations {
        match &ranked.dfa {
            Some(dfa) => {
                assert_eq!(ranked.source.set, "att-kk");
                assert_eq!(dfa.target_index, ranked.max_value_index);
            }
            None => assert_eq!(ranked.source.set, "res"),
        }
    }
    // One pass for the single-feature queries at layer 1, shared by the ranking
    assert_eq!(service.status().cache.size, 1);
}
