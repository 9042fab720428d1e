//! sae-steer CLI: query and steer a hooked model through sparse feature decoders

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use sae_steer::{
    ActivationQuery, ChatMessage, DecoderId, DecoderSetConfig, DecoderSource, DirectoryDecoderSource,
    HubDecoderSource, ReferenceConfig, ReferenceModel, ServerConfig, SteerMethod, SteerOutput, SteerRequest,
    SteerType, SteeringFeature, SteeringService, SyntheticDecoderSource, TopFeaturesQuery, TopkByTokenQuery,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-steer")]
#[command(about = "Feature activations and steered generation on a hooked model")]
#[command(version)]
struct Cli {
    /// Path to a TOML server configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where decoder weights come from
    #[arg(long, value_enum, default_value_t = WeightSource::Synthetic)]
    weights: WeightSource,

    /// Root directory for `--weights dir`
    #[arg(long, default_value = "decoders")]
    decoder_dir: PathBuf,

    /// Load the starting resident set before serving
    #[arg(long)]
    preload: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum WeightSource {
    /// Seeded random weights
    Synthetic,
    /// Local directories with sae_weights.safetensors + cfg.json
    Dir,
    /// HuggingFace Hub
    Hub,
}

#[derive(Subcommand)]
enum Command {
    /// Per-token activations of one feature
    Activations {
        #[arg(short, long)]
        prompt: String,
        /// Decoder id, e.g. "2-res" or "2" for raw neurons
        #[arg(short, long)]
        decoder: DecoderId,
        #[arg(short, long)]
        index: usize,
    },
    /// Strongest features across several decoders
    Top {
        #[arg(short, long)]
        prompt: String,
        /// Decoder ids, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        decoders: Vec<DecoderId>,
        #[arg(short = 'n', long, default_value_t = 10)]
        num_results: usize,
        #[arg(long)]
        ignore_bos: bool,
    },
    /// Strongest features of one decoder at every token
    TopByToken {
        #[arg(short, long)]
        prompt: String,
        #[arg(short, long)]
        decoder: DecoderId,
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
        #[arg(long)]
        ignore_bos: bool,
    },
    /// Steered and default continuations of a prompt
    Steer {
        #[arg(short, long)]
        prompt: String,
        #[arg(short, long)]
        decoder: DecoderId,
        #[arg(short, long)]
        index: usize,
        #[arg(short, long, default_value_t = 4.0)]
        strength: f32,
        #[arg(short = 'n', long, default_value_t = 24)]
        tokens: usize,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Use orthogonal decomposition instead of simple addition
        #[arg(long)]
        orthogonal: bool,
        /// Treat the prompt as a single user chat turn
        #[arg(long)]
        chat: bool,
        /// Print every streamed envelope
        #[arg(long)]
        stream: bool,
    },
    /// Cache and resident-set statistics
    Status,
}

/// Demo decoder set used when the configuration lists none.
fn demo_set(n_layers: usize) -> DecoderSetConfig {
    DecoderSetConfig {
        name: "res".to_string(),
        layers: (0..n_layers).collect(),
        hook_template: "blocks.{layer}.hook_resid_post".to_string(),
        location_template: "{layer}-res".to_string(),
    }
}

fn print_output(output: &SteerOutput) {
    let label = match output.steer_type {
        SteerType::Steered => "STEERED",
        SteerType::Default => "DEFAULT",
    };
    println!("[{label}] {}", output.output);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => {
            let mut config = ServerConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };

    let reference = ReferenceConfig::named(&config.model_id)?;
    if config.decoder_sets.is_empty() {
        config.decoder_sets.push(demo_set(reference.n_layers));
    }
    let engine = Arc::new(ReferenceModel::new(reference.clone(), &Device::Cpu)?);
    let source: Arc<dyn DecoderSource> = match cli.weights {
        WeightSource::Synthetic => Arc::new(SyntheticDecoderSource::new(reference.d_model, 4 * reference.d_model, 0)),
        WeightSource::Dir => Arc::new(DirectoryDecoderSource::new(&cli.decoder_dir)),
        WeightSource::Hub => Arc::new(HubDecoderSource),
    };
    let service = SteeringService::new(engine, source, config);
    if cli.preload {
        let loaded = service.preload().await?;
        info!("Preloaded {loaded} decoders");
    }

    match cli.command {
        Command::Activations { prompt, decoder, index } => {
            let result = service
                .activations(ActivationQuery {
                    prompt,
                    source: decoder,
                    index,
                })
                .await?;
            for (token, value) in result.tokens.iter().zip(&result.values) {
                println!("{token:?}\t{value:.4}");
            }
            println!(
                "max {:.4} at {} ({:?})",
                result.max_value, result.max_value_index, result.tokens[result.max_value_index]
            );
            if let Some(dfa) = &result.dfa {
                println!("attribution into position {}:", dfa.target_index);
                for (token, value) in result.tokens.iter().zip(&dfa.values) {
                    println!("  {token:?}\t{value:.4}");
                }
            }
        }
        Command::Top {
            prompt,
            decoders,
            num_results,
            ignore_bos,
        } => {
            let top = service
                .top_features(TopFeaturesQuery {
                    prompt,
                    sources: decoders,
                    num_results,
                    ignore_bos,
                    sort_by_token_indexes: Vec::new(),
                    feature_filter: None,
                })
                .await?;
            for ranked in &top.activations {
                println!(
                    "{}:{}\tmax {:.4} at {:?}",
                    ranked.source, ranked.index, ranked.max_value, top.tokens[ranked.max_value_index]
                );
            }
        }
        Command::TopByToken {
            prompt,
            decoder,
            top_k,
            ignore_bos,
        } => {
            let by_token = service
                .topk_by_token(TopkByTokenQuery {
                    prompt,
                    source: decoder,
                    top_k,
                    ignore_bos,
                })
                .await?;
            for token in &by_token.results {
                let features: Vec<String> = token
                    .top_features
                    .iter()
                    .map(|f| format!("{}={:.3}", f.feature_index, f.activation_value))
                    .collect();
                println!("{:?}\t{}", token.token, features.join(" "));
            }
        }
        Command::Steer {
            prompt,
            decoder,
            index,
            strength,
            tokens,
            temperature,
            seed,
            orthogonal,
            chat,
            stream,
        } => {
            let feature = SteeringFeature {
                source: decoder,
                index,
                strength,
                steering_vector: None,
                ablate: false,
            };
            let mut request = if chat {
                SteerRequest::chat(vec![ChatMessage::new("user", prompt)], vec![feature])
            } else {
                SteerRequest::text(prompt, vec![feature])
            };
            request.n_completion_tokens = tokens;
            request.temperature = temperature;
            request.seed = seed;
            if orthogonal {
                request.steer_method = SteerMethod::OrthogonalDecomp;
            }

            if stream {
                let mut envelopes = service.steer(request).await?;
                while let Some(envelope) = envelopes.recv().await {
                    let envelope = envelope?;
                    println!("{}", serde_json::to_string(&envelope)?);
                }
            } else {
                let envelope = service.steer_collect(request).await?;
                envelope.outputs.iter().for_each(print_output);
            }
        }
        Command::Status => {
            let status = service.status();
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("Failed to serialize status")?
            );
        }
    }

    Ok(())
}
