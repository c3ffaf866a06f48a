use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::{NameHint, OnnxExtractor};
use facereg_registry::{
    spawn_engine, with_deadline, EngineHandle, EnrollRequest, FaceRegistry, ImageSource,
    MatchRequest, RegistryConfig, UploadedFile,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "facereg", version, about = "Face embedding registry and matcher")]
struct Cli {
    /// Directory containing the ONNX model files
    #[arg(long, global = true, env = "FACEREG_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Root for registry files and image sources
    #[arg(long, global = true, env = "FACEREG_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Image source of the default registry
    #[arg(long, global = true, env = "FACEREG_IMAGES_DIR")]
    images_dir: Option<PathBuf>,

    /// Parent directory of dataset registries' images
    #[arg(long, global = true, env = "FACEREG_DATASETS_DIR")]
    datasets_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "FACEREG_DEFAULT_REGISTRY", default_value = "default")]
    default_registry: String,

    /// Give up after this many seconds
    #[arg(long, global = true, env = "FACEREG_OPERATION_TIMEOUT_SECS", default_value_t = 600)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one image
    Enroll {
        path: PathBuf,
        /// Subject name (derived from the file name if omitted)
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        registry: Option<String>,
    },
    /// Match an image against a registry
    Match {
        path: PathBuf,
        #[arg(long, env = "FACEREG_SIMILARITY_THRESHOLD", default_value_t = 0.40)]
        threshold: f32,
        #[arg(long, env = "FACEREG_TOP_K", default_value_t = 5)]
        top_k: usize,
        #[arg(short, long)]
        registry: Option<String>,
    },
    /// Reconcile a registry with its image directory
    Sync {
        #[arg(short, long)]
        registry: Option<String>,
        /// Directory to sync against instead of the registry's own
        #[arg(long)]
        source: Option<PathBuf>,
        /// Subject name hint, e.g. --hint "Selena Gomez=selenagomez"
        #[arg(long = "hint", value_parser = parse_hint)]
        hints: Vec<NameHint>,
    },
    /// List enrolled images
    List {
        #[arg(short, long)]
        registry: Option<String>,
    },
    /// Remove an enrolled image by key
    Remove {
        key: String,
        #[arg(short, long)]
        registry: Option<String>,
    },
    /// Recognize many probe images and print a CSV report
    Batch {
        #[arg(required = true)]
        probes: Vec<PathBuf>,
        #[arg(long, env = "FACEREG_SIMILARITY_THRESHOLD", default_value_t = 0.40)]
        threshold: f32,
        #[arg(long, env = "FACEREG_TOP_K", default_value_t = 5)]
        top_k: usize,
        #[arg(short, long)]
        registry: Option<String>,
    },
}

impl Commands {
    /// Listing and removing records never embed anything.
    fn needs_models(&self) -> bool {
        !matches!(self, Commands::List { .. } | Commands::Remove { .. })
    }
}

fn parse_hint(raw: &str) -> std::result::Result<NameHint, String> {
    match raw.split_once('=') {
        Some((name, pattern)) if !name.trim().is_empty() && !pattern.trim().is_empty() => {
            Ok(NameHint::new(name.trim(), pattern.trim()))
        }
        _ => Err(format!("expected NAME=PATTERN, got {raw:?}")),
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facereg")
}

impl Cli {
    fn registry_config(&self) -> RegistryConfig {
        let data_dir = self.data_dir.clone().unwrap_or_else(default_data_dir);
        let mut config = RegistryConfig::under(&data_dir);
        if let Some(dir) = &self.images_dir {
            config.images_dir = dir.clone();
        }
        if let Some(dir) = &self.datasets_dir {
            config.datasets_dir = dir.clone();
        }
        config.default_registry = self.default_registry.clone();
        config
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let engine = if cli.command.needs_models() {
        let model_dir = cli
            .model_dir
            .clone()
            .unwrap_or_else(facereg_core::default_model_dir);
        let extractor = OnnxExtractor::load(&model_dir)
            .with_context(|| format!("loading models from {}", model_dir.display()))?;
        spawn_engine(Box::new(extractor))?
    } else {
        EngineHandle::offline()
    };
    let registry = FaceRegistry::new(cli.registry_config(), engine);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted; cancelling");
                cancel.cancel();
            }
        });
    }
    let deadline = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Commands::Enroll { path, name, registry: target } => {
            let req = EnrollRequest {
                registry: target,
                image: ImageSource::Path(path),
                subject_name: name,
            };
            let outcome = with_deadline(deadline, &cancel, registry.enroll(req, &cancel)).await?;
            print_json(&outcome)?;
        }
        Commands::Match {
            path,
            threshold,
            top_k,
            registry: target,
        } => {
            let req = MatchRequest {
                registry: target,
                probe: ImageSource::Path(path),
                threshold: Some(threshold),
                top_k: Some(top_k),
            };
            let outcome = with_deadline(deadline, &cancel, registry.match_probe(req, &cancel)).await?;
            print_json(&outcome)?;
        }
        Commands::Sync {
            registry: target,
            source,
            hints,
        } => {
            let sync = registry.sync(target.as_deref(), source.as_deref(), &hints, &cancel);
            let report = with_deadline(deadline, &cancel, sync).await?;
            print_json(&report)?;
        }
        Commands::List { registry: target } => {
            let enrolled = registry.list(target.as_deref()).await?;
            if enrolled.is_empty() {
                eprintln!("No images enrolled");
            }
            print_json(&enrolled)?;
        }
        Commands::Remove { key, registry: target } => {
            let removed = registry.remove(target.as_deref(), &key).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Commands::Batch {
            probes,
            threshold,
            top_k,
            registry: target,
        } => {
            let mut files = Vec::with_capacity(probes.len());
            for path in &probes {
                let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                files.push(UploadedFile { name, data });
            }
            let batch = registry.batch_recognize(
                target.as_deref(),
                &files,
                Some(threshold),
                Some(top_k),
                &cancel,
            );
            let report = with_deadline(deadline, &cancel, batch).await?;
            print!("{}", report.to_csv());
        }
    }

    Ok(())
}
