use kbsift::answer::Answer;
use kbsift::cli::{Cli, Commands, ConfigAction};
use kbsift::config::Config;
use kbsift::embedding::FastEmbedProvider;
use kbsift::error::{KbsiftError, Result};
use kbsift::generation;
use kbsift::recovery::JsonRecovery;
use kbsift::retrieval::{tag_source, Chunk, Hit, PipelineFactory, RetrievalPipeline};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Handle commands
    match cli.command {
        Commands::Search {
            query,
            top_k,
            kb,
            json,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            let pipeline = open_pipeline(config, cli.caller.as_deref()).await?;
            let hits = pipeline.search(&query, top_k, kb.as_deref()).await?;
            print_hits(&hits, json)?;
        }
        Commands::Ask {
            question,
            top_k,
            kb,
            json,
        } => {
            let config = load_config(cli.config, cli.profile)?;
            let pipeline = open_pipeline(config, cli.caller.as_deref()).await?;
            let answer = pipeline
                .answer_question(&question, top_k, kb.as_deref())
                .await?;
            print_answer(&answer, json)?;
        }
        Commands::Ingest { file, kb } => {
            let config = load_config(cli.config, cli.profile)?;
            let chunks = read_chunks(&file, kb.as_deref())?;
            let pipeline = open_pipeline(config, cli.caller.as_deref()).await?;
            cmd_ingest(&pipeline, chunks).await?;
        }
        Commands::DeleteKb { kb_id } => {
            let config = load_config(cli.config, cli.profile)?;
            let pipeline = open_pipeline(config, cli.caller.as_deref()).await?;
            let report = pipeline.delete_knowledge_base(&kb_id).await;
            println!("✓ Removed {} chunk(s) of knowledge base '{}'", report.removed, kb_id);
            for failure in &report.failures {
                println!("  ✗ {}: {}", failure.path.display(), failure.reason);
            }
        }
        Commands::Recover { file } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_recover(&config, file).await?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "kbsift=debug" } else { "kbsift=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_pipeline(config: Config, caller: Option<&str>) -> Result<Arc<RetrievalPipeline>> {
    let embedder = Arc::new(FastEmbedProvider::new(
        &config.embedding.model,
        config.embedding.batch_size,
    )?);
    let generator = generation::from_config(&config.llm)?;

    let factory = PipelineFactory::new(config, embedder, generator).await?;
    factory.get(caller).await
}

fn read_chunks(path: &Path, kb: Option<&str>) -> Result<Vec<Chunk>> {
    let content = std::fs::read_to_string(path).map_err(|e| KbsiftError::Io {
        source: e,
        context: format!("Failed to read chunk file: {:?}", path),
    })?;

    let mut chunks = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut chunk: Chunk = serde_json::from_str(line).map_err(|e| KbsiftError::Json {
            source: e,
            context: format!("Invalid chunk on line {}", line_no + 1),
        })?;
        if let Some(kb) = kb {
            chunk.source = tag_source(kb, &chunk.source);
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}

async fn cmd_ingest(pipeline: &RetrievalPipeline, chunks: Vec<Chunk>) -> Result<()> {
    let total = chunks.len();
    let report = pipeline.add_chunks(chunks).await?;

    println!(
        "✓ Added {} of {} chunk(s) to {} index(es)",
        report.chunks,
        total,
        report.persisted.len()
    );
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.path.display(), failure.reason);
    }
    Ok(())
}

async fn cmd_recover(config: &Config, file: Option<PathBuf>) -> Result<()> {
    let input = match &file {
        Some(path) => std::fs::read_to_string(path).map_err(|e| KbsiftError::Io {
            source: e,
            context: format!("Failed to read {:?}", path),
        })?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| KbsiftError::Io {
                    source: e,
                    context: "Failed to read stdin".to_string(),
                })?;
            buffer
        }
    };

    let mut recovery = JsonRecovery::new(&config.recovery)?;
    if config.llm.enabled {
        recovery = recovery.with_generator(
            generation::from_config(&config.llm)?,
            Duration::from_secs(config.llm.request_timeout_secs),
        );
    }

    let value = recovery.recover(&input).await?;
    let pretty = serde_json::to_string_pretty(&value).map_err(|e| KbsiftError::Json {
        source: e,
        context: "Failed to serialize recovered value".to_string(),
    })?;
    println!("{}", pretty);
    Ok(())
}

fn print_hits(hits: &[Hit], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(hits).map_err(|e| KbsiftError::Json {
            source: e,
            context: "Failed to serialize hits".to_string(),
        })?;
        println!("{}", out);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results found");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("[{}] {} (score {:.3})", i + 1, hit.source, hit.score);
        println!("    {}", kbsift::retrieval::truncate_snippet(&hit.content, 240));
    }
    Ok(())
}

fn print_answer(answer: &Answer, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(answer).map_err(|e| KbsiftError::Json {
            source: e,
            context: "Failed to serialize answer".to_string(),
        })?;
        println!("{}", out);
        return Ok(());
    }

    println!("{}", answer.answer);
    if !answer.references.is_empty() {
        println!();
        println!("References:");
        for reference in &answer.references {
            println!("  [{}] {}", reference.index, reference.source);
        }
    }
    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path, None)?;
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
            println!("  Knowledge bases: {}", config.resolved_index_paths()?.len());
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            // Create parent directory
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| KbsiftError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    let mut config = Config::load_or_default(&path)?;

    if let Some(profile) = profile {
        config.apply_profile(&profile)?;
    }
    Ok(config)
}
