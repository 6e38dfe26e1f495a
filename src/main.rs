use anyhow::{bail, Context, Result};
use dramatis::core::config::Config;
use dramatis::services::annotate::ScriptWriter;
use dramatis::services::assemble::Assembler;
use dramatis::services::engine::create_render_engine;
use dramatis::services::generate::Orchestrator;
use dramatis::services::llm::{create_completion_client, SamplingParams};
use dramatis::services::script::ChunkStatus;
use dramatis::services::store::ChunkStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "run".to_string());

    match command.as_str() {
        "annotate" => {
            let input = args.next().context("usage: dramatis annotate <book.txt>")?;
            annotate(&config, &input).await
        }
        "render" => render(&config).await,
        "merge" => merge(&config).await,
        "export" => export(&config).await,
        "run" => {
            let input = args.next().context("usage: dramatis run <book.txt>")?;
            annotate(&config, &input).await?;
            render(&config).await?;
            merge(&config).await?;
            export(&config).await
        }
        other => bail!("unknown command: {} (expected annotate/render/merge/export/run)", other),
    }
}

/// Annotate a book into the speaker-tagged script, run the guarded review
/// pass, and persist the result. Drops any stale chunk list so the store
/// rebuilds from the fresh script.
async fn annotate(config: &Config, input: &str) -> Result<()> {
    let book_text = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("failed to read {}", input))?;

    let llm = create_completion_client(&config.llm);
    let writer = ScriptWriter::new(
        llm.as_ref(),
        SamplingParams::from_config(&config.llm),
        config.llm.retry_count,
    );

    let entries = writer.annotate(&book_text, config.script.slice_chars).await?;
    println!("Annotated {} script entries", entries.len());

    let (entries, stats) = writer
        .review(&entries, config.script.review_batch, config.script.merge_narrators)
        .await?;
    println!(
        "Review: {} text / {} speaker / {} instruct changes, {} batches kept as-is",
        stats.text_changed, stats.speaker_changed, stats.instruct_changed, stats.batches_rejected
    );

    let script_path = config.script_path();
    tokio::fs::write(&script_path, serde_json::to_string_pretty(&entries)?).await?;
    println!("Script saved to {}", script_path.display());

    let chunks_path = config.workspace_dir().join("chunks.json");
    if tokio::fs::try_exists(&chunks_path).await? {
        tokio::fs::remove_file(&chunks_path).await?;
        println!("Cleared stale chunk list");
    }
    Ok(())
}

/// Render every chunk that is not already done, batched or parallel
/// depending on configuration.
async fn render(config: &Config) -> Result<()> {
    let workspace = config.workspace_dir();
    let store = Arc::new(ChunkStore::new(&workspace, config.script.chunk_chars));
    let engine = create_render_engine(&config.render);
    let orchestrator = Orchestrator::new(store.clone(), engine, &workspace);

    let chunks = store.load().await?;
    if chunks.is_empty() {
        bail!("no chunks to render; run 'dramatis annotate' first");
    }

    let indices: Vec<usize> = chunks
        .iter()
        .filter(|c| c.status != ChunkStatus::Done)
        .map(|c| c.id)
        .collect();
    if indices.is_empty() {
        println!("All {} chunks already rendered", chunks.len());
        return Ok(());
    }

    println!("Rendering {} of {} chunks...", indices.len(), chunks.len());
    let result = if config.render.use_batch_api {
        orchestrator
            .render_batch(
                &indices,
                config.render.batch_seed,
                config.render.batch_size,
                config.render.group_by_voice,
            )
            .await?
    } else {
        orchestrator
            .render_parallel(&indices, config.render.parallel_workers)
            .await?
    };

    println!(
        "Rendering complete: {} succeeded, {} failed",
        result.completed.len(),
        result.failed.len()
    );
    for (index, reason) in &result.failed {
        println!("  chunk {} failed: {}", index, reason);
    }
    Ok(())
}

async fn merge(config: &Config) -> Result<()> {
    let workspace = config.workspace_dir();
    let store = ChunkStore::new(&workspace, config.script.chunk_chars);
    let chunks = store.load().await?;

    let assembler = Assembler::new(&workspace);
    let out = assembler.merge(&chunks).await?;
    println!("Merged audiobook written to {}", out.display());
    Ok(())
}

async fn export(config: &Config) -> Result<()> {
    let workspace = config.workspace_dir();
    let store = ChunkStore::new(&workspace, config.script.chunk_chars);
    let chunks = store.load().await?;

    let assembler = Assembler::new(&workspace);
    let bundle = assembler.export_tracks(&chunks).await?;
    println!("Multi-track bundle written to {}", bundle.display());
    Ok(())
}
