use retail_copilot::config::PipelineConfig;
use retail_copilot::executor::SqliteService;
use retail_copilot::finalizer;
use retail_copilot::llm::LlmClient;
use retail_copilot::pipeline::Pipeline;
use retail_copilot::question::{load_questions, Question};
use retail_copilot::retrieval::{load_chunks, TfIdfIndex};
use retail_copilot::schema::SchemaDescription;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "retail-copilot")]
#[command(about = "Retail analytics copilot over policy documents and a sales database")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a batch of questions from a JSONL file
    Run {
        /// Path to the questions file, one JSON object per line
        batch: PathBuf,

        /// Path to the answers output file (default: ./answers.jsonl)
        #[arg(short, long, default_value = "answers.jsonl")]
        out: PathBuf,

        /// Path to the SQLite sales database (default: ./data/northwind.sqlite)
        #[arg(long, default_value = "data/northwind.sqlite")]
        db: PathBuf,

        /// Path to the policy documents directory (default: ./docs)
        #[arg(long, default_value = "docs")]
        docs: PathBuf,

        /// Number of questions processed concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Run without an LLM; heuristic routing and template SQL only
        #[arg(long)]
        offline: bool,
    },
    /// Answer a single question from the command line
    Ask {
        /// The question in natural language
        question: String,

        /// Expected answer shape, e.g. int, float, list, {category:str, quantity:int}
        #[arg(long, default_value = "")]
        format_hint: String,

        /// Path to the SQLite sales database (default: ./data/northwind.sqlite)
        #[arg(long, default_value = "data/northwind.sqlite")]
        db: PathBuf,

        /// Path to the policy documents directory (default: ./docs)
        #[arg(long, default_value = "docs")]
        docs: PathBuf,

        /// Run without an LLM; heuristic routing and template SQL only
        #[arg(long)]
        offline: bool,

        /// Print the stage trace after the answer
        #[arg(long)]
        trace: bool,
    },
    /// Print the introspected database schema
    Schema {
        /// Path to the SQLite sales database (default: ./data/northwind.sqlite)
        #[arg(long, default_value = "data/northwind.sqlite")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            batch,
            out,
            db,
            docs,
            concurrency,
            offline,
        } => run_batch(batch, out, db, docs, concurrency, offline).await,
        Commands::Ask {
            question,
            format_hint,
            db,
            docs,
            offline,
            trace,
        } => ask(question, format_hint, db, docs, offline, trace).await,
        Commands::Schema { db } => show_schema(db),
    }
}

fn build_pipeline(db: &Path, docs: &Path, offline: bool, config: PipelineConfig) -> Result<Arc<Pipeline>> {
    // Introspect the database schema
    info!("Introspecting schema from {:?}", db);
    let schema = SchemaDescription::introspect(db)
        .map_err(|e| anyhow::anyhow!("Failed to introspect schema: {}", e))?;
    println!("✅ Schema loaded: {} tables", schema.tables.len());

    // Index the policy documents
    info!("Indexing documents from {:?}", docs);
    let chunks = load_chunks(docs, config.chunk_size)
        .map_err(|e| anyhow::anyhow!("Failed to load documents: {}", e))?;
    let index = TfIdfIndex::build(chunks);
    println!("✅ Document index ready: {} chunks", index.len());

    // LLM client; offline mode falls back to heuristics and templates
    let client = if offline {
        LlmClient::offline()
    } else {
        LlmClient::from_env()
    };
    if client.is_offline() {
        println!("⚠️  No OpenAI API key found - heuristic routing and template SQL only");
    } else {
        println!("✅ OpenAI API key found - model assistance enabled");
    }

    let query_service = SqliteService::new(db, config.row_cap)
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    Ok(Arc::new(Pipeline::new(
        config,
        Arc::new(client),
        Arc::new(index),
        Arc::new(query_service),
        schema,
    )))
}

async fn run_batch(
    batch: PathBuf,
    out: PathBuf,
    db: PathBuf,
    docs: PathBuf,
    concurrency: Option<usize>,
    offline: bool,
) -> Result<()> {
    println!("\n{}", "=".repeat(80));
    println!(" RETAIL COPILOT BATCH RUN");
    println!("{}", "=".repeat(80));

    let mut config = PipelineConfig::default();
    if let Some(concurrency) = concurrency {
        config.batch_concurrency = concurrency.max(1);
    }

    let questions = load_questions(&batch)
        .map_err(|e| anyhow::anyhow!("Failed to load questions: {}", e))?;
    println!(" Loaded {} questions from {:?}", questions.len(), batch);

    let pipeline = build_pipeline(&db, &docs, offline, config)?;

    println!(" Processing...\n");
    let results = Arc::clone(&pipeline).run_batch(questions.clone()).await;

    let mut answers = Vec::with_capacity(results.len());
    for (question, (id, result)) in questions.iter().zip(results) {
        match result {
            Ok(answer) => answers.push(answer),
            Err(e) => {
                warn!("Question {} failed: {}", id, e);
                answers.push(pipeline.fallback_answer(question));
            }
        }
    }

    finalizer::write_answers(&out, &answers)
        .map_err(|e| anyhow::anyhow!("Failed to write answers: {}", e))?;

    println!("\n{}", "=".repeat(80));
    println!(" BATCH COMPLETE");
    println!("{}", "=".repeat(80));
    println!(" Wrote {} answers to {:?}", answers.len(), out);
    Ok(())
}

async fn ask(
    question: String,
    format_hint: String,
    db: PathBuf,
    docs: PathBuf,
    offline: bool,
    trace: bool,
) -> Result<()> {
    let pipeline = build_pipeline(&db, &docs, offline, PipelineConfig::default())?;

    let question = Question::new("cli", question, format_hint);
    let answer = pipeline
        .answer_with_timeout(&question)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to answer: {}", e))?;

    println!("\n{}", "=".repeat(80));
    println!(" ANSWER");
    println!("{}", "=".repeat(80));
    println!("{}", serde_json::to_string_pretty(&answer)?);

    if trace {
        println!("\n Stage trace:");
        for log in pipeline.log_store().for_question("cli") {
            for line in log.trace {
                println!("   {}", line);
            }
        }
    }
    Ok(())
}

fn show_schema(db: PathBuf) -> Result<()> {
    let schema = SchemaDescription::introspect(&db)
        .map_err(|e| anyhow::anyhow!("Failed to introspect schema: {}", e))?;
    println!("{}", schema.to_prompt_text());
    Ok(())
}
