//! CLI driver for the council engine.
//!
//! Runs one deliberation against an OpenAI-compatible gateway and prints the
//! chairman's synthesis with the aggregate standings. In `--verify` mode the
//! process exit code carries the verdict: 0 pass, 1 fail, 2 unclear,
//! 3 engine error.
//!
//! ```bash
//! export OPENROUTER_API_KEY=sk-...
//! llm-council "Is this design sound?" \
//!     --model openai/gpt-5.2 --model anthropic/claude-opus-4-5 \
//!     --model google/gemini-3-pro --chairman anthropic/claude-opus-4-5
//!
//! # Verify mode with a confidence threshold
//! llm-council "Does the patch satisfy the ticket?" --config council.json \
//!     --verify --threshold 0.8
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use llm_council::caller::openrouter::DEFAULT_ENDPOINT;
use llm_council::{
    CouncilConfig, EventBus, OpenRouterCaller, Orchestrator, Query, ResultEnvelope,
    DEFAULT_TRANSCRIPT_ROOT,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The question to put to the council
    prompt: String,

    /// Council member model id (repeat for each member)
    #[arg(long = "model")]
    models: Vec<String>,

    /// Chairman model id (defaults to the first council model)
    #[arg(long)]
    chairman: Option<String>,

    /// Path to a JSON council config (overrides --model/--chairman)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in debate mode instead of consensus
    #[arg(long, default_value_t = false)]
    debate: bool,

    /// Ask for a binary verdict and exit with 0/1/2 per pass/fail/unclear
    #[arg(long, default_value_t = false)]
    verify: bool,

    /// Confidence threshold for a PASS verdict in verify mode
    /// (defaults to the config's threshold)
    #[arg(long)]
    threshold: Option<f64>,

    /// Print individual responses and rankings with the result
    #[arg(long, default_value_t = false)]
    details: bool,

    /// Transcript root directory
    #[arg(long, default_value = DEFAULT_TRANSCRIPT_ROOT)]
    transcript_dir: PathBuf,
}

fn resolve_config(args: &Args) -> Result<CouncilConfig> {
    if let Some(path) = &args.config {
        return CouncilConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    if args.models.len() < 2 {
        bail!("need a --config file or at least two --model flags");
    }
    let chairman = args
        .chairman
        .clone()
        .unwrap_or_else(|| args.models[0].clone());
    let config = CouncilConfig::new(args.models.clone(), chairman);
    config.validate()?;
    Ok(config)
}

fn render(result: &ResultEnvelope) {
    println!("### Chairman's Synthesis\n");
    println!("{}\n", result.final_response);

    if !result.aggregate.is_empty() {
        println!("### Council Rankings\n");
        for entry in &result.aggregate {
            println!(
                "- {}: {} Borda points ({} reviewers)",
                entry.model, entry.borda_points, entry.reviewer_count
            );
        }
        println!();
    }

    if let Some(verdict) = result.verdict {
        let confidence = result.confidence.unwrap_or_default();
        println!("Verdict: {} (confidence {:.2})", verdict, confidence);
    }

    if let Some(details) = &result.details {
        println!("\n### Stage 1 Responses\n");
        for item in &details.stage1 {
            match &item.value {
                Some(text) => println!("**{}**:\n{}\n", item.model, text),
                None => println!(
                    "**{}**: failed ({})\n",
                    item.model,
                    item.error.map(|e| e.to_string()).unwrap_or_default()
                ),
            }
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let config = resolve_config(&args)?;

    let api_key = std::env::var("OPENROUTER_API_KEY")
        .context("OPENROUTER_API_KEY is not set (required to reach the gateway)")?;
    let endpoint =
        std::env::var("COUNCIL_GATEWAY_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

    let caller = Arc::new(OpenRouterCaller::new(endpoint, api_key));
    let orchestrator = Orchestrator::new(caller, config, EventBus::new().shared())
        .with_transcript_root(args.transcript_dir.clone());

    let mut query = Query::new(args.prompt.clone());
    query.mode = orchestrator.config().mode;
    if args.debate {
        query = query.debate();
    }
    if args.verify {
        let threshold = args
            .threshold
            .unwrap_or(orchestrator.config().confidence_threshold);
        query = query.with_binary_verdict(threshold);
    }
    if args.details {
        query = query.with_details();
    }

    match orchestrator.deliberate(query).await {
        Ok(result) => {
            render(&result);
            Ok(result.exit_code())
        }
        Err(failure) => {
            eprintln!("error: {}", failure);
            if let Some(path) = &failure.partial_transcript_path {
                eprintln!("partial transcript: {}", path.display());
            }
            Ok(3)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            3
        }
    };
    std::process::exit(code);
}
