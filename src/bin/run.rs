//! strata-run: Load a JSON model, run it once, and print the outputs as JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use strata_runtime::cli;
use strata_runtime::model::TensorData;
use strata_runtime::{InferenceSession, RunOptions, SessionOptions};

#[derive(Parser)]
#[command(name = "strata-run", about = "Run a JSON graph model")]
struct Args {
    /// Path to the JSON model file
    #[arg(short = 'm', long)]
    model: PathBuf,

    /// Feeds JSON file (reads stdin when omitted)
    #[arg(short = 'f', long)]
    feeds: Option<PathBuf>,

    /// Session options JSON file
    #[arg(long)]
    options: Option<PathBuf>,

    /// Backends in preference order: auto, or a list such as "emulated,cpu"
    #[arg(long)]
    backend: Option<String>,

    /// Outputs to fetch (defaults to every graph output)
    #[arg(short = 'o', long = "output")]
    outputs: Vec<String>,

    /// Run nodes one at a time instead of in parallel
    #[arg(long)]
    sequential: bool,

    /// Give up after this many milliseconds (0 waits forever)
    #[arg(long, default_value = "0")]
    timeout_ms: u64,

    /// Tag echoed in logs
    #[arg(long, default_value = "")]
    tag: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

#[derive(Serialize)]
struct Timings {
    load_ms: f64,
    run_ms: f64,
}

#[derive(Serialize)]
struct JsonOutput {
    model: String,
    backends: Vec<String>,
    outputs: BTreeMap<String, TensorData>,
    timings: Timings,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = match &args.options {
        Some(path) => SessionOptions::from_file(path)?,
        None => SessionOptions::from_env(),
    };
    if args.backend.is_some() {
        options.backends = cli::backend::resolve_backends(args.backend.as_deref())?;
    }
    let feeds = cli::parse_feeds(&cli::read_feeds_text(args.feeds.as_deref())?)?;

    let load_start = Instant::now();
    let session = InferenceSession::new(options)?;
    session.load_from_file(&args.model)?;
    session.initialize()?;
    let load_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    let run_options = RunOptions {
        sequential: args.sequential,
        timeout_ms: args.timeout_ms,
        tag: args.tag.clone(),
    };
    let run_start = Instant::now();
    let outputs = session.run(&run_options, feeds, &args.outputs)?;
    let run_ms = run_start.elapsed().as_secs_f64() * 1000.0;

    let output = JsonOutput {
        model: args.model.display().to_string(),
        backends: session.backend_names(),
        outputs: cli::outputs_to_json(&outputs)?,
        timings: Timings { load_ms, run_ms },
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
