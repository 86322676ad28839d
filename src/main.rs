//! Pagewise Relay CLI
//!
//! Runs a worker command through the request engine and prints the result.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use pagewise_relay::{
    BulkSession, EngineConfig, SessionOutcome, SessionState, StreamSession, VendorResponseParser,
    Worker, WorkerCommand,
};
use tokio::sync::oneshot;

struct Options {
    bulk: bool,
    config: Option<PathBuf>,
    timeout: Option<u64>,
    program: String,
    args: Vec<String>,
}

fn usage(bin: &str) -> ! {
    eprintln!("Usage: {} [--bulk] [--config PATH] [--timeout SECS] <program> [args...]", bin);
    eprintln!("\nRuns <program> as the request worker and prints its decoded response.");
    eprintln!("\nOptions:");
    eprintln!("  --bulk            Parse the whole output as one JSON response");
    eprintln!("  --config PATH     Engine configuration (TOML or YAML)");
    eprintln!("  --timeout SECS    Override the session deadline");
    eprintln!("\nSet RUST_LOG=pagewise_relay=debug for per-tick logging.");
    std::process::exit(2);
}

fn parse_args(args: &[String]) -> Option<Options> {
    let mut options = Options {
        bulk: false,
        config: None,
        timeout: None,
        program: String::new(),
        args: Vec::new(),
    };

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--bulk" => options.bulk = true,
            "--config" => options.config = Some(PathBuf::from(iter.next()?)),
            "--timeout" => options.timeout = Some(iter.next()?.parse().ok()?),
            "-h" | "--help" => return None,
            _ => {
                options.program = arg.clone();
                options.args = iter.cloned().collect();
                return Some(options);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let bin = args.first().map(String::as_str).unwrap_or("pagewise-relay");
    let Some(options) = parse_args(&args) else {
        usage(bin);
    };

    let mut config = match &options.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };
    if let Some(secs) = options.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }

    let worker = Worker::command(WorkerCommand::new(&options.program).args(&options.args));
    let (tx, rx) = oneshot::channel::<SessionOutcome>();
    let on_complete = move |outcome: SessionOutcome| {
        let _ = tx.send(outcome);
    };

    let started = if options.bulk {
        BulkSession::new(config).start(worker, VendorResponseParser, on_complete)
    } else {
        StreamSession::new(config).start(
            worker,
            |fragment: &str, _accumulated: &str| {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            },
            on_complete,
        )
    };

    let handle = match started {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start request: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = handle.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(session_id = %handle.id(), "interrupt received, cancelling");
            handle.cancel();
        }
    }
    let state = handle.finished().await;

    match rx.await {
        Ok(SessionOutcome {
            result: Ok(response),
            ..
        }) => {
            if options.bulk {
                println!("{}", response.content);
            } else {
                println!();
            }
            if let Some(reasoning) = response.reasoning.text {
                eprintln!("\n[reasoning]\n{}", reasoning);
            }
            if let Some(metadata) = response.metadata {
                eprintln!("\n[metadata] {}", metadata);
            }
        }
        Ok(SessionOutcome {
            result: Err(e), ..
        }) => {
            eprintln!("\nRequest {:?}: {}", state, e);
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("Request ended without a result");
            std::process::exit(1);
        }
    }

    if state != SessionState::Completed {
        std::process::exit(1);
    }
}
