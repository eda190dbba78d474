//! execmode CLI: list, call and measure the demo routes.
//!
//! ```bash
//! execmode routes
//! execmode call async-hello --delay-ms 500
//! execmode call stream-log --limit 3 --tick-interval-ms 200
//! execmode metrics hello can-block dont-block
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;

use execmode::{
    Dispatcher, ExecError, ExecmodeOptions, HttpClient, Response, StreamResponse, StreamSink, api,
    init_logging,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(
    name = "execmode",
    version,
    about = "Dispatch the demo routes across event-loop and worker pools"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON options file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Event-loop pool size
    #[arg(long, global = true)]
    event_loop_threads: Option<usize>,

    /// Upper bound of the worker pool
    #[arg(long, global = true)]
    worker_threads: Option<usize>,

    /// Delay used by the delayed routes, in milliseconds
    #[arg(long, global = true)]
    delay_ms: Option<u64>,

    /// Tick interval of stream-log, in milliseconds
    #[arg(long, global = true)]
    tick_interval_ms: Option<u64>,

    /// Base URL of the joke API
    #[arg(long, global = true)]
    base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered routes and their execution modes
    Routes,

    /// Dispatch one route and print its result
    Call(CallArgs),

    /// Dispatch routes concurrently and print dispatcher metrics as JSON
    Metrics(MetricsArgs),
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Route to dispatch
    route: String,

    /// Cancel a streaming route after this many items
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Args, Debug)]
struct MetricsArgs {
    /// Routes to dispatch
    #[arg(required = true)]
    routes: Vec<String>,

    /// Items to take from each streaming route
    #[arg(long, default_value_t = 3)]
    limit: u64,
}

fn load_options(cli: &Cli) -> anyhow::Result<ExecmodeOptions> {
    let mut options = ExecmodeOptions::load(cli.config.as_deref())?;
    if let Some(n) = cli.event_loop_threads {
        options.event_loop_threads = n;
    }
    if let Some(n) = cli.worker_threads {
        options.worker_threads = n;
    }
    if let Some(ms) = cli.delay_ms {
        options.api.delay_ms = ms;
    }
    if let Some(ms) = cli.tick_interval_ms {
        options.api.tick_interval_ms = ms;
    }
    if let Some(url) = &cli.base_url {
        options.outbound.base_url = url.clone();
    }
    options.sanitize()?;
    Ok(options)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let options = load_options(&cli)?;
    init_logging(&options.logging)?;

    let dispatcher = Dispatcher::new(options.clone()).context("Failed to start dispatcher")?;
    let client = HttpClient::new(&options.outbound.base_url)?;
    api::register_routes(dispatcher.registry(), &options, Arc::new(client))?;

    let code = match cli.command {
        Command::Routes => {
            for (route, mode) in dispatcher.registry().routes() {
                println!("{route:<16}{mode}");
            }
            ExitCode::SUCCESS
        }
        Command::Call(args) => futures::executor::block_on(call(&dispatcher, args))?,
        Command::Metrics(args) => futures::executor::block_on(metrics(&dispatcher, args))?,
    };

    dispatcher.shutdown(SHUTDOWN_TIMEOUT);
    Ok(code)
}

async fn call(dispatcher: &Dispatcher, args: CallArgs) -> anyhow::Result<ExitCode> {
    match dispatcher.dispatch(&args.route).await {
        Response::Body(body) => {
            println!("{body}");
            Ok(ExitCode::SUCCESS)
        }
        Response::Error(error) => {
            eprintln!("{} {}", error.status_code(), error);
            Ok(ExitCode::FAILURE)
        }
        Response::Stream(stream) => {
            let limit = args.limit.map_or(usize::MAX, |n| n as usize);
            let mut frames = Box::pin(stream.sse_frames().take(limit));
            while let Some(frame) = frames.next().await {
                println!("{}", frame.trim_end());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn metrics(dispatcher: &Dispatcher, args: MetricsArgs) -> anyhow::Result<ExitCode> {
    let limit = args.limit;
    let calls = args.routes.iter().map(|route| async move {
        let response = dispatcher.dispatch(route).await;
        let outcome = match response {
            Response::Stream(stream) => drain(stream, limit).await.map(|n| format!("{n} items")),
            Response::Body(body) => Ok(body),
            Response::Error(error) => Err(error),
        };
        (route, outcome)
    });

    let mut failed = false;
    for (route, outcome) in futures::future::join_all(calls).await {
        match outcome {
            Ok(summary) => eprintln!("{route}: {summary}"),
            Err(error) => {
                failed = true;
                eprintln!("{route}: {} {}", error.status_code(), error);
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&dispatcher.metrics())?);
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

enum SinkEvent {
    Item,
    Failed(ExecError),
    Ended,
}

struct CountingSink(mpsc::UnboundedSender<SinkEvent>);

impl StreamSink for CountingSink {
    fn on_emit(&mut self, _item: String) {
        let _ = self.0.send(SinkEvent::Item);
    }

    fn on_complete(&mut self) {
        let _ = self.0.send(SinkEvent::Ended);
    }

    fn on_cancel(&mut self) {
        let _ = self.0.send(SinkEvent::Ended);
    }

    fn on_failure(&mut self, error: ExecError) {
        let _ = self.0.send(SinkEvent::Failed(error));
    }
}

/// Take up to `limit` items, then cancel and wait until the stream has
/// actually terminated so the metrics include it.
async fn drain(stream: StreamResponse, limit: u64) -> Result<u64, ExecError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = stream.deliver(CountingSink(tx));

    let mut seen = 0;
    if limit == 0 {
        subscription.cancel();
    }
    while let Some(event) = rx.recv().await {
        match event {
            SinkEvent::Item => {
                seen += 1;
                if seen >= limit {
                    subscription.cancel();
                }
            }
            SinkEvent::Failed(error) => return Err(error),
            SinkEvent::Ended => break,
        }
    }
    Ok(seen)
}
