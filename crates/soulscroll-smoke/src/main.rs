//! SoulScroll offline smoke harness
//!
//! Registers a worker against a live origin, replays the app shell through
//! the fetch interceptor and reports where each response came from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use soulscroll_common::{init_logging, LogConfig, LogFormat};
use soulscroll_net::{HttpFetcher, LoaderConfig, Request};
use soulscroll_sw::{ClientMessage, Lifecycle, MessageTarget, WorkerConfig};
use tracing::{error, info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: HashMap::new(),
        }
    }

    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = ms.iter().sum();
            let max_ms = ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": ms.len(),
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / ms.len() as f64),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Parse command line arguments
struct Args {
    origin: Option<String>,
    version: Option<String>,
    config: Option<String>,
    log: LogFormat,
    log_filter: Option<String>,
    output: Option<String>,
}

impl Args {
    fn parse() -> Self {
        Self::from_args(std::env::args().skip(1))
    }

    fn from_args(mut args: impl Iterator<Item = String>) -> Self {
        let mut parsed = Self {
            origin: None,
            version: None,
            config: None,
            log: LogFormat::Pretty,
            log_filter: None,
            output: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--origin" => parsed.origin = args.next(),
                "--version" => parsed.version = args.next(),
                "--config" => parsed.config = args.next(),
                "--log" => {
                    if let Some(val) = args.next() {
                        match val.parse() {
                            Ok(format) => parsed.log = format,
                            Err(e) => eprintln!("Warning: {}, using pretty logs", e),
                        }
                    }
                }
                "--log-filter" => parsed.log_filter = args.next(),
                "--output" => parsed.output = args.next(),
                other => eprintln!("Warning: ignoring unknown argument {}", other),
            }
        }

        parsed
    }

    fn worker_config(&self) -> Result<WorkerConfig, String> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path).map_err(|e| e.to_string())?,
            None => WorkerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            let origin = Url::parse(origin).map_err(|e| format!("bad --origin {}: {}", origin, e))?;
            config = config.with_origin(origin);
        }
        if let Some(version) = &self.version {
            config = config.with_version(version.as_str());
        }
        Ok(config)
    }
}

async fn run(args: &Args, perf: &mut PerfTiming) -> Result<serde_json::Value, String> {
    let config = args.worker_config()?;
    info!(origin = %config.origin, version = %config.version, "Starting SoulScroll smoke harness");

    let loader = LoaderConfig::default().with_origin(config.origin.clone());
    let fetcher = HttpFetcher::new(loader).map_err(|e| e.to_string())?;
    let lifecycle = Lifecycle::new(Arc::new(fetcher));

    let started = Instant::now();
    let worker = lifecycle.register(config.clone()).await.map_err(|e| e.to_string())?;
    perf.record("register", started.elapsed());

    let mut resources = Vec::new();
    for path in config.precache.iter() {
        let url = config.resolve(path).map_err(|e| e.to_string())?;
        let request = if path == "/" {
            Request::navigate(url)
        } else {
            Request::get(url)
        };

        let started = Instant::now();
        match lifecycle.fetch(request).await {
            Ok(outcome) => {
                perf.record("fetch", started.elapsed());
                resources.push(json!({
                    "path": path,
                    "status": outcome.response.status.as_u16(),
                    "source": format!("{:?}", outcome.source),
                }));
            }
            Err(e) => {
                warn!(path, error = %e, "Fetch failed");
                resources.push(json!({ "path": path, "error": e.to_string() }));
            }
        }
    }

    let started = Instant::now();
    let version = match lifecycle
        .post_message(ClientMessage::GetVersion, MessageTarget::Active)
        .await
    {
        Ok(Some(reply)) => reply.to_json(),
        Ok(None) => serde_json::Value::Null,
        Err(e) => return Err(e.to_string()),
    };
    perf.record("get_version", started.elapsed());

    Ok(json!({
        "worker": worker.id().raw(),
        "state": worker.state(),
        "store_names": lifecycle.caches().list_store_names().await,
        "version_response": version,
        "resources": resources,
    }))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut log_config = LogConfig::default().with_format(args.log);
    if let Some(ref directives) = args.log_filter {
        log_config = log_config.with_directives(directives.as_str());
    }
    if let Err(e) = init_logging(log_config) {
        eprintln!("Warning: logging not initialised: {}", e);
    }

    let start = Instant::now();
    let mut perf = PerfTiming::new();

    let (status, report) = match run(&args, &mut perf).await {
        Ok(report) => ("pass", report),
        Err(e) => {
            error!(error = %e, "Smoke run failed");
            ("fail", json!({ "error": e }))
        }
    };

    let result = json!({
        "status": status,
        "elapsed_ms": start.elapsed().as_millis() as u64,
        "report": report,
        "perf": perf.summary(),
    });

    if let Some(ref path) = args.output {
        if let Err(e) = std::fs::write(path, result.to_string()) {
            error!(?e, "Failed to write report");
        } else {
            info!(?path, "Report written");
        }
    }

    println!("{}", result);

    if status != "pass" {
        std::process::exit(1);
    }
}
