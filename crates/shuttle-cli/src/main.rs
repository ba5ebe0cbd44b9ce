use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use shuttle_core::config::{
    DiscoveryConfig, PolicyConfig, QueueSettings, SandboxConfig, StoreConfig, TimerPolicy,
    WorkerConfig,
};
use shuttle_core::domain::Job;
use shuttle_core::impls::{EtcdStateStore, InMemoryJobQueue, InMemoryStateStore};
use shuttle_core::ports::StateStore;
use shuttle_core::WorkerBuilder;

mod shutdown;

#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(version)]
#[command(about = "Worker-side job execution coordinator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Consume jobs and report their outcome to the coordination store
    Run(RunArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TimerKind {
    Fixed,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DecisionKind {
    Threshold,
    Random,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Job type to consume; also published as the algorithm name
    #[arg(long, env = "ALG", default_value = "green-alg")]
    alg: String,

    /// Coordination store backend
    #[arg(long, value_enum, default_value = "memory")]
    store: StoreKind,

    #[arg(long, env = "ETCD_SERVICE_HOST", default_value = "localhost")]
    etcd_host: String,

    #[arg(long, env = "ETCD_SERVICE_PORT", default_value = "4001")]
    etcd_port: u16,

    #[arg(long, env = "ETCD_PROTOCOL", default_value = "http")]
    etcd_protocol: String,

    /// Completion timer in milliseconds (the lower bound for `random`)
    #[arg(long, env = "JOB_TIMER_MS", default_value = "100")]
    timer_ms: u64,

    #[arg(long, env = "JOB_TIMER_POLICY", value_enum, default_value = "fixed")]
    timer_policy: TimerKind,

    /// Upper bound for the `random` timer policy
    #[arg(long, env = "JOB_TIMER_MAX_MS")]
    timer_max_ms: Option<u64>,

    #[arg(long, env = "DECISION_POLICY", value_enum, default_value = "threshold")]
    decision_policy: DecisionKind,

    #[arg(long, env = "DECISION_THRESHOLD", default_value = "10")]
    decision_threshold: f64,

    #[arg(long, env = "DECISION_SUCCESS_RATE", default_value = "0.8")]
    decision_success_rate: f64,

    /// Sandbox evaluation limit in milliseconds (0 disables it)
    #[arg(long, env = "SANDBOX_TIMEOUT_MS", default_value = "30000")]
    sandbox_timeout_ms: u64,

    /// Sandbox heap limit in bytes (0 disables it)
    #[arg(long, env = "SANDBOX_MEMORY_LIMIT", default_value = "67108864")]
    sandbox_memory_limit: usize,

    #[arg(long, env = "QUEUE_CONCURRENCY", default_value = "1")]
    concurrency: usize,

    #[arg(long, env = "QUEUE_LOCK_DURATION_MS", default_value = "30000")]
    lock_duration_ms: u64,

    #[arg(long, env = "QUEUE_STALLED_INTERVAL_MS", default_value = "30000")]
    stalled_interval_ms: u64,

    #[arg(long, env = "QUEUE_MAX_STALLED_COUNT", default_value = "1")]
    max_stalled_count: u32,

    #[arg(long, env = "DISCOVERY_SERVICE_NAME", default_value = "worker-stub")]
    service_name: String,

    #[arg(long, env = "DISCOVERY_INTERVAL_MS", default_value = "10000")]
    discovery_interval_ms: u64,

    /// Job payloads to seed the local queue with (JSON array or JSON lines, `-` for stdin)
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Stop once every seeded job has been acknowledged
    #[arg(long)]
    exit_when_idle: bool,
}

impl RunArgs {
    fn worker_config(&self) -> Result<WorkerConfig> {
        let timer_min = Duration::from_millis(self.timer_ms);
        let timer = match self.timer_policy {
            TimerKind::Fixed => TimerPolicy::Fixed(timer_min),
            TimerKind::Random => TimerPolicy::Random {
                min: timer_min,
                max: Duration::from_millis(
                    self.timer_max_ms
                        .unwrap_or(self.timer_ms.saturating_mul(2)),
                ),
            },
        };
        let policy = match self.decision_policy {
            DecisionKind::Threshold => PolicyConfig::Threshold {
                threshold: self.decision_threshold,
            },
            DecisionKind::Random => PolicyConfig::Random {
                success_rate: self.decision_success_rate,
            },
        };

        let config = WorkerConfig::new(self.alg.clone())
            .with_store(StoreConfig {
                protocol: self.etcd_protocol.clone(),
                host: self.etcd_host.clone(),
                port: self.etcd_port,
                ..Default::default()
            })
            .with_queue(QueueSettings {
                concurrency: self.concurrency,
                lock_duration: Duration::from_millis(self.lock_duration_ms),
                stalled_interval: Duration::from_millis(self.stalled_interval_ms),
                max_stalled_count: self.max_stalled_count,
            })
            .with_timer(timer)
            .with_policy(policy)
            .with_sandbox(SandboxConfig {
                timeout: (self.sandbox_timeout_ms > 0)
                    .then(|| Duration::from_millis(self.sandbox_timeout_ms)),
                memory_limit: (self.sandbox_memory_limit > 0).then_some(self.sandbox_memory_limit),
            })
            .with_discovery(DiscoveryConfig {
                service_name: self.service_name.clone(),
                interval: Duration::from_millis(self.discovery_interval_ms),
            });
        config.validate()?;
        Ok(config)
    }
}

/// Parse job payloads: a JSON array, or one JSON object per line.
fn parse_jobs(text: &str) -> Result<Vec<Job>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let payloads: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("jobs file is not a JSON array")?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| format!("line {} is not JSON", n + 1))
            })
            .collect::<Result<_>>()?
    };

    payloads
        .into_iter()
        .enumerate()
        .map(|(n, payload)| {
            Job::from_payload(payload).with_context(|| format!("job #{} is invalid", n + 1))
        })
        .collect()
}

async fn read_jobs(path: &PathBuf) -> Result<Vec<Job>> {
    let text = if path.as_os_str() == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("failed to read jobs from stdin")?;
        text
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?
    };
    parse_jobs(&text)
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "unhandled fault, exiting");
        default_hook(info);
        std::process::exit(1);
    }));
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.worker_config()?;

    let store: Arc<dyn StateStore> = match args.store {
        StoreKind::Memory => Arc::new(InMemoryStateStore::new()),
        StoreKind::Etcd => Arc::new(
            EtcdStateStore::new(config.store.clone()).context("failed to create etcd client")?,
        ),
    };
    let queue = Arc::new(InMemoryJobQueue::new(config.queue.clone()));

    if let Some(path) = &args.jobs {
        let jobs = read_jobs(path).await?;
        tracing::info!(count = jobs.len(), job_type = %config.algorithm, "seeding queue");
        for job in jobs {
            queue.enqueue(config.algorithm.clone(), job).await?;
        }
    }

    let worker = WorkerBuilder::new(config)
        .store(store)
        .queue(queue.clone())
        .build()?;

    let shutdown = shutdown::install_shutdown_handler();
    let stalled_checker = queue.spawn_stalled_checker(shutdown.clone());

    if args.exit_when_idle {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue.wait_idle().await;
            tracing::info!("queue is idle, stopping");
            queue.close().await;
        });
    }

    tracing::info!(
        alg = %worker.config().algorithm,
        store = ?args.store,
        concurrency = worker.config().queue.concurrency,
        "worker starting"
    );
    let summary = worker.run(shutdown.clone()).await;

    shutdown.cancel();
    let _ = stalled_checker.await;

    tracing::info!(
        started = summary.started,
        succeeded = summary.succeeded,
        failed = summary.failed,
        stopped = summary.stopped,
        "worker stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    install_panic_hook();

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run(run_args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_lines_and_arrays() {
        let lines = r#"
            {"jobId": "j1", "taskId": "t1", "input": [3]}

            {"jobId": "j2", "taskId": "t2", "input": [11]}
        "#;
        let jobs = parse_jobs(lines).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].job_id.as_str(), "j2");

        let array = r#"[{"jobId": "j1", "taskId": "t1", "pipeline_name": "p"}]"#;
        let jobs = parse_jobs(array).unwrap();
        assert_eq!(jobs[0].pipeline_name, "p");

        assert!(parse_jobs("   ").unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_payloads() {
        assert!(parse_jobs("{not json}").is_err());
        assert!(parse_jobs(r#"{"jobId": "", "taskId": "t1"}"#).is_err());
    }

    #[test]
    fn env_style_arguments_map_onto_worker_config() {
        let args = Args::parse_from([
            "shuttle",
            "run",
            "--alg",
            "blue-alg",
            "--timer-policy",
            "random",
            "--timer-ms",
            "100",
            "--timer-max-ms",
            "300",
            "--sandbox-timeout-ms",
            "0",
        ]);
        let Commands::Run(run_args) = args.command;
        let config = run_args.worker_config().unwrap();

        assert_eq!(config.algorithm, "blue-alg");
        assert_eq!(
            config.timer,
            TimerPolicy::Random {
                min: Duration::from_millis(100),
                max: Duration::from_millis(300),
            }
        );
        assert_eq!(config.sandbox.timeout, None);
        assert_eq!(config.store.endpoint(), "http://localhost:4001");
    }

    #[test]
    fn huge_timer_without_upper_bound_does_not_overflow() {
        let timer_ms = u64::MAX.to_string();
        let args = Args::parse_from([
            "shuttle",
            "run",
            "--timer-policy",
            "random",
            "--timer-ms",
            timer_ms.as_str(),
        ]);
        let Commands::Run(run_args) = args.command;
        let config = run_args.worker_config().unwrap();

        assert_eq!(
            config.timer,
            TimerPolicy::Random {
                min: Duration::from_millis(u64::MAX),
                max: Duration::from_millis(u64::MAX),
            }
        );
    }
}
