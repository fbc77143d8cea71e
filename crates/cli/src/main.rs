use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kready_api::{AwaitRequest, InProcApi, ReadinessApi};
use kready_conditions::{AwaitSpec, Catalog};
use kready_core::{AwaitResult, KindRef, ObjectRef, Operation, Outcome, Settings};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kreadyctl", version, about = "Kready CLI: await Kubernetes objects until they are ready")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace of the target
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OpArg { Create, Update }

impl From<OpArg> for Operation {
    fn from(o: OpArg) -> Self {
        match o {
            OpArg::Create => Operation::Create,
            OpArg::Update => Operation::Update,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait until an object is ready
    Await {
        /// GVK key, e.g. "apps/v1/Deployment" or "v1/Service"
        gvk: String,
        name: String,
        #[arg(long = "op", value_enum, default_value_t = OpArg::Create)]
        op: OpArg,
        /// Timeout in seconds (default: the kind's catalog timeout)
        #[arg(long = "timeout")]
        timeout: Option<u64>,
    },
    /// Wait until an object is gone
    DeleteAwait {
        /// GVK key, e.g. "apps/v1/Deployment"
        gvk: String,
        name: String,
        #[arg(long = "timeout")]
        timeout: Option<u64>,
    },
    /// Compute the patch and replace set for a mutation (offline)
    Decide {
        /// Previously submitted document (YAML or JSON)
        #[arg(long = "last")]
        last: Option<String>,
        /// Document to submit now
        #[arg(long = "current")]
        current: String,
        /// Live object as read from the cluster
        #[arg(long = "live")]
        live: Option<String>,
    },
    /// Show the readiness catalog, or the spec one kind resolves to
    Catalog {
        gvk: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KREADY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(settings: &Settings) {
    if let Some(addr) = settings.metrics_addr.as_deref() {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KREADY_METRICS_ADDR; expected host:port");
        }
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling await");
            child.cancel();
        }
    });
    token
}

fn read_doc(path: &str) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    kready_apply::load_document(&text).with_context(|| format!("parsing {path}"))
}

fn print_result(output: Output, res: &AwaitResult) -> Result<()> {
    match output {
        Output::Human => {
            println!("{}: {} ({}ms, {} snapshots)", res.outcome.as_str(), res.message, res.elapsed_ms, res.snapshots);
            if !res.is_ready() {
                for t in &res.trail {
                    let rv = t.resource_version.as_deref().unwrap_or("-");
                    println!("  rv={rv:<10} unmet: {}", if t.unmet.is_empty() { "(none)".to_string() } else { t.unmet.join(", ") });
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(res)?),
    }
    Ok(())
}

fn exit_code(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Ready => 0,
        Outcome::Failed => 1,
        Outcome::TimedOut => 2,
        Outcome::Cancelled => 130,
    }
}

fn print_spec(spec: &AwaitSpec) {
    let t = &spec.timeouts;
    let rules: Vec<_> = spec.rules.iter().map(|r| r.name.as_str()).collect();
    println!("{:<40} {}s/{}s/{}s  rules: {}", spec.kind.gvk_key(), t.create, t.update, t.delete, rules.join(", "));
    if !spec.fail_rules.is_empty() {
        let fails: Vec<_> = spec.fail_rules.iter().map(|r| r.name.as_str()).collect();
        println!("{:<40} fails fast: {}", "", fails.join(", "));
    }
    if !spec.dependents.is_empty() {
        let deps: Vec<_> = spec.dependents.iter().map(|d| d.kind.gvk_key()).collect();
        println!("{:<40} dependents: {}", "", deps.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = Settings::from_env().context("reading KREADY_* settings")?;
    init_metrics(&settings);
    let cli = Cli::parse();

    match cli.command {
        Commands::Await { gvk, name, op, timeout } => {
            let kind = KindRef::parse(&gvk)?;
            let target = ObjectRef::new(kind, cli.namespace.as_deref(), &name);
            info!(obj = %target, op = ?op, "await invoked");
            let api = InProcApi::connect(&settings).await?;
            let mut req = AwaitRequest::new(target, op.into());
            if let Some(secs) = timeout {
                req = req.with_timeout(Duration::from_secs(secs));
            }
            let res = api.await_ready(req, &cancel_on_ctrl_c()).await?;
            print_result(cli.output, &res)?;
            if !res.is_ready() {
                std::process::exit(exit_code(res.outcome));
            }
        }
        Commands::DeleteAwait { gvk, name, timeout } => {
            let kind = KindRef::parse(&gvk)?;
            let target = ObjectRef::new(kind, cli.namespace.as_deref(), &name);
            info!(obj = %target, "delete-await invoked");
            let api = InProcApi::connect(&settings).await?;
            let mut req = AwaitRequest::new(target, Operation::Delete);
            if let Some(secs) = timeout {
                req = req.with_timeout(Duration::from_secs(secs));
            }
            let res = api.await_deleted(req, &cancel_on_ctrl_c()).await?;
            print_result(cli.output, &res)?;
            if !res.is_ready() {
                std::process::exit(exit_code(res.outcome));
            }
        }
        Commands::Decide { last, current, live } => {
            let last = last.as_deref().map(read_doc).transpose()?;
            let current = read_doc(&current)?;
            let live = live.as_deref().map(read_doc).transpose()?;
            let decision = kready_apply::decide(last.as_ref(), &current, live.as_ref())?;
            let patch = decision.patch_json()?;
            let summary = live.as_ref().map(|l| {
                kready_apply::diff_summary(
                    &kready_apply::strip_server_fields(current.clone()),
                    &kready_apply::strip_server_fields(l.clone()),
                )
            });
            match cli.output {
                Output::Human => {
                    println!("patch ({}): {}", decision.patch_kind.as_str(), serde_json::to_string(&patch)?);
                    if decision.requires_replace() {
                        println!("replace: {}", decision.replace_fields.join(", "));
                    } else {
                        println!("replace: (none)");
                    }
                    if let Some(s) = summary {
                        println!("vs live: +{} ~{} -{}", s.adds, s.updates, s.removes);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({
                        "patch": patch,
                        "patchKind": decision.patch_kind,
                        "replaceFields": decision.replace_fields,
                        "summary": summary,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Catalog { gvk } => {
            let catalog = Catalog::builtin()?.with_generic_await(settings.await_all)?;
            let specs: Vec<AwaitSpec> = match gvk {
                Some(key) => {
                    let kind = KindRef::parse(&key)?;
                    if !catalog.has_entry(&kind) {
                        warn!(kind = %kind, "no catalog entry; showing the fallback spec");
                    }
                    vec![(*catalog.lookup(&kind)).clone()]
                }
                None => catalog.entries().iter().map(|s| (**s).clone()).collect(),
            };
            match cli.output {
                Output::Human => specs.iter().for_each(print_spec),
                Output::Json => println!("{}", serde_json::to_string_pretty(&specs)?),
            }
        }
    }

    Ok(())
}
