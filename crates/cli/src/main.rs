use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use duet_api::{AllowAll, Identity, Registry, Role};
use duet_core::{Backend, DualWriterMode, GroupVersionResource, RequestContext, Resource, ResourceInfo};
use duet_dualwrite::{RoutingTable, StorageConfig};
use duet_legacy::{LegacyAdapter, SqliteStore};
use duet_migrate::Migrator;
use duet_unified::{default_snapshot_path, UnifiedAdapter, UnifiedStore};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "duetctl", version, about = "Duet dual-write storage operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the routing policy of every configured resource
    Routes {
        /// Storage config (YAML or JSON); defaults to $DUET_CONFIG
        #[arg(long = "config")]
        config: Option<PathBuf>,
    },
    /// Seed the unified store snapshot from the legacy database
    Migrate(MigrateArgs),
    /// Run the create/get/update/delete scenario against in-memory backends
    Smoke {
        /// Dual writer mode (0-5)
        #[arg(long = "mode")]
        mode: u8,
    },
}

#[derive(Args, Debug, Clone)]
struct MigrateArgs {
    /// Storage config (YAML or JSON); defaults to $DUET_CONFIG
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Resource key, e.g. "shorturls.shorturl.grafana.app"
    #[arg(long = "resource")]
    resource: String,
    /// API version of the resource
    #[arg(long = "version", default_value = "v1")]
    version: String,
    /// Kind column in the legacy store (default: resource name)
    #[arg(long = "legacy-kind")]
    legacy_kind: Option<String>,
    /// Legacy SQLite database; defaults to $DUET_DB_PATH or ~/.duet/legacy.db
    #[arg(long = "db")]
    db: Option<PathBuf>,
    /// Unified store snapshot to load and write back; defaults to $DUET_SNAPSHOT_PATH or ~/.duet/unified.json
    #[arg(long = "snapshot")]
    snapshot: Option<PathBuf>,
    /// Continue token from an interrupted run
    #[arg(long = "resume")]
    resume: Option<String>,
    #[arg(long = "page-size", default_value_t = duet_migrate::DEFAULT_PAGE_SIZE)]
    page_size: usize,
    /// Compare source and destination after the run
    #[arg(long = "verify", action = ArgAction::SetTrue)]
    verify: bool,
    /// Replay and report, but leave the snapshot file untouched
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
}

fn init_tracing() {
    let env = std::env::var("DUET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DUET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DUET_METRICS_ADDR; expected host:port");
        }
    }
}

/// `resource.group` -> resource info, with the kind derived from the resource name.
fn info_for_key(key: &str, version: &str, legacy_kind: Option<&str>) -> Result<ResourceInfo> {
    let (resource, group) = key.split_once('.').unwrap_or((key, ""));
    ensure!(!resource.is_empty(), "invalid resource key {:?}", key);
    let kind = resource.trim_end_matches('s');
    let mut chars = kind.chars();
    let kind = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect::<String>(),
        None => bail!("invalid resource key {:?}", key),
    };
    Ok(ResourceInfo::new(
        GroupVersionResource::new(group, version, resource),
        kind,
        legacy_kind.unwrap_or(resource),
    ))
}

/// Cancel `ctx` on Ctrl-C.
fn cancel_on_ctrl_c(ctx: &RequestContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping");
            ctx.cancel();
        }
    });
}

/// Explicit config file, else the file named by `DUET_CONFIG`.
fn load_config(path: Option<&Path>) -> Result<StorageConfig> {
    let cfg = match path {
        Some(p) => StorageConfig::load(p)?,
        None => StorageConfig::from_env().context("no --config given")?,
    };
    Ok(cfg)
}

fn routes(cfg_path: Option<&Path>, output: Output) -> Result<()> {
    let cfg = load_config(cfg_path)?;
    let served = cfg.resources.keys().map(|k| info_for_key(k, "v1", None)).collect::<Result<Vec<_>>>()?;
    let table = RoutingTable::build(&cfg, &served)?;
    match output {
        Output::Human => {
            println!("{:<40} {:<5} {:<16} {:<8} {:<6} CONFLICTS", "RESOURCE", "MODE", "WRITES", "READS", "BOTH");
            for (key, p) in table.iter() {
                let writes: Vec<&str> = p.write_targets.iter().map(|k| k.as_str()).collect();
                println!(
                    "{:<40} {:<5} {:<16} {:<8} {:<6} {}",
                    key,
                    p.mode,
                    writes.join("+"),
                    p.read_target,
                    p.require_both_succeed,
                    p.conflict_policy.as_str()
                );
            }
        }
        Output::Json => {
            let rows: Vec<serde_json::Value> = table
                .iter()
                .map(|(key, p)| {
                    serde_json::json!({
                        "resource": key,
                        "mode": p.mode,
                        "writeTargets": p.write_targets.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
                        "readTarget": p.read_target,
                        "requireBothSucceed": p.require_both_succeed,
                        "conflictPolicy": p.conflict_policy.as_str(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

async fn migrate(args: &MigrateArgs, output: Output) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    let resource = args.resource.as_str();
    let rc = cfg.resource(resource).ok_or_else(|| anyhow!("resource {} is not configured", resource))?;
    if rc.mode == DualWriterMode::Mode5 {
        warn!(resource, "resource is already unified-only; legacy data may be stale");
    }
    let info = info_for_key(resource, &args.version, args.legacy_kind.as_deref())?;
    let sqlite = match &args.db {
        Some(db) => SqliteStore::open(db.to_str().ok_or_else(|| anyhow!("database path is not valid UTF-8"))?)?,
        None => SqliteStore::open_default()?,
    };
    let snapshot = args.snapshot.clone().unwrap_or_else(default_snapshot_path);
    let unified = Arc::new(UnifiedStore::load_or_new(&snapshot)?);
    let source: Arc<dyn Backend> = Arc::new(LegacyAdapter::new(Arc::new(sqlite), info.clone()));
    let dest: Arc<dyn Backend> = Arc::new(UnifiedAdapter::new(Arc::clone(&unified), info));

    let ctx = RequestContext::new();
    cancel_on_ctrl_c(&ctx);
    let migrator = Migrator::new(source, dest).with_page_size(args.page_size);
    let report = migrator.run(&ctx, args.resume.clone()).await.context("migration failed")?;
    let checked = if args.verify && report.complete {
        Some(migrator.verify(&ctx).await.context("verification failed")?)
    } else {
        None
    };
    // Partial runs are saved too, so --resume continues on top of them.
    let written = !args.dry_run;
    if written {
        unified.save(&snapshot)?;
    } else {
        info!(snapshot = %snapshot.display(), "dry run; snapshot not written");
    }

    match output {
        Output::Human => {
            println!(
                "listed {}  created {}  updated {}  unchanged {}  recreated {}  failed {}",
                report.listed, report.created, report.updated, report.unchanged, report.recreated, report.failed
            );
            for f in &report.failures {
                println!("  failed {}/{}: {}", f.namespace, f.name, f.error);
            }
            if !report.complete {
                println!("interrupted; resume with --resume {}", report.last_continue.as_deref().unwrap_or("\"\""));
            }
            if let Some(v) = &checked {
                println!("verify: checked {}  missing {}  mismatched {}", v.checked, v.missing.len(), v.mismatched.len());
            }
            if written {
                println!("snapshot written to {}", snapshot.display());
            } else {
                println!("dry run: {} not written", snapshot.display());
            }
        }
        Output::Json => {
            let out = serde_json::json!({
                "report": report,
                "verify": checked,
                "snapshot": snapshot.display().to_string(),
                "written": written,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    if let Some(v) = checked {
        ensure!(v.is_clean(), "destination does not match source");
    }
    Ok(())
}

/// Create, read, update and delete one object through the full stack for `mode`.
async fn smoke(mode: u8, output: Output) -> Result<()> {
    let mode = DualWriterMode::try_from(mode)?;
    let t0 = Instant::now();
    let info = ResourceInfo::new(GroupVersionResource::new("shorturl.grafana.app", "v1beta1", "shorturls"), "ShortURL", "short_url");
    let key = info.group_resource();
    let sqlite = Arc::new(SqliteStore::open_in_memory()?);
    let unified = Arc::new(UnifiedStore::new());
    let registry = Registry::builder(StorageConfig::default().with_mode(&key, mode))
        .serve(
            Arc::new(LegacyAdapter::new(sqlite, info.clone())),
            Arc::new(UnifiedAdapter::new(unified, info.clone())),
        )
        .build(Arc::new(AllowAll))?;
    let storage = registry.storage(&key).ok_or_else(|| anyhow!("{} not served", key))?;
    let ctx = RequestContext::new();
    let who = Identity::new("smoke", "default", Role::Admin);
    let mut steps: Vec<String> = Vec::new();

    let obj = Resource::new(&info, "default", "test-shorturl", serde_json::json!({"uid": "x", "path": "/d/a"}));
    let created = storage.create(&ctx, &who, obj).await?;
    ensure!(!created.is_degraded(), "shadow write failed on create");
    let got = storage.get(&ctx, &who, "default", "test-shorturl").await?;
    ensure!(got.generation() == 1, "expected generation 1, got {}", got.generation());
    ensure!(got.spec_field("path") == Some(&serde_json::json!("/d/a")), "spec mismatch after create");
    steps.push(format!("create rv={} generation={}", got.resource_version(), got.generation()));

    let mut edit = got.clone();
    edit.spec["path"] = serde_json::json!("/d/b");
    let updated = storage.update(&ctx, &who, "default", "test-shorturl", edit).await?.into_inner();
    ensure!(updated.resource_version() != got.resource_version(), "resourceVersion did not advance");
    let got = storage.get(&ctx, &who, "default", "test-shorturl").await?;
    ensure!(got.spec_field("path") == Some(&serde_json::json!("/d/b")), "update not visible");
    steps.push(format!("update rv={} generation={}", got.resource_version(), got.generation()));

    storage.delete(&ctx, &who, "default", "test-shorturl").await?;
    match storage.get(&ctx, &who, "default", "test-shorturl").await {
        Err(e) if e.is_not_found() => {}
        Err(e) => bail!("unexpected error after delete: {}", e),
        Ok(_) => bail!("object still readable after delete"),
    }
    let again = storage.delete(&ctx, &who, "default", "test-shorturl").await?;
    ensure!(!again.value, "second delete reported an existing object");
    steps.push("delete ok; second delete ok".to_string());

    info!(mode = %mode, took_ms = %t0.elapsed().as_millis(), "smoke ok");
    match output {
        Output::Human => {
            for s in &steps {
                println!("mode {}: {}", mode, s);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "mode": mode, "steps": steps }))?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Routes { config } => routes(config.as_deref(), cli.output)?,
        Commands::Migrate(args) => {
            info!(resource = %args.resource, dry_run = args.dry_run, "migrate invoked");
            migrate(&args, cli.output).await?
        }
        Commands::Smoke { mode } => smoke(mode, cli.output).await?,
    }
    Ok(())
}
