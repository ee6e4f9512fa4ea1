use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tierstore_common::settings::StorageConfig;
use tierstore_common::{ByteRange, ObjectStoreError, OpContext, TierError};
use tierstore_disk::StoreOp;
use tierstore_storage::{MemoryTransport, PlacementEngine, StorageRegistry};
use tierstore_table::TableStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod scenario;

/// Built-in configuration used when no `--config` is given. `{local_path}`
/// is replaced with a scratch directory.
const DEFAULT_CONFIG: &str = r#"
[disks.s3]
type = "remote-object"
endpoint = "mem://demo-bucket/data/"
access_key = "demo"
secret_key = "demo-secret"
supports_delete = false
max_single_part_upload_size = 4096
max_single_read_retries = 3
max_unexpected_write_error_retries = 3
quota_bytes = 65536
retry_backoff = { kind = "exponential", initial_ms = 10, max_ms = 100, multiplier = 2.0 }
cache_enabled = true
cache_max_bytes = 16384

[disks.local]
type = "local"
path = "{local_path}"
capacity_bytes = 1048576
keep_free_space_bytes = 4096

[volumes.main]
disks = ["s3"]

[volumes.external]
disks = ["local"]
max_part_size = 262144

[policies.s3_main]
volumes = ["main", "external"]
move_factor = 0.2

[merge_tree]
min_bytes_for_wide_part = 8192
"#;

const DEFAULT_POLICY: &str = "s3_main";
const DEFAULT_TABLE: &str = "events";

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Everything a command needs: transport, registry, engine and one table.
pub struct Stack {
    pub transport: Arc<MemoryTransport>,
    pub engine: Arc<PlacementEngine>,
    pub table: Arc<TableStore>,
}

impl Stack {
    pub fn build(config: &StorageConfig, latency: Duration, policy: &str) -> anyhow::Result<Self> {
        let transport = Arc::new(MemoryTransport::with_latency(latency));
        let registry = StorageRegistry::from_config(config, transport.as_ref())?;
        let engine = Arc::new(PlacementEngine::new(Arc::new(registry)));
        let table = Arc::new(TableStore::new(DEFAULT_TABLE, policy, engine.clone())?);
        Ok(Self {
            transport,
            engine,
            table,
        })
    }

    /// Snapshot of disks, volumes, policies and parts as JSON.
    pub fn describe(&self) -> serde_json::Value {
        let registry = self.engine.registry();
        let disks: Vec<_> = registry
            .disks()
            .map(|d| {
                json!({
                    "name": d.name(),
                    "kind": d.kind(),
                    "supports_delete": d.capabilities().supports_delete,
                    "space": d.space(),
                })
            })
            .collect();
        let volumes: Vec<_> = registry
            .volumes()
            .map(|v| {
                json!({
                    "name": v.name(),
                    "disks": v.disks().iter().map(|d| d.name()).collect::<Vec<_>>(),
                    "max_part_size": v.max_part_size(),
                    "free_ratio": v.free_ratio(),
                })
            })
            .collect();
        let policies: Vec<_> = registry
            .policies()
            .map(|p| {
                json!({
                    "name": p.name(),
                    "volumes": p.volumes().iter().map(|v| v.name()).collect::<Vec<_>>(),
                    "move_factor": p.move_factor(),
                })
            })
            .collect();
        json!({
            "disks": disks,
            "volumes": volumes,
            "policies": policies,
            "table": {
                "name": self.table.name(),
                "policy": self.table.policy(),
                "parts": self.table.parts(),
            },
        })
    }
}

/// Load `path`, or the built-in config rooted at a fresh scratch directory.
pub fn load_config(path: Option<&str>, scratch: &Path) -> anyhow::Result<StorageConfig> {
    let content = match path {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let _ = std::fs::remove_dir_all(scratch);
            DEFAULT_CONFIG.replace("{local_path}", &scratch.join("local").display().to_string())
        }
    };
    Ok(StorageConfig::from_toml_str(&content)?)
}

fn op_context(timeout_ms: Option<u64>) -> OpContext {
    match timeout_ms {
        Some(ms) => OpContext::with_timeout(Duration::from_millis(ms)),
        None => OpContext::unbounded(),
    }
}

fn pattern(size: u64, seed: u8) -> Vec<u8> {
    (0..size).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) if data.len() <= 40 => format!("{text:?}"),
        _ => format!("{} bytes, crc32={:08x}", data.len(), crc32fast::hash(data)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("demo");

    let config_path = parse_flag_string(&args, "--config");
    let policy = parse_flag_string(&args, "--policy").unwrap_or_else(|| DEFAULT_POLICY.to_string());
    let latency_ms = parse_flag_value(&args, "--latency-ms").unwrap_or(0);
    let timeout_ms = parse_flag_value(&args, "--timeout-ms");
    let scratch = std::env::temp_dir().join(format!("tierstore-{cmd}"));

    match cmd {
        "demo" => run_demo(&scratch).await?,
        "repl" => {
            let config = load_config(config_path.as_deref(), &scratch)?;
            let stack = Stack::build(&config, Duration::from_millis(latency_ms), &policy)?;
            run_repl(stack, timeout_ms).await?;
        }
        "describe" => {
            let config = load_config(config_path.as_deref(), &scratch)?;
            let stack = Stack::build(&config, Duration::ZERO, &policy)?;
            println!("{}", serde_json::to_string_pretty(&stack.describe())?);
        }
        "scenario" => {
            let scenario_path = args.get(2).cloned().unwrap_or_else(|| {
                eprintln!("Usage: tierstore scenario <file.toml> [--config path] [--latency-ms ms]");
                std::process::exit(1);
            });
            scenario::run_scenario_cli(
                &scenario_path,
                config_path.as_deref(),
                &scratch,
                Duration::from_millis(latency_ms),
                timeout_ms,
            )
            .await?;
        }
        _ => {
            eprintln!("Usage: tierstore [demo|repl|describe|scenario] [--config path] [--policy name]");
            eprintln!("       [--latency-ms <ms>] [--timeout-ms <ms>]");
            eprintln!("       tierstore scenario <file.toml> [flags...]");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<u64> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn parse_flag_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

async fn run_demo(scratch: &Path) -> anyhow::Result<()> {
    println!("=== Tierstore Demo ===\n");

    let config = load_config(None, scratch)?;
    let stack = Stack::build(&config, Duration::ZERO, DEFAULT_POLICY)?;
    let table = &stack.table;
    let ctx = OpContext::unbounded();
    let store = stack.transport.store("mem://demo-bucket/data/");

    // 1. New parts land on the first volume
    println!("Inserting a 1 KiB part and a 10 KiB part...");
    let p1 = table.insert("p1", &pattern(1024, 1), &ctx).await?;
    let p2 = table.insert("p2", &pattern(10 * 1024, 2), &ctx).await?;
    println!("  p1 -> {} ({})", p1.disk, p1.format);
    println!(
        "  p2 -> {} ({}, {} multipart parts uploaded)",
        p2.disk,
        p2.format,
        store.calls(StoreOp::UploadPart)
    );

    // 2. Transient failures are retried
    println!("\nReading p1 while the backend times out twice...");
    store.fail_next(StoreOp::Get, 2, ObjectStoreError::Timeout);
    let data = table.read("p1", ByteRange::FULL, &ctx).await?;
    println!("  read {} ({} GET calls)", preview(&data), store.calls(StoreOp::Get));

    // 3. Second read is a cache hit
    let before = store.calls(StoreOp::Get);
    table.read("p1", ByteRange::new(0, 16), &ctx).await?;
    println!("  re-read served from cache: {}", store.calls(StoreOp::Get) == before);

    // 4. The remote disk refuses deletes
    println!("\nDropping p1 from a no-delete disk...");
    match table.drop_part("p1", &ctx).await {
        Err(e @ TierError::UnsupportedOperation { .. }) => println!("  refused: {e}"),
        other => println!("  unexpected: {other:?}"),
    }

    // 5. The main volume fills up; new parts spill over
    println!("\nInserting a 60 KiB part...");
    let p3 = table.insert("p3", &pattern(60 * 1024, 3), &ctx).await?;
    println!("  p3 -> {} (main volume full)", p3.disk);

    // 6. Explicit move and rebalance
    println!("\nMoving p2 to the external volume...");
    let moved = table.move_part("p2", "external", &ctx).await?;
    println!("  p2 -> {} (old copy left in place: {})", moved.disk, store.raw(&p2.key).is_some());
    let rebalanced = table.rebalance(&ctx).await?;
    println!("  rebalance moved {} part(s)", rebalanced.len());

    println!("\n{}", serde_json::to_string_pretty(&stack.describe())?);

    let _ = std::fs::remove_dir_all(scratch);
    println!("\nDemo complete.");
    Ok(())
}

// ---------------------------------------------------------------------------
// REPL
// ---------------------------------------------------------------------------

/// Periodic rebalance task started from the REPL.
struct RebalanceWorker {
    cancel: CancellationToken,
    interval_ms: u64,
    task: tokio::task::JoinHandle<()>,
}

impl RebalanceWorker {
    fn spawn(table: Arc<TableStore>, interval_ms: u64) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        info!(interval_ms, "background rebalance started");
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let ctx = OpContext::unbounded().with_cancel(token.clone());
                        match table.rebalance(&ctx).await {
                            Ok(moved) if !moved.is_empty() => {
                                let ids: Vec<&str> = moved.iter().map(|p| p.id.as_str()).collect();
                                println!("\n[bg] rebalance moved {ids:?}");
                            }
                            Ok(_) => {}
                            Err(TierError::Cancelled) => break,
                            Err(e) => warn!(error = %e, "background rebalance failed"),
                        }
                    }
                }
            }
        });
        Self {
            cancel,
            interval_ms,
            task,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run_repl(stack: Stack, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    println!("=== Tierstore REPL (table {}, policy {}) ===", stack.table.name(), stack.table.policy());
    println!("Commands: insert <id> <size|text>, read <id> [offset] [len], drop <id>");
    println!("          move <id> <volume>, rebalance, parts, describe");
    println!("          bg <ms>, bg stop, quit\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut worker: Option<RebalanceWorker> = None;
    let mut seed = 0u8;

    loop {
        print!("tier> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();
        if parts.is_empty() || parts[0].is_empty() {
            continue;
        }
        let ctx = op_context(timeout_ms);

        match parts[0] {
            "insert" => {
                if parts.len() < 3 {
                    println!("Usage: insert <id> <size|text>");
                    continue;
                }
                seed = seed.wrapping_add(1);
                let data = match parts[2].parse::<u64>() {
                    Ok(size) => pattern(size, seed),
                    Err(_) => parts[2].as_bytes().to_vec(),
                };
                match stack.table.insert(parts[1], &data, &ctx).await {
                    Ok(part) => println!("OK {} bytes on {} ({})", part.size, part.disk, part.format),
                    Err(e) => println!("Error: {e}"),
                }
            }
            "read" => {
                if parts.len() < 2 {
                    println!("Usage: read <id> [offset] [len]");
                    continue;
                }
                let range = match parts.get(2).map(|r| parse_range(r)) {
                    None => ByteRange::FULL,
                    Some(Some(range)) => range,
                    Some(None) => {
                        println!("Invalid range");
                        continue;
                    }
                };
                match stack.table.read(parts[1], range, &ctx).await {
                    Ok(data) => println!("{}", preview(&data)),
                    Err(e) => println!("Error: {e}"),
                }
            }
            "drop" => {
                if parts.len() < 2 {
                    println!("Usage: drop <id>");
                    continue;
                }
                match stack.table.drop_part(parts[1], &ctx).await {
                    Ok(()) => println!("OK"),
                    Err(e) => println!("Error: {e}"),
                }
            }
            "move" => {
                if parts.len() < 3 {
                    println!("Usage: move <id> <volume>");
                    continue;
                }
                match stack.table.move_part(parts[1], parts[2], &ctx).await {
                    Ok(part) => println!("OK now on {}", part.disk),
                    Err(e) => println!("Error: {e}"),
                }
            }
            "rebalance" => match stack.table.rebalance(&ctx).await {
                Ok(moved) => println!("moved {} part(s)", moved.len()),
                Err(e) => println!("Error: {e}"),
            },
            "parts" => {
                for part in stack.table.parts() {
                    println!(
                        "{:<12} {:>10} B  {:<8} {:<10} crc32={:08x}",
                        part.id, part.size, part.format, part.disk, part.checksum
                    );
                }
            }
            "describe" => println!("{}", serde_json::to_string_pretty(&stack.describe())?),
            "bg" => match parts.get(1).copied() {
                Some("stop") => match worker.take() {
                    Some(w) => {
                        w.stop().await;
                        println!("background rebalance stopped");
                    }
                    None => println!("no background rebalance running"),
                },
                Some(ms) => match ms.parse::<u64>() {
                    Ok(interval_ms) => {
                        if let Some(w) = worker.take() {
                            w.stop().await;
                        }
                        let w = RebalanceWorker::spawn(stack.table.clone(), interval_ms);
                        println!("background rebalance every {}ms", w.interval_ms);
                        worker = Some(w);
                    }
                    Err(_) => println!("Usage: bg <ms> | bg stop"),
                },
                None => println!("Usage: bg <ms> | bg stop"),
            },
            "quit" | "exit" | "q" => break,
            other => println!("Unknown command: {other}"),
        }
    }

    if let Some(w) = worker.take() {
        w.stop().await;
    }
    println!("Bye!");
    Ok(())
}

/// `offset` or `offset len`.
fn parse_range(text: &str) -> Option<ByteRange> {
    let mut fields = text.split_whitespace();
    let offset = fields.next()?.parse().ok()?;
    match fields.next() {
        Some(len) => Some(ByteRange::new(offset, len.parse().ok()?)),
        None => Some(ByteRange::from_offset(offset)),
    }
}
