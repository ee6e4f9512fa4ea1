use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tierstore_common::settings::StorageConfig;
use tierstore_common::{ByteRange, ObjectStoreError};
use tierstore_disk::StoreOp;

use crate::{load_config, op_context, pattern, preview, Stack, DEFAULT_POLICY};

#[derive(Deserialize)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    /// Inline storage configuration; overrides `--config`.
    pub storage: Option<StorageConfig>,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: Option<String>,
    pub policy: Option<String>,
}

/// One scripted operation. Part ids may contain `{i}`, replaced by the
/// enclosing `repeat` iteration.
#[derive(Deserialize)]
#[serde(tag = "op")]
pub enum ScenarioStep {
    #[serde(rename = "insert")]
    Insert {
        part: String,
        size: Option<u64>,
        data: Option<String>,
    },
    #[serde(rename = "read")]
    Read {
        part: String,
        offset: Option<u64>,
        len: Option<u64>,
    },
    #[serde(rename = "drop")]
    Drop { part: String },
    #[serde(rename = "move")]
    Move { part: String, volume: String },
    #[serde(rename = "rebalance")]
    Rebalance,
    /// Make the next `times` calls of `call` on `endpoint` fail.
    #[serde(rename = "fail")]
    Fail {
        endpoint: String,
        call: String,
        times: u32,
        error: String,
    },
    #[serde(rename = "describe")]
    Describe,
    #[serde(rename = "sleep_ms")]
    SleepMs { value: u64 },
    #[serde(rename = "repeat")]
    Repeat {
        count: u64,
        steps: Vec<ScenarioStep>,
    },
}

/// Run a scenario from the CLI.
pub async fn run_scenario_cli(
    scenario_path: &str,
    config_path: Option<&str>,
    scratch: &Path,
    latency: Duration,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let toml_content = std::fs::read_to_string(scenario_path)?;
    let scenario: Scenario = toml::from_str(&toml_content)?;

    let policy = scenario.meta.policy.as_deref().unwrap_or(DEFAULT_POLICY);
    println!("=== Scenario: {} (policy: {policy}) ===", scenario.meta.name);
    if let Some(ref desc) = scenario.meta.description {
        println!("{desc}");
    }

    let config = match scenario.storage {
        Some(ref config) => config.clone(),
        None => load_config(config_path, scratch)?,
    };
    let stack = Stack::build(&config, latency, policy)?;

    let env = StepEnv {
        stack: &stack,
        timeout_ms,
    };
    execute_steps(&scenario.steps, &env, 0).await?;

    println!("\n=== Final state ===");
    println!("{}", serde_json::to_string_pretty(&stack.describe())?);
    println!("\nScenario complete.");
    Ok(())
}

struct StepEnv<'a> {
    stack: &'a Stack,
    timeout_ms: Option<u64>,
}

fn execute_steps<'a>(
    steps: &'a [ScenarioStep],
    env: &'a StepEnv<'a>,
    iteration: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + 'a>> {
    Box::pin(async move {
        for step in steps {
            execute_step(step, env, iteration).await?;
        }
        Ok(())
    })
}

async fn execute_step(step: &ScenarioStep, env: &StepEnv<'_>, iteration: u64) -> anyhow::Result<()> {
    let table = &env.stack.table;
    let ctx = op_context(env.timeout_ms);
    let id = |part: &str| part.replace("{i}", &iteration.to_string());

    match step {
        ScenarioStep::Insert { part, size, data } => {
            let part = id(part);
            let bytes = match (data, size) {
                (Some(text), _) => text.as_bytes().to_vec(),
                (None, Some(size)) => pattern(*size, iteration as u8),
                (None, None) => anyhow::bail!("insert {part}: needs `size` or `data`"),
            };
            match table.insert(&part, &bytes, &ctx).await {
                Ok(p) => println!("  INSERT {part} {}B -> {} ({})", p.size, p.disk, p.format),
                Err(e) => println!("  INSERT {part} -> Error: {e}"),
            }
        }
        ScenarioStep::Read { part, offset, len } => {
            let part = id(part);
            let offset = offset.unwrap_or(0);
            let range = match len {
                Some(len) => ByteRange::new(offset, *len),
                None => ByteRange::from_offset(offset),
            };
            match table.read(&part, range, &ctx).await {
                Ok(data) => println!("  READ {part} {range} -> {}", preview(&data)),
                Err(e) => println!("  READ {part} {range} -> Error: {e}"),
            }
        }
        ScenarioStep::Drop { part } => {
            let part = id(part);
            match table.drop_part(&part, &ctx).await {
                Ok(()) => println!("  DROP {part} -> OK"),
                Err(e) => println!("  DROP {part} -> Error: {e}"),
            }
        }
        ScenarioStep::Move { part, volume } => {
            let part = id(part);
            match table.move_part(&part, volume, &ctx).await {
                Ok(p) => println!("  MOVE {part} -> {volume} ({})", p.disk),
                Err(e) => println!("  MOVE {part} -> Error: {e}"),
            }
        }
        ScenarioStep::Rebalance => match table.rebalance(&ctx).await {
            Ok(moved) => {
                let ids: Vec<&str> = moved.iter().map(|p| p.id.as_str()).collect();
                println!("  REBALANCE -> moved {ids:?}");
            }
            Err(e) => println!("  REBALANCE -> Error: {e}"),
        },
        ScenarioStep::Fail {
            endpoint,
            call,
            times,
            error,
        } => {
            let op = parse_store_op(call)?;
            let err = parse_store_error(error)?;
            println!("  FAIL {endpoint} {call} x{times} ({err})");
            env.stack.transport.store(endpoint).fail_next(op, *times, err);
        }
        ScenarioStep::Describe => {
            println!("{}", serde_json::to_string_pretty(&env.stack.describe())?);
        }
        ScenarioStep::SleepMs { value } => {
            println!("  sleep {value}ms");
            tokio::time::sleep(Duration::from_millis(*value)).await;
        }
        ScenarioStep::Repeat { count, steps } => {
            println!("  repeat {count}x:");
            for i in 0..*count {
                if *count <= 10 || i % (*count / 5).max(1) == 0 {
                    println!("    iteration {}/{count}", i + 1);
                }
                execute_steps(steps, env, i).await?;
            }
        }
    }
    Ok(())
}

fn parse_store_op(call: &str) -> anyhow::Result<StoreOp> {
    Ok(match call {
        "get" => StoreOp::Get,
        "head" => StoreOp::Head,
        "put" => StoreOp::Put,
        "delete" => StoreOp::Delete,
        "list" => StoreOp::List,
        "create_multipart" => StoreOp::CreateMultipart,
        "upload_part" => StoreOp::UploadPart,
        "complete_multipart" => StoreOp::CompleteMultipart,
        "abort_multipart" => StoreOp::AbortMultipart,
        other => anyhow::bail!("unknown store call: {other}"),
    })
}

fn parse_store_error(error: &str) -> anyhow::Result<ObjectStoreError> {
    Ok(match error {
        "timeout" => ObjectStoreError::Timeout,
        "reset" => ObjectStoreError::ConnectionReset,
        "server" => ObjectStoreError::Server(503),
        "denied" => ObjectStoreError::AccessDenied,
        "quota" => ObjectStoreError::QuotaExceeded,
        other => anyhow::bail!("unknown store error: {other}"),
    })
}
