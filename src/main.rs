//! Hive - 单监督者任务编排器
//!
//! 入口：初始化日志、加载配置、打开共享存储，按子命令运行。
//!
//! ```text
//! hive run <goal...>            规划并运行一个新会话（Ctrl+C 暂停并写检查点）
//! hive resume <checkpoint_id>   从检查点恢复并继续运行
//! hive status <session_id>      打印会话状态
//! hive checkpoints [session_id] 列出检查点
//! hive watch <pattern> [secs]   打印匹配键的变更
//! hive schema                   打印 TaskBriefing 的 JSON Schema
//! ```
//!
//! 配置文件可用环境变量 `HIVE_CONFIG` 指定。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use hive::briefing::briefing_schema_json;
use hive::config::{load_config, reload_config, AppConfig};
use hive::continuation::ContinuationManager;
use hive::core::{new_session_id, open_store, Engine, EnginePhase, StatusReport};
use hive::store::{KeySpace, SharedStore};

const USAGE: &str = "usage: hive <run <goal...> | resume <checkpoint_id> | status <session_id> | checkpoints [session_id] | watch <pattern> [secs] | schema>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        bail!(USAGE);
    };

    if command == "schema" {
        println!("{}", briefing_schema_json());
        return Ok(());
    }

    let loaded = match std::env::var_os("HIVE_CONFIG") {
        Some(path) => load_config(Some(PathBuf::from(path))),
        None => reload_config(),
    };
    let cfg = loaded.unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let store = open_store(&cfg)?;
    let keys = KeySpace::new(cfg.app.project_id.clone()).context("Invalid project id")?;

    match command.as_str() {
        "run" => {
            let goal = rest.join(" ");
            if goal.trim().is_empty() {
                bail!("run needs a goal");
            }
            let mut engine = Engine::from_app_config(&cfg, store, new_session_id())
                .context("Failed to create engine")?;
            engine.start(&goal).context("Failed to plan goal")?;
            println!("session {}", engine.session_id());
            drive(engine).await?;
        }
        "resume" => {
            let Some(checkpoint_id) = rest.first() else {
                bail!("resume needs a checkpoint id");
            };
            let engine = Engine::resume(store, keys, cfg.engine_config(), cfg.worker_config(), checkpoint_id)
                .with_context(|| format!("Failed to resume from {}", checkpoint_id))?;
            println!("session {} resumed from {}", engine.session_id(), checkpoint_id);
            drive(engine).await?;
        }
        "status" => {
            let Some(session_id) = rest.first() else {
                bail!("status needs a session id");
            };
            let report = StatusReport::load(&store, &keys, session_id)
                .with_context(|| format!("Failed to load session {}", session_id))?;
            println!("{}", report);
        }
        "checkpoints" => {
            let manager = ContinuationManager::new(store, keys);
            let summaries = manager
                .list_checkpoints(rest.first().map(String::as_str))
                .context("Failed to list checkpoints")?;
            for s in summaries {
                println!(
                    "{}  session={}  created={}  completed={}/{}",
                    s.checkpoint_id,
                    s.session_id,
                    s.created_at.to_rfc3339(),
                    s.completed,
                    s.tasks
                );
            }
        }
        "watch" => {
            let Some(pattern) = rest.first() else {
                bail!("watch needs a key pattern");
            };
            let secs: u64 = match rest.get(1) {
                Some(raw) => raw.parse().context("watch timeout must be whole seconds")?,
                None => 30,
            };
            watch(&store, &cfg, pattern, Duration::from_secs(secs)).await?;
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
    Ok(())
}

/// 运行到结束或被信号暂停，然后打印状态
async fn drive(mut engine: Engine) -> anyhow::Result<()> {
    engine.supervisor().install_signal_handlers();
    let report = engine.run().await.context("Engine stopped")?;
    println!("{}", report);
    if report.phase == EnginePhase::Paused {
        if let Some(checkpoint_id) = ContinuationManager::new(engine.store().clone(), engine.keys().clone())
            .latest_checkpoint(engine.session_id())
            .context("Failed to look up checkpoint")?
        {
            println!("paused; resume with: hive resume {}", checkpoint_id);
        }
    }
    Ok(())
}

async fn watch(store: &SharedStore, cfg: &AppConfig, pattern: &str, timeout: Duration) -> anyhow::Result<()> {
    let watch_cfg = cfg.watch_config();
    let mut watch = store
        .watch(pattern, timeout, watch_cfg.poll_interval)
        .with_context(|| format!("Invalid watch pattern '{}'", pattern))?
        .with_max_backoff(watch_cfg.max_backoff);
    while let Some(change) = watch.next().await {
        println!("{:?} {} {:?}", change.kind, change.key, change.version);
    }
    Ok(())
}
