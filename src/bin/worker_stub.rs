//! Hive 参考 Worker
//!
//! 按 Worker 调用约定工作：命令行只有 `--role <role> --briefing <key>`，存储位置来自
//! `HIVE_STORE_PATH`。读取 Briefing，输出 lifecycle / tool_call / tool_result 行，写出每个
//! 交付物，最后打印完成标记并以 0 退出。
//!
//! 集成测试用 `HIVE_STUB_MODE`（或按角色的 `HIVE_STUB_MODE_<ROLE>`）制造各种异常：
//! `complete`（默认）、`no-marker`、`skip-deliverables`、`empty-deliverables`、`crash`、
//! `garbage`、`slow`（休眠 `HIVE_STUB_DELAY_MS` 毫秒，默认 1500）。
//!
//! 日志写到 stderr，stdout 只留给事件行。

use std::time::Duration;

use anyhow::{bail, Context};
use hive::briefing::{Deliverable, DeliverableType, TaskBriefing};
use hive::store::SharedStore;
use hive::stream::TERMINAL_MARKER;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Complete,
    NoMarker,
    SkipDeliverables,
    EmptyDeliverables,
    Crash,
    Garbage,
    Slow,
}

impl Mode {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(match raw.trim() {
            "" | "complete" => Mode::Complete,
            "no-marker" => Mode::NoMarker,
            "skip-deliverables" => Mode::SkipDeliverables,
            "empty-deliverables" => Mode::EmptyDeliverables,
            "crash" => Mode::Crash,
            "garbage" => Mode::Garbage,
            "slow" => Mode::Slow,
            other => bail!("unknown HIVE_STUB_MODE '{}'", other),
        })
    }

    /// 按角色的覆盖优先于全局模式
    fn from_env(role: &str) -> anyhow::Result<Self> {
        let per_role = format!("HIVE_STUB_MODE_{}", role.to_ascii_uppercase());
        match std::env::var(per_role).or_else(|_| std::env::var("HIVE_STUB_MODE")) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Ok(Mode::Complete),
        }
    }
}

struct Args {
    role: String,
    briefing_key: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut role = None;
    let mut briefing_key = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--role" => role = args.next(),
            "--briefing" => briefing_key = args.next(),
            _ => {}
        }
    }
    Ok(Args {
        role: role.context("missing --role")?,
        briefing_key: briefing_key.context("missing --briefing")?,
    })
}

fn emit(line: Value) {
    println!("{}", line);
}

/// 每种交付物类型的一个合法样例
fn sample_output(deliverable: &Deliverable, briefing: &TaskBriefing) -> Value {
    match deliverable.kind {
        DeliverableType::Text | DeliverableType::Markdown => Value::String(format!(
            "# {}\n\n{} for task {}.\n",
            deliverable.description, briefing.objective, briefing.task_id
        )),
        DeliverableType::Code => Value::String(format!("// {}\nfn main() {{}}\n", briefing.task_id)),
        DeliverableType::Json => json!({
            "task_id": briefing.task_id,
            "summary": deliverable.description,
            "passed": true,
        }),
        DeliverableType::List => json!([briefing.task_id, deliverable.output_key]),
    }
}

fn empty_output(kind: DeliverableType) -> Value {
    match kind {
        DeliverableType::Text | DeliverableType::Markdown | DeliverableType::Code => Value::String(String::new()),
        DeliverableType::Json => json!({}),
        DeliverableType::List => json!([]),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();

    let args = parse_args()?;
    let mode = Mode::from_env(&args.role)?;
    let store = SharedStore::open_from_env().context("Failed to open store")?;
    let briefing: TaskBriefing = store
        .read_as(&args.briefing_key)
        .with_context(|| format!("Failed to read briefing {}", args.briefing_key))?;
    let task_id = briefing.task_id.clone();
    tracing::info!(task_id = %task_id, role = %args.role, ?mode, "worker stub started");

    emit(json!({"type": "lifecycle", "phase": "started", "task_id": task_id, "role": args.role}));
    emit(json!({
        "type": "tool_call",
        "call_id": "read-briefing",
        "task_id": task_id,
        "name": "store.read",
        "input": {"key": args.briefing_key},
    }));
    emit(json!({
        "type": "tool_result",
        "call_id": "read-briefing",
        "task_id": task_id,
        "output": {"deliverables": briefing.deliverables.len(), "context": briefing.context_pointers.len()},
    }));

    for (i, (name, key)) in briefing.context_pointers.iter().enumerate() {
        let call_id = format!("ctx-{}", i);
        emit(json!({"type": "tool_call", "call_id": call_id, "task_id": task_id, "name": "store.read", "input": {"key": key}}));
        let found = store.exists(key).unwrap_or(false);
        emit(json!({"type": "tool_result", "call_id": call_id, "task_id": task_id, "output": {"name": name, "found": found}}));
        if mode == Mode::Garbage {
            println!("reading {} ... {{not json", name);
        }
    }

    match mode {
        Mode::Crash => {
            tokio::time::sleep(Duration::from_millis(300)).await;
            eprintln!("worker stub: simulated crash");
            std::process::exit(3);
        }
        Mode::Slow => {
            let delay = std::env::var("HIVE_STUB_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1500);
            emit(json!({"type": "lifecycle", "phase": "working", "task_id": task_id}));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Mode::Garbage => {
            println!("free-form progress text for {}", task_id);
            println!("{{\"type\":\"mystery\"}}");
        }
        _ => {}
    }

    if mode != Mode::SkipDeliverables {
        for deliverable in &briefing.deliverables {
            let value = if mode == Mode::EmptyDeliverables {
                empty_output(deliverable.kind)
            } else {
                sample_output(deliverable, &briefing)
            };
            store
                .write(&deliverable.output_key, &value)
                .with_context(|| format!("Failed to write {}", deliverable.output_key))?;
        }
    }

    emit(json!({"type": "lifecycle", "phase": "finishing", "task_id": task_id}));
    if mode != Mode::NoMarker {
        println!("{}", TERMINAL_MARKER);
    }
    Ok(())
}
