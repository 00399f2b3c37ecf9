//! TaskBriefing 协议：引擎写给 Worker 的工作单
//!
//! - 写入后不可变：完成情况记录在独立的 status 键，绝不回写 Briefing
//! - 上下文只传键（context pointer），大内容从不内联，Worker 自行按键读取
//! - 每个交付物声明类型与 output_key，引擎据此做形状校验（见 [`validate`]）

pub mod validate;

use std::collections::BTreeMap;
use std::fmt;

use schemars::{schema::RootSchema, schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

pub use validate::{check_shape, validate_briefing, validate_deliverable, DeliverableValidationError};

use crate::store::{KeySpace, SharedStore, StoreError, Version};
use crate::workflow::{Role, Task, TaskGraph, TaskId};

/// 交付物类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableType {
    Text,
    Markdown,
    Code,
    Json,
    List,
}

impl fmt::Display for DeliverableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliverableType::Text => "text",
            DeliverableType::Markdown => "markdown",
            DeliverableType::Code => "code",
            DeliverableType::Json => "json",
            DeliverableType::List => "list",
        };
        f.write_str(s)
    }
}

/// 单个交付物契约
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Deliverable {
    #[serde(rename = "type")]
    pub kind: DeliverableType,
    pub description: String,
    /// Worker 写入产出的位置（位于该任务的 outputs 空间）
    pub output_key: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Deliverable {
    pub fn new(kind: DeliverableType, description: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            output_key: output_key.into(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Briefing 自身的状态；只有 Issued 一种，完成与否看 status 记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BriefingStatus {
    Issued,
}

/// 工作单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskBriefing {
    pub task_id: TaskId,
    pub role_required: Role,
    pub objective: String,
    /// 名称 -> 存储键
    pub context_pointers: BTreeMap<String, String>,
    pub deliverables: Vec<Deliverable>,
    pub status: BriefingStatus,
}

impl TaskBriefing {
    pub fn required_deliverables(&self) -> impl Iterator<Item = &Deliverable> {
        self.deliverables.iter().filter(|d| d.required)
    }

    /// 所有被引用的键：context pointer 与交付物 output_key
    pub fn referenced_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.context_pointers.values().cloned().collect();
        keys.extend(self.deliverables.iter().map(|d| d.output_key.clone()));
        keys.sort();
        keys.dedup();
        keys
    }
}

/// 交付物模板：(类型, 名称, 说明, 是否必需)
pub type DeliverableTemplate = (DeliverableType, &'static str, &'static str, bool);

/// 各角色的标准交付物
pub fn role_deliverables(role: Role) -> &'static [DeliverableTemplate] {
    match role {
        Role::Coordinator => &[(DeliverableType::Json, "plan", "Coordination notes and sub-goals", true)],
        Role::Researcher => &[
            (DeliverableType::Markdown, "findings", "Relevant code locations, APIs and constraints", true),
            (DeliverableType::List, "references", "Keys or paths worth reading", false),
        ],
        Role::Analyst => &[(DeliverableType::Markdown, "analysis", "Problem analysis and proposed approach", true)],
        Role::Implementer => &[
            (DeliverableType::Code, "changes", "The change set implementing the objective", true),
            (DeliverableType::Markdown, "notes", "Implementation notes for reviewers", false),
        ],
        Role::Debugger => &[(DeliverableType::Markdown, "reproduction", "Minimal reproduction and root cause", true)],
        Role::Tester => &[(DeliverableType::Json, "test_report", "Executed checks and their outcomes", true)],
        Role::Reviewer => &[(DeliverableType::Markdown, "review", "Review verdict and requested changes", true)],
    }
}

/// 构建 Briefing 所需的上下文
pub struct BriefingContext<'a> {
    pub store: &'a SharedStore,
    pub keys: &'a KeySpace,
    pub session_id: &'a str,
    pub graph: &'a TaskGraph,
    pub max_pointers: usize,
}

/// 为任务构建 Briefing：按角色挑选有限数量的相关键，只放键不放内容
///
/// 指针顺序：项目配置、会话元信息、直接依赖的产出；测试/评审角色额外带上游全链路产出。
pub fn build_briefing(task: &Task, ctx: &BriefingContext<'_>) -> Result<TaskBriefing, StoreError> {
    let mut pointers = BTreeMap::new();
    let push = |name: String, key: String, pointers: &mut BTreeMap<String, String>| {
        if pointers.len() < ctx.max_pointers {
            pointers.insert(name, key);
        }
    };

    let config_key = ctx.keys.config();
    if ctx.store.exists(&config_key)? {
        push("project_config".to_string(), config_key, &mut pointers);
    }
    push(
        "session".to_string(),
        ctx.keys.session_meta(ctx.session_id),
        &mut pointers,
    );

    let mut upstream: Vec<TaskId> = task.depends_on.clone();
    if task.role.needs_transitive_context() {
        for ancestor in ctx.graph.ancestors(&task.id) {
            if !upstream.contains(&ancestor) {
                upstream.push(ancestor);
            }
        }
    }
    for dep_id in &upstream {
        let Some(dep) = ctx.graph.get(dep_id) else {
            continue;
        };
        for (_, name, _, _) in role_deliverables(dep.role) {
            let key = ctx.keys.output(dep_id, name);
            if ctx.store.exists(&key)? {
                push(format!("{}.{}", dep_id, name), key, &mut pointers);
            }
        }
    }

    let deliverables = role_deliverables(task.role)
        .iter()
        .map(|(kind, name, description, required)| Deliverable {
            kind: *kind,
            description: description.to_string(),
            output_key: ctx.keys.output(&task.id, name),
            required: *required,
        })
        .collect();

    Ok(TaskBriefing {
        task_id: task.id.clone(),
        role_required: task.role,
        objective: task.description.clone(),
        context_pointers: pointers,
        deliverables,
        status: BriefingStatus::Issued,
    })
}

/// 持久化 Briefing（仅创建；相同内容重复写入视为成功）
pub fn issue_briefing(store: &SharedStore, keys: &KeySpace, briefing: &TaskBriefing) -> Result<Version, StoreError> {
    let key = keys.briefing(&briefing.task_id);
    store.create(&key, &serde_json::to_value(briefing)?)
}

/// 读取已写入的 Briefing
pub fn load_briefing(store: &SharedStore, keys: &KeySpace, task_id: &str) -> Result<Option<TaskBriefing>, StoreError> {
    let key = keys.briefing(task_id);
    match store.get(&key)? {
        None => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::InvalidValue {
                key,
                reason: e.to_string(),
            }),
    }
}

/// TaskBriefing 的 JSON Schema，供外部 Worker 校验读到的工作单
pub fn briefing_schema() -> RootSchema {
    schema_for!(TaskBriefing)
}

pub fn briefing_schema_json() -> String {
    serde_json::to_string_pretty(&briefing_schema()).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TaskGraphBuilder;
    use serde_json::json;

    fn graph() -> TaskGraph {
        TaskGraphBuilder::new()
            .task("t1", Role::Researcher, "Research X")
            .task("t2", Role::Implementer, "Implement X")
            .task("t3", Role::Tester, "Test X")
            .chain()
            .build()
            .unwrap()
    }

    #[test]
    fn test_briefing_uses_pointers_only() {
        let store = SharedStore::open_in_memory().unwrap();
        let keys = KeySpace::new("p").unwrap();
        let g = graph();
        let big = "x".repeat(10_000);
        store.write(&keys.output("t1", "findings"), &json!(big)).unwrap();
        store.write(&keys.output("t2", "changes"), &json!("diff")).unwrap();
        store.write(&keys.config(), &json!({"lang": "rust"})).unwrap();

        let ctx = BriefingContext {
            store: &store,
            keys: &keys,
            session_id: "s1",
            graph: &g,
            max_pointers: 16,
        };
        let b = build_briefing(g.get("t3").unwrap(), &ctx).unwrap();
        assert_eq!(b.role_required, Role::Tester);
        assert_eq!(b.context_pointers.get("project_config"), Some(&keys.config()));
        // 测试角色能看到整条上游链路
        assert_eq!(b.context_pointers.get("t1.findings"), Some(&keys.output("t1", "findings")));
        assert_eq!(b.context_pointers.get("t2.changes"), Some(&keys.output("t2", "changes")));
        assert!(!b.context_pointers.contains_key("t2.notes"));
        assert_eq!(b.deliverables[0].output_key, keys.output("t3", "test_report"));

        let serialized = serde_json::to_string(&b).unwrap();
        assert!(serialized.len() < 2_000);
    }

    #[test]
    fn test_pointer_budget_is_respected() {
        let store = SharedStore::open_in_memory().unwrap();
        let keys = KeySpace::new("p").unwrap();
        let g = graph();
        store.write(&keys.output("t1", "findings"), &json!("f")).unwrap();
        let ctx = BriefingContext {
            store: &store,
            keys: &keys,
            session_id: "s1",
            graph: &g,
            max_pointers: 1,
        };
        let b = build_briefing(g.get("t2").unwrap(), &ctx).unwrap();
        assert_eq!(b.context_pointers.len(), 1);
    }

    #[test]
    fn test_briefing_is_immutable_once_issued() {
        let store = SharedStore::open_in_memory().unwrap();
        let keys = KeySpace::new("p").unwrap();
        let g = graph();
        let ctx = BriefingContext {
            store: &store,
            keys: &keys,
            session_id: "s1",
            graph: &g,
            max_pointers: 16,
        };
        let b = build_briefing(g.get("t1").unwrap(), &ctx).unwrap();
        issue_briefing(&store, &keys, &b).unwrap();
        issue_briefing(&store, &keys, &b).unwrap();

        let mut changed = b.clone();
        changed.objective = "something else".into();
        assert!(matches!(
            issue_briefing(&store, &keys, &changed),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(load_briefing(&store, &keys, "t1").unwrap(), Some(b));
    }

    #[test]
    fn test_schema_describes_deliverables() {
        let schema = briefing_schema_json();
        assert!(schema.contains("context_pointers"));
        assert!(schema.contains("output_key"));
    }
}
