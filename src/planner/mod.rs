//! Planner：按目标的词法形状查表生成固定的三段任务链
//!
//! 同一目标总是得到同一张任务图。
//! - 缺陷修复形：Reproduce (debugger) → Fix (implementer) → Verify (tester)
//! - 实现形：Research (researcher) → Implement (implementer) → Test (tester)
//! - 其它：Analyze (analyst) → Implement (implementer) → Review (reviewer)

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::workflow::{GraphError, Role, TaskGraph, TaskGraphBuilder};

static DEFECT_RE: OnceLock<Regex> = OnceLock::new();
static IMPLEMENTATION_RE: OnceLock<Regex> = OnceLock::new();

fn defect_re() -> &'static Regex {
    DEFECT_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(fix(es|ed|ing)?|bug(s|gy)?|defect|crash(es|ing)?|broken|regression|panic(s|king)?|fail(s|ing|ure)?|error(s)?|hotfix|patch)\b",
        )
        .unwrap()
    })
}

fn implementation_re() -> &'static Regex {
    IMPLEMENTATION_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(implement|add|build|create|write|introduce|develop|support|port|extend)\b|\b(implement(ation)?|new feature|add support)\b",
        )
        .unwrap()
    })
}

/// 目标形状
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalShape {
    Implementation,
    DefectFix,
    Generic,
}

impl GoalShape {
    /// 分类目标；缺陷修复优先于实现（"implement a fix for ..." 视为修复）
    pub fn classify(goal: &str) -> Self {
        if defect_re().is_match(goal) {
            GoalShape::DefectFix
        } else if implementation_re().is_match(goal) {
            GoalShape::Implementation
        } else {
            GoalShape::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GoalShape::Implementation => "implementation",
            GoalShape::DefectFix => "defect_fix",
            GoalShape::Generic => "generic",
        }
    }

    /// 该形状对应的三个步骤：(短名, 角色, 描述模板, 预估耗时)
    fn steps(&self) -> [(&'static str, Role, &'static str, Duration); 3] {
        const MIN: u64 = 60;
        match self {
            GoalShape::Implementation => [
                ("research", Role::Researcher, "Research the codebase and gather the context needed to", Duration::from_secs(10 * MIN)),
                ("implement", Role::Implementer, "Implement the change to", Duration::from_secs(30 * MIN)),
                ("test", Role::Tester, "Test and verify the implementation of the change to", Duration::from_secs(15 * MIN)),
            ],
            GoalShape::DefectFix => [
                ("reproduce", Role::Debugger, "Reproduce the defect and locate the root cause for", Duration::from_secs(15 * MIN)),
                ("fix", Role::Implementer, "Fix the root cause for", Duration::from_secs(20 * MIN)),
                ("verify", Role::Tester, "Verify the fix and guard against regression for", Duration::from_secs(10 * MIN)),
            ],
            GoalShape::Generic => [
                ("analyze", Role::Analyst, "Analyze the problem and propose an approach to", Duration::from_secs(10 * MIN)),
                ("implement", Role::Implementer, "Carry out the proposed approach to", Duration::from_secs(30 * MIN)),
                ("review", Role::Reviewer, "Review the result of the work to", Duration::from_secs(10 * MIN)),
            ],
        }
    }
}

/// 目标拆解器
#[derive(Debug, Clone, Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// 把目标拆成带依赖链的任务图
    ///
    /// 任务 id 形如 `{session 前 8 位}-{序号}-{步骤}`，同一项目下的多个会话不会撞键。
    pub fn plan(&self, session_id: &str, goal: &str) -> Result<TaskGraph, GraphError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(GraphError::InvalidConfiguration("goal is empty".to_string()));
        }
        let shape = GoalShape::classify(goal);
        let prefix: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();

        let mut builder = TaskGraphBuilder::new();
        for (i, (step, role, template, estimate)) in shape.steps().into_iter().enumerate() {
            let id = format!("{}-{}-{}", prefix, i + 1, step);
            builder = builder
                .task(id, role, format!("{} {}", template, lowercase_first(goal)))
                .estimate(estimate);
        }
        let graph = builder.chain().build()?;
        tracing::info!(
            session_id = %session_id,
            shape = shape.as_str(),
            tasks = graph.len(),
            "goal planned"
        );
        Ok(graph)
    }
}

fn lowercase_first(goal: &str) -> String {
    let mut chars = goal.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() && !chars.clone().next().is_some_and(|c| c.is_uppercase()) => {
            first.to_lowercase().chain(chars).collect()
        }
        _ => goal.to_string(),
    }
}
