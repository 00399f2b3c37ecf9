//! 任务图构建器
//!
//! 提供流畅的API来构建任务图

use std::time::Duration;

use crate::workflow::graph::TaskGraph;
use crate::workflow::types::*;

/// 任务图构建器
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<Task>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加任务（优先级默认为加入顺序）
    pub fn task(mut self, id: impl Into<TaskId>, role: Role, description: impl Into<String>) -> Self {
        let priority = self.tasks.len() as u32;
        self.tasks
            .push(Task::new(id, role, description).with_priority(priority));
        self
    }

    /// 为最近添加的任务设置预估耗时
    pub fn estimate(mut self, estimate: Duration) -> Self {
        if let Some(task) = self.tasks.last_mut() {
            task.estimated_duration = estimate;
        }
        self
    }

    /// 设置顺序依赖：`to` 依赖 `from`
    pub fn sequential(mut self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        let to_id = to.into();
        let from_id = from.into();
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == to_id) {
            if !task.depends_on.contains(&from_id) {
                task.depends_on.push(from_id);
            }
        }
        self
    }

    /// 设置AND依赖（所有前置任务）
    pub fn depends_on_all(mut self, task_id: impl Into<TaskId>, deps: Vec<TaskId>) -> Self {
        let id = task_id.into();
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            for dep in deps {
                if !task.depends_on.contains(&dep) {
                    task.depends_on.push(dep);
                }
            }
        }
        self
    }

    /// 把已添加的任务串成一条链（每个依赖前一个）
    pub fn chain(mut self) -> Self {
        let ids: Vec<TaskId> = self.tasks.iter().map(|t| t.id.clone()).collect();
        for pair in ids.windows(2) {
            self = self.sequential(pair[0].clone(), pair[1].clone());
        }
        self
    }

    /// 构建任务图
    pub fn build(self) -> Result<TaskGraph, GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::InvalidConfiguration("task graph has no tasks".to_string()));
        }
        TaskGraph::from_tasks(self.tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_chain() {
        let graph = TaskGraphBuilder::new()
            .task("t1", Role::Researcher, "research")
            .task("t2", Role::Implementer, "implement")
            .estimate(Duration::from_secs(600))
            .task("t3", Role::Tester, "test")
            .chain()
            .build()
            .expect("Failed to build graph");

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.get("t2").unwrap().depends_on, vec!["t1"]);
        assert_eq!(graph.get("t3").unwrap().depends_on, vec!["t2"]);
        assert_eq!(graph.get("t2").unwrap().estimated_duration, Duration::from_secs(600));
        assert_eq!(graph.get("t3").unwrap().priority, 2);
    }

    #[test]
    fn test_build_empty_fails() {
        assert!(TaskGraphBuilder::new().build().is_err());
    }

    #[test]
    fn test_fan_in_dependencies() {
        let graph = TaskGraphBuilder::new()
            .task("a", Role::Analyst, "")
            .task("b", Role::Analyst, "")
            .task("c", Role::Reviewer, "")
            .depends_on_all("c", vec!["a".into(), "b".into()])
            .build()
            .unwrap();
        assert_eq!(graph.ready_tasks(), vec!["a", "b"]);
    }
}
