//! 任务依赖图
//!
//! 使用邻接表和入度表校验 DAG（Kahn 拓扑排序），并维护每个任务的状态机

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::types::*;

/// 任务图：规划后结构固定，只有状态变化
#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraph {
    /// 规划顺序
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    /// 邻接表：任务 ID -> 依赖该任务的任务列表
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    /// 由任务列表建图；检查重复 id、悬空依赖与环
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut index = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let mut dependents: HashMap<TaskId, Vec<TaskId>> =
            tasks.iter().map(|t| (t.id.clone(), Vec::new())).collect();
        for task in &tasks {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                if dep == &task.id {
                    return Err(GraphError::CyclicDependency(task.id.clone()));
                }
                if seen.insert(dep) {
                    dependents.entry(dep.clone()).or_default().push(task.id.clone());
                }
            }
        }
        check_acyclic(&tasks, &dependents)?;

        Ok(Self {
            tasks,
            index,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 按规划顺序
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Task, GraphError> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.tasks[i]),
            None => Err(GraphError::TaskNotFound(id.to_string())),
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.get(id).map(|t| t.status)
    }

    /// 直接依赖该任务的下游
    pub fn dependents(&self, id: &str) -> &[TaskId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|d| self.status(d) == Some(TaskStatus::Completed))
    }

    fn by_priority(&self, mut ids: Vec<&Task>) -> Vec<TaskId> {
        // 稳定排序：同优先级保持规划顺序
        ids.sort_by_key(|t| t.priority);
        ids.into_iter().map(|t| t.id.clone()).collect()
    }

    /// 所有依赖都已完成的 pending 任务
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let ready = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && self.deps_completed(t))
            .collect();
        self.by_priority(ready)
    }

    /// 等待并发槽位的 briefed 任务
    pub fn briefed_tasks(&self) -> Vec<TaskId> {
        let briefed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Briefed)
            .collect();
        self.by_priority(briefed)
    }

    /// 阻塞某个 pending 任务的失败上游（直接失败的依赖，或本身被阻塞的依赖所追溯到的失败任务）
    pub fn blocked_by(&self, id: &str) -> Vec<TaskId> {
        let Some(task) = self.get(id) else {
            return Vec::new();
        };
        if task.status != TaskStatus::Pending {
            return Vec::new();
        }
        let mut out = Vec::new();
        for dep in &task.depends_on {
            match self.status(dep) {
                Some(TaskStatus::Failed) => out.push(dep.clone()),
                Some(TaskStatus::Pending) => out.extend(self.blocked_by(dep)),
                _ => {}
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// 传递上游（不含自身），按规划顺序
    pub fn ancestors(&self, id: &str) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self
            .get(id)
            .map(|t| t.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if seen.insert(dep.to_string()) {
                if let Some(t) = self.get(dep) {
                    stack.extend(t.depends_on.iter().map(String::as_str));
                }
            }
        }
        self.tasks
            .iter()
            .filter(|t| seen.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// 是否还有可推进的工作
    pub fn has_runnable_work(&self) -> bool {
        self.tasks.iter().any(|t| match t.status {
            TaskStatus::Briefed | TaskStatus::Dispatched => true,
            TaskStatus::Pending => self.blocked_by(&t.id).is_empty(),
            _ => false,
        })
    }

    /// 状态前进；进入 dispatched 前要求依赖全部完成
    pub fn advance(&mut self, id: &str, next: TaskStatus) -> Result<(), GraphError> {
        let task = self
            .get(id)
            .ok_or_else(|| GraphError::TaskNotFound(id.to_string()))?;
        if !task.status.can_advance_to(next) {
            return Err(GraphError::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to: next,
            });
        }
        if matches!(next, TaskStatus::Briefed | TaskStatus::Dispatched) {
            if let Some(dep) = task
                .depends_on
                .iter()
                .find(|d| self.status(d) != Some(TaskStatus::Completed))
            {
                return Err(GraphError::DependencyNotCompleted {
                    task: id.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
        let task = self.get_mut(id)?;
        task.status = next;
        if next != TaskStatus::Failed {
            task.failure = None;
        }
        Ok(())
    }

    pub fn fail(&mut self, id: &str, reason: FailureReason) -> Result<(), GraphError> {
        self.advance(id, TaskStatus::Failed)?;
        self.get_mut(id)?.failure = Some(reason);
        Ok(())
    }

    /// 显式重试：failed → pending
    pub fn retry(&mut self, id: &str) -> Result<(), GraphError> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Failed {
            return Err(GraphError::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        task.status = TaskStatus::Pending;
        task.failure = None;
        task.attempt += 1;
        Ok(())
    }

    /// 快照（规划顺序）
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.clone()
    }
}

/// Kahn 拓扑排序：有节点始终无法入队即存在环
fn check_acyclic(tasks: &[Task], dependents: &HashMap<TaskId, Vec<TaskId>>) -> Result<(), GraphError> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| {
            let unique: HashSet<&String> = t.depends_on.iter().collect();
            (t.id.as_str(), unique.len())
        })
        .collect();
    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| in_degree.get(t.id.as_str()).copied().unwrap_or(0) == 0)
        .map(|t| t.id.as_str())
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next.as_str());
                }
            }
        }
    }
    if visited == tasks.len() {
        return Ok(());
    }
    let stuck = tasks
        .iter()
        .find(|t| in_degree.get(t.id.as_str()).copied().unwrap_or(0) > 0)
        .map(|t| t.id.clone())
        .unwrap_or_default();
    Err(GraphError::CyclicDependency(stuck))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> TaskGraph {
        TaskGraph::from_tasks(vec![
            Task::new("a", Role::Analyst, "analyze"),
            Task::new("b", Role::Implementer, "implement").depends_on("a"),
            Task::new("c", Role::Reviewer, "review").depends_on("b"),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_cycles_and_dangling_deps() {
        let cyclic = TaskGraph::from_tasks(vec![
            Task::new("a", Role::Analyst, "").depends_on("b"),
            Task::new("b", Role::Analyst, "").depends_on("a"),
        ]);
        assert!(matches!(cyclic, Err(GraphError::CyclicDependency(_))));

        let dangling = TaskGraph::from_tasks(vec![Task::new("a", Role::Analyst, "").depends_on("zz")]);
        assert!(matches!(dangling, Err(GraphError::UnknownDependency { .. })));

        let dup = TaskGraph::from_tasks(vec![
            Task::new("a", Role::Analyst, ""),
            Task::new("a", Role::Tester, ""),
        ]);
        assert!(matches!(dup, Err(GraphError::DuplicateTask(_))));
    }

    #[test]
    fn test_ready_follows_dependencies() {
        let mut g = chain();
        assert_eq!(g.ready_tasks(), vec!["a"]);
        g.advance("a", TaskStatus::Briefed).unwrap();
        g.advance("a", TaskStatus::Dispatched).unwrap();
        assert!(g.ready_tasks().is_empty());
        g.advance("a", TaskStatus::Completed).unwrap();
        assert_eq!(g.ready_tasks(), vec!["b"]);
        assert_eq!(g.ancestors("c"), vec!["a", "b"]);
    }

    #[test]
    fn test_dispatch_requires_completed_dependencies() {
        let mut g = chain();
        let err = g.advance("b", TaskStatus::Briefed).unwrap_err();
        assert!(matches!(err, GraphError::DependencyNotCompleted { .. }));
        let err = g.advance("a", TaskStatus::Dispatched).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failure_blocks_downstream_and_retry_is_explicit() {
        let mut g = chain();
        g.advance("a", TaskStatus::Briefed).unwrap();
        g.advance("a", TaskStatus::Dispatched).unwrap();
        g.fail("a", FailureReason::cancelled()).unwrap();
        assert_eq!(g.blocked_by("b"), vec!["a"]);
        assert_eq!(g.blocked_by("c"), vec!["a"]);
        assert_eq!(g.dependents("a"), ["b".to_string()]);
        assert!(g.dependents("c").is_empty());
        assert!(!g.has_runnable_work());

        assert!(g.advance("a", TaskStatus::Pending).is_err());
        g.retry("a").unwrap();
        let a = g.get("a").unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.attempt, 1);
        assert!(a.failure.is_none());
        assert!(g.has_runnable_work());
        assert!(g.retry("a").is_err());
    }

    #[test]
    fn test_priority_orders_ready_tasks() {
        let g = TaskGraph::from_tasks(vec![
            Task::new("low", Role::Analyst, "").with_priority(5),
            Task::new("high", Role::Analyst, "").with_priority(1),
            Task::new("also-low", Role::Analyst, "").with_priority(5),
        ])
        .unwrap();
        assert_eq!(g.ready_tasks(), vec!["high", "low", "also-low"]);
    }
}
