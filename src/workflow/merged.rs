//! 会话级合并计划视图（仅供展示）
//!
//! 每个 Agent 发出的子计划挂在委派它的那个 Agent 任务之下；某个 Agent 重新规划时，
//! 用 replace_subtree 把旧子计划整体换掉，并丢弃从根计划不再可达的任务。

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::workflow::graph::PlanGraph;
use crate::workflow::types::{Task, TaskId};

/// 合并视图中的任务（带所属 Agent）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedTask {
    pub agent: String,
    #[serde(flatten)]
    pub task: Task,
}

#[derive(Debug, Clone)]
struct SubPlan {
    terminal: TaskId,
}

/// 合并计划视图
#[derive(Debug, Default, Clone)]
pub struct MergedPlanView {
    tasks: Vec<MergedTask>,
    sub_plans: HashMap<String, SubPlan>,
    root_agent: Option<String>,
}

impl MergedPlanView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[MergedTask] {
        &self.tasks
    }

    pub fn terminal(&self, agent: &str) -> Option<&str> {
        self.sub_plans.get(agent).map(|s| s.terminal.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&MergedTask> {
        self.tasks.iter().find(|t| t.task.id == id)
    }

    /// 用 agent 的新子计划替换其旧子计划
    ///
    /// - 旧子计划的任务全部移除；引用旧终结任务的边改指向新终结任务，引用其他旧任务的边删除
    /// - parent_task 为委派该 Agent 的任务 id，新终结任务挂到它的依赖上
    /// - 最后丢弃从根 Agent 子计划出发不可达的任务
    pub fn replace_subtree(
        &mut self,
        agent: &str,
        new_plan: &[Task],
        parent_task: Option<&str>,
    ) {
        let Some(new_terminal) = PlanGraph::new(new_plan).terminal().map(|t| t.id.clone()) else {
            return;
        };

        match self.sub_plans.remove(agent) {
            Some(old) => {
                let removed: HashSet<TaskId> = self
                    .tasks
                    .iter()
                    .filter(|t| t.agent == agent)
                    .map(|t| t.task.id.clone())
                    .collect();
                self.tasks.retain(|t| t.agent != agent);
                for t in self.tasks.iter_mut() {
                    let mut deps: Vec<TaskId> = Vec::with_capacity(t.task.dependencies.len());
                    for dep in t.task.dependencies.drain(..) {
                        let dep = if dep == old.terminal {
                            new_terminal.clone()
                        } else if removed.contains(&dep) {
                            continue;
                        } else {
                            dep
                        };
                        if !deps.contains(&dep) {
                            deps.push(dep);
                        }
                    }
                    t.task.dependencies = deps;
                }
            }
            None if parent_task.is_none() && self.root_agent.is_none() => {
                self.root_agent = Some(agent.to_string());
            }
            None => {}
        }

        self.tasks.extend(new_plan.iter().map(|t| MergedTask {
            agent: agent.to_string(),
            task: t.clone(),
        }));

        if let Some(parent) = parent_task {
            if let Some(p) = self.tasks.iter_mut().find(|t| t.task.id == parent) {
                if !p.task.dependencies.contains(&new_terminal) {
                    p.task.dependencies.push(new_terminal.clone());
                }
            }
        }

        self.sub_plans.insert(
            agent.to_string(),
            SubPlan { terminal: new_terminal },
        );
        self.prune_unreachable();
    }

    /// 只保留根 Agent 的任务及其传递依赖
    fn prune_unreachable(&mut self) {
        let Some(root) = self.root_agent.as_deref() else {
            return;
        };
        let by_id: HashMap<&str, &MergedTask> =
            self.tasks.iter().map(|t| (t.task.id.as_str(), t)).collect();

        let mut reachable: HashSet<TaskId> = HashSet::new();
        let mut stack: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| t.agent == root)
            .map(|t| t.task.id.as_str())
            .collect();
        while let Some(id) = stack.pop() {
            if let Some(t) = by_id.get(id) {
                if reachable.insert(t.task.id.clone()) {
                    stack.extend(t.task.dependencies.iter().map(String::as_str));
                }
            }
        }

        let before = self.tasks.len();
        self.tasks.retain(|t| reachable.contains(&t.task.id));
        self.sub_plans
            .retain(|_, sp| reachable.contains(&sp.terminal));
        if self.tasks.len() < before {
            tracing::debug!(dropped = before - self.tasks.len(), "Pruned unreachable plan tasks");
        }
    }
}
