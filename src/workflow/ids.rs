//! 任务 id 分配与重规划 id 契约
//!
//! 补全服务生成的 id 不可信：本地分配器保证会话内唯一（8 位数字），
//! 重规划时在本地校验“未改动的任务保留 id、改动及其下游换新 id”。

use std::collections::{HashMap, HashSet};

use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 会话级 id 分配器：reserved 为会话内所有 Agent 已占用的 id
#[derive(Debug, Default, Clone)]
pub struct TaskIdAllocator {
    reserved: HashSet<TaskId>,
}

impl TaskIdAllocator {
    pub fn new<I: IntoIterator<Item = TaskId>>(reserved: I) -> Self {
        Self {
            reserved: reserved.into_iter().collect(),
        }
    }

    pub fn is_reserved(&self, id: &str) -> bool {
        self.reserved.contains(id)
    }

    /// 占用 id；已被占用时返回 false
    pub fn reserve(&mut self, id: impl Into<TaskId>) -> bool {
        self.reserved.insert(id.into())
    }

    /// 分配新的 8 位数字 id
    pub fn allocate(&mut self) -> TaskId {
        loop {
            let n = uuid::Uuid::new_v4().as_u128() % 90_000_000 + 10_000_000;
            let id = n.to_string();
            if self.reserved.insert(id.clone()) {
                return id;
            }
        }
    }
}

/// 重规划后的 id 变化报告
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IdReport {
    /// 未改动、保留原 id（缓存结果继续有效）
    pub kept: Vec<TaskId>,
    /// 新任务，使用了未占用的 id
    pub added: Vec<TaskId>,
    /// (旧 id, 新 id)
    pub reassigned: Vec<(TaskId, TaskId)>,
}

/// 按 renamed 改写依赖与 `$<id>` 参数引用
fn rewrite_references(task: &mut Task, renamed: &HashMap<TaskId, TaskId>) {
    if renamed.is_empty() {
        return;
    }
    for dep in task.dependencies.iter_mut() {
        if let Some(new) = renamed.get(dep.as_str()) {
            *dep = new.clone();
        }
    }
    for arg in task.arguments.iter_mut() {
        let target = arg.reference().and_then(|id| renamed.get(id)).cloned();
        if let Some(new) = target {
            arg.value = serde_json::Value::String(format!("${new}"));
        }
    }
}

/// 计划内重复 id：第二次及之后出现的任务换新 id（对它的引用仍指向首次出现者）
fn dedup_ids(tasks: &mut [Task], alloc: &mut TaskIdAllocator) -> Vec<(TaskId, TaskId)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for task in tasks.iter_mut() {
        if task.id.is_empty() || !seen.insert(task.id.clone()) {
            let new = alloc.allocate();
            out.push((std::mem::replace(&mut task.id, new.clone()), new));
        }
    }
    out
}

/// 新计划 / 执行前重规划：与会话已占用 id 冲突或计划内重复的任务全部换新 id
pub fn assign_fresh_ids(tasks: &mut [Task], alloc: &mut TaskIdAllocator) -> IdReport {
    let mut report = IdReport {
        reassigned: dedup_ids(tasks, alloc),
        ..IdReport::default()
    };
    let mut renamed = HashMap::new();
    for task in tasks.iter_mut() {
        if report.reassigned.iter().any(|(_, new)| new == &task.id) {
            continue;
        }
        if alloc.reserve(task.id.clone()) {
            report.added.push(task.id.clone());
        } else {
            let new = alloc.allocate();
            let old = std::mem::replace(&mut task.id, new.clone());
            renamed.insert(old.clone(), new.clone());
            report.reassigned.push((old, new));
        }
    }
    for task in tasks.iter_mut() {
        rewrite_references(task, &renamed);
    }
    report
}

/// 执行后重规划：以上一代计划为基准强制 id 契约
///
/// 按拓扑序处理：先改写对已换 id 任务的引用，再判断本任务是否与上一代同 id 任务内容一致；
/// 一致、上一代结果不是失败、且不依赖任何改动任务则保留，否则换新 id。
/// 上一代失败的任务即使内容不变也换新 id，重试时才会重新执行。
pub fn enforce_replan_contract(
    tasks: &mut [Task],
    previous: &[TaskWithResult],
    alloc: &mut TaskIdAllocator,
) -> Result<IdReport, PlanError> {
    let mut report = IdReport {
        reassigned: dedup_ids(tasks, alloc),
        ..IdReport::default()
    };
    let order = PlanGraph::new(tasks).topological_positions()?;
    let prev: HashMap<&str, &TaskWithResult> = previous.iter().map(|t| (t.task.id.as_str(), t)).collect();

    let mut renamed: HashMap<TaskId, TaskId> = HashMap::new();
    let mut changed: HashSet<TaskId> = report.reassigned.iter().map(|(_, n)| n.clone()).collect();

    for i in order {
        let task = &mut tasks[i];
        rewrite_references(task, &renamed);
        if changed.contains(&task.id) {
            continue;
        }
        let upstream_changed = task.dependencies.iter().any(|d| changed.contains(d));
        let reusable = prev.get(task.id.as_str()).is_some_and(|p| {
            p.task.same_work(task) && !p.result.as_ref().is_some_and(Observation::is_failed)
        });
        if reusable && !upstream_changed {
            report.kept.push(task.id.clone());
        } else if !alloc.is_reserved(&task.id) {
            alloc.reserve(task.id.clone());
            changed.insert(task.id.clone());
            report.added.push(task.id.clone());
        } else {
            let new = alloc.allocate();
            let old = std::mem::replace(&mut task.id, new.clone());
            tracing::debug!(old = %old, new = %new, "Reassigned task id after replan");
            renamed.insert(old.clone(), new.clone());
            changed.insert(new.clone());
            report.reassigned.push((old, new));
        }
    }
    Ok(report)
}
