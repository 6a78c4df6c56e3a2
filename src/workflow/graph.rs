//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 校验与拓扑排序

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::types::*;

/// 一代计划的依赖图（借用任务列表，不复制任务）
pub struct PlanGraph<'a> {
    tasks: &'a [Task],
    index: HashMap<&'a str, usize>,
    /// 邻接表：任务下标 -> 依赖它的任务下标
    adjacency: Vec<Vec<usize>>,
    /// 入度表：计划内依赖数（外部注入的依赖不计入）
    in_degree: Vec<usize>,
}

impl<'a> PlanGraph<'a> {
    /// 建图；重复 id 时保留首次出现的任务
    pub fn new(tasks: &'a [Task]) -> Self {
        let mut index = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            index.entry(task.id.as_str()).or_insert(i);
        }

        let mut adjacency = vec![Vec::new(); tasks.len()];
        let mut in_degree = vec![0; tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                if let Some(&d) = index.get(dep.as_str()) {
                    adjacency[d].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        Self {
            tasks,
            index,
            adjacency,
            in_degree,
        }
    }

    pub fn get(&self, id: &str) -> Option<&'a Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// 校验：id 唯一、依赖可解析（计划内或 `external(id)` 为 true）、无环
    pub fn validate(&self, external: impl Fn(&str) -> bool) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for task in self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateId(task.id.clone()));
            }
        }
        for task in self.tasks {
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(PlanError::Cycle(task.id.clone()));
                }
                if !self.contains(dep) && !external(dep) {
                    return Err(PlanError::DanglingDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.topological_positions().map(|_| ())
    }

    /// Kahn 算法，返回任务下标；同层按计划中的原始顺序输出
    pub fn topological_positions(&self) -> Result<Vec<usize>, PlanError> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            let mut next: Vec<usize> = Vec::new();
            for &dependent in &self.adjacency[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
            next.sort_unstable();
            queue.extend(next);
        }

        if order.len() != self.tasks.len() {
            let stuck = (0..self.tasks.len())
                .find(|&i| in_degree[i] > 0)
                .map(|i| self.tasks[i].id.clone())
                .unwrap_or_default();
            return Err(PlanError::Cycle(stuck));
        }
        Ok(order)
    }

    /// 拓扑序（依赖在前）
    pub fn topological_order(&self) -> Result<Vec<&'a Task>, PlanError> {
        Ok(self
            .topological_positions()?
            .into_iter()
            .map(|i| &self.tasks[i])
            .collect())
    }

    /// 直接依赖 id 的任务
    pub fn dependents_of(&self, id: &str) -> Vec<&'a Task> {
        self.index
            .get(id)
            .map(|&i| self.adjacency[i].iter().map(|&d| &self.tasks[d]).collect())
            .unwrap_or_default()
    }

    /// id 的全部传递依赖（不含自身，仅限计划内）
    pub fn transitive_dependencies(&self, id: &str) -> HashSet<TaskId> {
        let mut out = HashSet::new();
        let mut stack: Vec<&str> = self
            .get(id)
            .map(|t| t.dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if let Some(task) = self.get(dep) {
                if out.insert(task.id.clone()) {
                    stack.extend(task.dependencies.iter().map(String::as_str));
                }
            }
        }
        out
    }

    /// 计划的终结任务：join，否则为计划中最后一个没有下游的任务
    pub fn terminal(&self) -> Option<&'a Task> {
        self.tasks.iter().find(|t| t.is_join()).or_else(|| {
            self.tasks
                .iter()
                .enumerate()
                .rev()
                .find(|(i, _)| self.adjacency[*i].is_empty())
                .map(|(_, t)| t)
        })
    }
}
