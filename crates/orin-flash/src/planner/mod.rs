use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Dependencies, as task ids or provide tokens. A trailing `?` marks the
    /// dependency optional: it is dropped when nothing in the plan satisfies
    /// it (used to order against stages that may not be planned at all, like
    /// the overlay step or the whole fetch group).
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if self.tasks.contains_key(dep) {
            return Ok(Some(dep));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!("unknown dependency '{}'", dep)))
    }

    /// Deterministic topological order of the plan.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let provides = self.provides_index()?;

        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (id, task) in &self.tasks {
            incoming.insert(id.as_str(), 0);
            outgoing.entry(id.as_str()).or_default();
            for dep in &task.after {
                let resolved = self.resolve_dep(&provides, dep.as_str()).map_err(|e| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?;
                let Some(dep_id) = resolved else {
                    continue;
                };
                outgoing.entry(dep_id).or_default().insert(id.as_str());
                *incoming.get_mut(id.as_str()).unwrap() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&str> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            out.push(n);
            if let Some(children) = outgoing.get(n) {
                for &m in children {
                    let slot = incoming.get_mut(m).unwrap();
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out
            .into_iter()
            .map(|id| self.tasks.get(id).expect("task must exist"))
            .collect())
    }

    pub fn to_dot(&self) -> Result<String> {
        let provides = self.provides_index()?;

        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_dep(&provides, dep.as_str())? else {
                    continue;
                };
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep_id, task.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, after: &[&str], provides: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_after_and_provide_tokens() {
        let mut plan = Plan::default();
        plan.add(task("b", &["tok:a"], &[])).unwrap();
        plan.add(task("a", &[], &["tok:a"])).unwrap();

        let ids: Vec<&str> = plan.ordered().unwrap().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn optional_deps_are_dropped_when_unsatisfied() {
        let mut plan = Plan::default();
        plan.add(task("only", &["missing?"], &[])).unwrap();
        let ids: Vec<&str> = plan.ordered().unwrap().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["only"]);

        let mut bad = Plan::default();
        bad.add(task("only", &["missing"], &[])).unwrap();
        assert!(bad.ordered().is_err());
    }

    #[test]
    fn detects_cycles() {
        let mut plan = Plan::default();
        plan.add(task("a", &["b"], &[])).unwrap();
        plan.add(task("b", &["a"], &[])).unwrap();
        let err = plan.ordered().unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }
}
