use std::collections::HashSet;

use crate::{CompletionLedger, Dependency, PlannerError, Task};

/// Names of the plan tasks that `task` waits on directly. Prefix wildcards
/// are satisfied by existence and never contribute edges.
fn edges<'a>(task: &'a Task, tasks: &'a [Task]) -> impl Iterator<Item = usize> + 'a {
    task.dependencies()
        .iter()
        .filter(|dep| !matches!(dep, Dependency::Prefix(_)))
        .flat_map(move |dep| {
            tasks
                .iter()
                .enumerate()
                .filter(move |(_, other)| other.is_matched_by(dep))
                .map(|(idx, _)| idx)
        })
}

/// Returns the first dependency cycle found, as a path that starts and ends
/// with the same task name.
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack: Vec<usize> = Vec::new();

    fn dfs(
        idx: usize,
        tasks: &[Task],
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|&i| i == idx) {
            let mut cycle: Vec<String> = stack[pos..]
                .iter()
                .map(|&i| tasks[i].name().to_string())
                .collect();
            cycle.push(tasks[idx].name().to_string());
            return Some(cycle);
        }
        if !visited.insert(idx) {
            return None;
        }

        stack.push(idx);
        for next in edges(&tasks[idx], tasks) {
            if let Some(cycle) = dfs(next, tasks, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    (0..tasks.len()).find_map(|idx| {
        if visited.contains(&idx) {
            None
        } else {
            dfs(idx, tasks, &mut visited, &mut stack)
        }
    })
}

/// Checks every key a task declared via `expects` against what could reach
/// its context: its initial payload, the declared output keys of in-plan
/// dependencies, or the recorded outputs of dependencies completed earlier.
/// An in-plan dependency whose agent declares no keys may produce anything.
pub fn check_declared_inputs(tasks: &[Task], prior: &CompletionLedger) -> Result<(), PlannerError> {
    for task in tasks {
        for key in task.expected_keys() {
            if task.context().contains_key(key) {
                continue;
            }

            let from_plan = tasks
                .iter()
                .filter(|other| other.name() != task.name() && task.depends_on_task(other))
                .any(|producer| {
                    let keys = producer.agent().output_keys();
                    keys.is_empty() || keys.iter().any(|k| k == key)
                });

            let from_prior = prior.completed().any(|name| {
                task.dependencies()
                    .iter()
                    .any(|dep| dep.matches(name, prior.group_of(name)))
                    && prior
                        .output_keys(name)
                        .is_some_and(|keys| keys.contains(key))
            });

            if !from_plan && !from_prior {
                return Err(PlannerError::UndeclaredInput {
                    task: task.name().to_string(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(())
}
