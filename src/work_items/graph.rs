//! Dependency graph checks over work items.
//!
//! The graph maps each work item to the ids it depends on. All functions are
//! pure so they can run inside a single database call.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use pcc_common::WorkItemStatus;

/// Order the items so every dependency precedes its dependents.
///
/// Edges to ids outside `deps` are ignored. On failure returns one cycle as a
/// path whose first and last element are the same id.
pub fn topological_order(deps: &HashMap<String, Vec<String>>) -> Result<Vec<String>, Vec<String>> {
    // BTree keeps the output deterministic.
    let nodes: BTreeSet<&str> = deps.keys().map(String::as_str).collect();
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &nodes {
        let inside: BTreeSet<&str> = deps[*node]
            .iter()
            .map(String::as_str)
            .filter(|d| nodes.contains(d))
            .collect();
        pending.insert(*node, inside.len());
        for dep in inside {
            dependents.entry(dep).or_default().push(*node);
        }
    }

    let mut queue: VecDeque<&str> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for child in children {
                if let Some(n) = pending.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    // Every node left over still waits on another leftover node, so walking
    // dependencies from any of them must revisit a node.
    let leftover: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(id, _)| *id)
        .collect();
    let mut path: Vec<&str> = Vec::new();
    let mut current = match leftover.iter().next() {
        Some(first) => *first,
        None => return Err(Vec::new()),
    };
    loop {
        if let Some(pos) = path.iter().position(|p| *p == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return Err(cycle);
        }
        path.push(current);
        let next = deps[current]
            .iter()
            .map(String::as_str)
            .find(|d| leftover.contains(d));
        match next {
            Some(next) => current = next,
            None => return Err(path.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// Dependencies of `deps` whose status is anything but done.
pub fn pending_dependencies(
    deps: &[String],
    statuses: &HashMap<String, WorkItemStatus>,
) -> Vec<String> {
    deps.iter()
        .filter(|d| statuses.get(*d) != Some(&WorkItemStatus::Done))
        .cloned()
        .collect()
}

/// Dependents of `done_id` that become ready now that it is done: items in
/// `backlog` with at least one dependency, all of them done.
pub fn cascade_candidates(
    done_id: &str,
    deps: &HashMap<String, Vec<String>>,
    statuses: &HashMap<String, WorkItemStatus>,
) -> Vec<String> {
    let mut out: Vec<String> = deps
        .iter()
        .filter(|(_, d)| d.iter().any(|x| x == done_id))
        .filter(|(id, _)| statuses.get(*id) == Some(&WorkItemStatus::Backlog))
        .filter(|(_, d)| pending_dependencies(d, statuses).is_empty())
        .map(|(id, _)| id.clone())
        .collect();
    out.sort();
    out
}
