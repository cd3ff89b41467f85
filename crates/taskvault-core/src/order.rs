//! Dependency-respecting insert order for source records.
//!
//! Edges come from `parentId` and `depends`. Self references and references to
//! ids outside the record set are dropped before sorting. The sort is Kahn's
//! algorithm over a dense index adjacency list; among ready records the one
//! that appeared first in the input wins, so the output is deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::SourceRecord;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OrderError {
    #[error("dependency cycle detected: {}", ids.join(" -> "))]
    Cycle { ids: Vec<String> },
    #[error("duplicate record id in dependency graph: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Synthesize the edge set for `records`.
    ///
    /// # Errors
    /// Returns [`OrderError::DuplicateId`] when two records share an id.
    pub fn build(records: &[SourceRecord]) -> Result<Self, OrderError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if index.insert(record.id.as_str(), position).is_some() {
                return Err(OrderError::DuplicateId(record.id.clone()));
            }
        }

        let mut successors = vec![Vec::new(); records.len()];
        let mut predecessors = vec![Vec::new(); records.len()];
        let mut seen: HashSet<(usize, usize)> = HashSet::new();

        for (to, record) in records.iter().enumerate() {
            for reference in record.references() {
                let Some(&from) = index.get(reference) else {
                    continue;
                };
                if from == to || !seen.insert((from, to)) {
                    continue;
                }
                successors[from].push(to);
                predecessors[to].push(from);
            }
        }

        Ok(Self {
            ids: records.iter().map(|record| record.id.clone()).collect(),
            successors,
            predecessors,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }

    /// Input indices in insert order.
    ///
    /// # Errors
    /// Returns [`OrderError::Cycle`] naming the ids of one cycle when no valid
    /// order exists. No partial order is returned.
    pub fn order(&self) -> Result<Vec<usize>, OrderError> {
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| Reverse(node))
            .collect();

        let mut ordered = Vec::with_capacity(self.ids.len());
        while let Some(Reverse(node)) = ready.pop() {
            ordered.push(node);
            for &next in &self.successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if ordered.len() < self.ids.len() {
            return Err(OrderError::Cycle { ids: self.find_cycle(&in_degree) });
        }

        Ok(ordered)
    }

    /// Walk predecessor edges among unsorted nodes until one repeats. Every
    /// unsorted node keeps at least one unsorted predecessor, so the walk
    /// always closes a cycle.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let Some(start) = in_degree.iter().position(|degree| *degree > 0) else {
            return Vec::new();
        };

        let mut position_in_path: HashMap<usize, usize> = HashMap::new();
        let mut path = Vec::new();
        let mut current = start;

        loop {
            if let Some(&first) = position_in_path.get(&current) {
                let mut cycle: Vec<String> =
                    path[first..].iter().rev().map(|node: &usize| self.ids[*node].clone()).collect();
                if let Some(head) = cycle.first().cloned() {
                    cycle.push(head);
                }
                return cycle;
            }
            position_in_path.insert(current, path.len());
            path.push(current);

            match self.predecessors[current].iter().find(|pred| in_degree[**pred] > 0) {
                Some(&pred) => current = pred,
                None => return vec![self.ids[current].clone()],
            }
        }
    }
}

/// Ids of `records` in dependency order.
///
/// # Errors
/// Returns [`OrderError`] on duplicate ids or a dependency cycle.
pub fn topological_order(records: &[SourceRecord]) -> Result<Vec<String>, OrderError> {
    let graph = DependencyGraph::build(records)?;
    Ok(graph.order()?.into_iter().map(|index| records[index].id.clone()).collect())
}

/// `true` when the record set has a valid insert order.
#[must_use]
pub fn is_acyclic(records: &[SourceRecord]) -> bool {
    DependencyGraph::build(records).and_then(|graph| graph.order()).is_ok()
}

/// Reorder owned records into dependency order.
///
/// # Errors
/// Returns [`OrderError`] on duplicate ids or a dependency cycle; the input is
/// dropped in that case.
pub fn sort_records(records: Vec<SourceRecord>) -> Result<Vec<SourceRecord>, OrderError> {
    let order = DependencyGraph::build(&records)?.order()?;
    let mut slots: Vec<Option<SourceRecord>> = records.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|index| slots[index].take()).collect())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::Map;

    use super::*;

    fn record(id: &str, parent: Option<&str>, depends: &[&str]) -> SourceRecord {
        SourceRecord {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            depends: depends.iter().map(|dep| (*dep).to_string()).collect(),
            payload: Map::new(),
        }
    }

    #[test]
    fn orders_dependencies_before_dependents() -> Result<(), OrderError> {
        let records = vec![
            record("T003", None, &["T001", "T002"]),
            record("T002", None, &["T001"]),
            record("T001", None, &[]),
        ];
        assert_eq!(topological_order(&records)?, vec!["T001", "T002", "T003"]);
        Ok(())
    }

    #[test]
    fn ready_records_keep_input_order() -> Result<(), OrderError> {
        let records = vec![
            record("B", None, &[]),
            record("A", None, &[]),
            record("C", Some("B"), &[]),
            record("D", None, &[]),
        ];
        assert_eq!(topological_order(&records)?, vec!["B", "A", "C", "D"]);
        Ok(())
    }

    #[test]
    fn drops_self_and_dangling_references() -> Result<(), OrderError> {
        let records =
            vec![record("T1", Some("T1"), &["T999"]), record("T2", Some("EXTERNAL"), &["T1"])];
        let graph = DependencyGraph::build(&records)?;
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(topological_order(&records)?, vec!["T1", "T2"]);
        Ok(())
    }

    #[test]
    fn parent_and_depends_on_same_record_count_once() -> Result<(), OrderError> {
        let records = vec![record("P", None, &[]), record("C", Some("P"), &["P"])];
        assert_eq!(DependencyGraph::build(&records)?.edge_count(), 1);
        Ok(())
    }

    #[test]
    fn cycle_is_reported_with_offending_ids() {
        let records = vec![
            record("OK", None, &[]),
            record("A", None, &["C"]),
            record("B", None, &["A"]),
            record("C", None, &["B"]),
            record("DOWNSTREAM", None, &["C"]),
        ];
        assert!(!is_acyclic(&records));
        match topological_order(&records) {
            Err(OrderError::Cycle { ids }) => {
                assert!(ids.contains(&"A".to_string()));
                assert!(ids.contains(&"B".to_string()));
                assert!(ids.contains(&"C".to_string()));
                assert!(!ids.contains(&"DOWNSTREAM".to_string()));
                assert!(!ids.contains(&"OK".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let records = vec![record("X", None, &[]), record("X", None, &[])];
        assert_eq!(topological_order(&records), Err(OrderError::DuplicateId("X".to_string())));
    }

    #[test]
    fn long_chain_does_not_recurse() -> Result<(), OrderError> {
        let ids: Vec<String> = (0..50_000).map(|n| format!("T{n}")).collect();
        let records: Vec<SourceRecord> = ids
            .iter()
            .enumerate()
            .rev()
            .map(|(n, id)| {
                let depends: Vec<&str> = if n == 0 { vec![] } else { vec![ids[n - 1].as_str()] };
                record(id, None, &depends)
            })
            .collect();
        let ordered = sort_records(records)?;
        assert_eq!(ordered.first().map(|r| r.id.as_str()), Some("T0"));
        assert_eq!(ordered.last().map(|r| r.id.as_str()), Some("T49999"));
        Ok(())
    }

    fn dag_strategy() -> impl Strategy<Value = (Vec<SourceRecord>, Vec<usize>)> {
        (1_usize..40)
            .prop_flat_map(|size| {
                let edges = proptest::collection::vec((0..size, 0..size), 0..size * 3);
                let shuffle = Just((0..size).collect::<Vec<_>>()).prop_shuffle();
                (Just(size), edges, shuffle)
            })
            .prop_map(|(size, edges, shuffle)| {
                // Only lower -> higher rank edges, so the graph is acyclic by construction.
                let mut depends: Vec<Vec<String>> = vec![Vec::new(); size];
                for (a, b) in edges {
                    if a < b {
                        depends[b].push(format!("N{a}"));
                    }
                }
                let records = shuffle
                    .iter()
                    .map(|rank| {
                        let deps: Vec<&str> = depends[*rank].iter().map(String::as_str).collect();
                        record(&format!("N{rank}"), None, &deps)
                    })
                    .collect();
                (records, shuffle)
            })
    }

    proptest! {
        #[test]
        fn acyclic_sets_place_every_record_after_its_dependencies((records, _ranks) in dag_strategy()) {
            let order = topological_order(&records);
            prop_assert!(order.is_ok());
            let order = order.unwrap_or_default();
            prop_assert_eq!(order.len(), records.len());
            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(pos, id)| (id.as_str(), pos)).collect();
            for record in &records {
                for dep in &record.depends {
                    prop_assert!(position[dep.as_str()] < position[record.id.as_str()]);
                }
            }
        }

        #[test]
        fn ordering_is_deterministic((records, _ranks) in dag_strategy()) {
            prop_assert_eq!(topological_order(&records), topological_order(&records));
        }

        #[test]
        fn closing_a_back_edge_is_detected((records, _ranks) in dag_strategy()) {
            let order = topological_order(&records).unwrap_or_default();
            prop_assume!(order.len() >= 2);
            let first = order[0].clone();
            let last = order[order.len() - 1].clone();
            let mut cyclic = records.clone();
            for record in &mut cyclic {
                if record.id == first {
                    record.depends.push(last.clone());
                }
            }
            // Only a back edge onto an ancestor closes a cycle.
            let reaches_first = depends_transitively(&records, &last, &first);
            prop_assume!(reaches_first);
            prop_assert!(!is_acyclic(&cyclic));
            let is_cycle_error = matches!(topological_order(&cyclic), Err(OrderError::Cycle { .. }));
            prop_assert!(is_cycle_error);
        }
    }

    fn depends_transitively(records: &[SourceRecord], from: &str, target: &str) -> bool {
        let by_id: HashMap<&str, &SourceRecord> =
            records.iter().map(|record| (record.id.as_str(), record)).collect();
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(record) = by_id.get(id) {
                stack.extend(record.depends.iter().map(String::as_str));
            }
        }
        false
    }
}
