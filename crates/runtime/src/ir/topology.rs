//! Step dependency edges, topological sorting and cycle detection.

use converge_foundation::{FieldPathId, StepId};
use indexmap::{IndexMap, IndexSet};

use super::registry::FieldPathRegistry;
use super::types::{Scope, Step, StepKind};

/// Error returned when steps cannot be fully ordered.
///
/// The steps in `involved_steps` still had unresolved dependencies when no
/// more progress was possible; `levels` holds the part that did order, so
/// callers that tolerate cycles can append the rest.
#[derive(Debug)]
pub struct CycleError {
    /// Steps on or downstream of a cycle, in id order.
    pub involved_steps: Vec<StepId>,
    /// Levels ordered before the sort stalled.
    pub levels: Vec<Vec<StepId>>,
}

/// For each step, the steps that read its output.
///
/// Step `b` reads step `a` when one of `b`'s dependencies overlaps `a`'s
/// output: either the dependency lies under the output or it is an ancestor
/// object containing it.
pub(super) fn dependents(steps: &[Step], registry: &FieldPathRegistry) -> Vec<Vec<StepId>> {
    let mut producers: IndexMap<FieldPathId, Vec<StepId>> = IndexMap::new();
    for step in steps {
        producers.entry(step.out).or_default().push(step.id);
    }

    let mut out: Vec<IndexSet<StepId>> = vec![IndexSet::new(); steps.len()];
    for reader in steps {
        for &dep in &reader.deps {
            let dep_path = registry.path(dep);
            for (&produced, writers) in &producers {
                if !registry.path(produced).overlaps(dep_path) {
                    continue;
                }
                for &writer in writers {
                    if writer != reader.id {
                        out[writer.index()].insert(reader.id);
                    }
                }
            }
        }
    }
    out.into_iter().map(|set| set.into_iter().collect()).collect()
}

/// Compute topological levels of the steps in `scope` using Kahn's algorithm.
pub(super) fn topological_levels(
    steps: &[Step],
    dependents: &[Vec<StepId>],
    scope: Scope,
) -> Result<Vec<Vec<StepId>>, CycleError> {
    let members: Vec<&Step> = steps
        .iter()
        .filter(|s| scope.includes(s.scheduling))
        .collect();
    if members.is_empty() {
        return Ok(Vec::new());
    }

    // Initialize in-degrees over edges inside the scope
    let mut in_degree: IndexMap<StepId, usize> = members.iter().map(|s| (s.id, 0)).collect();
    for step in &members {
        for dependent in &dependents[step.id.index()] {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree += 1;
            }
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<StepId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0;

    while !current.is_empty() {
        // Sort for determinism
        current.sort();
        processed += current.len();

        let mut next = Vec::new();
        for id in &current {
            for dependent in &dependents[id.index()] {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }

        levels.push(std::mem::take(&mut current));
        current = next;
    }

    if processed != members.len() {
        let mut involved_steps: Vec<StepId> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        involved_steps.sort();
        return Err(CycleError {
            involved_steps,
            levels,
        });
    }

    Ok(levels)
}

/// Find a chain of links that returns to where it started.
///
/// Returns the output id of the first link found on a cycle. A link whose
/// source is another link's output continues the chain; any other source
/// ends it.
pub(super) fn find_link_cycle(steps: &[Step]) -> Option<FieldPathId> {
    let links: IndexMap<FieldPathId, FieldPathId> = steps
        .iter()
        .filter(|s| s.kind == StepKind::Link)
        .filter_map(|s| s.from.map(|from| (s.out, from)))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: IndexMap<FieldPathId, Mark> =
        links.keys().map(|k| (*k, Mark::Unvisited)).collect();

    for &start in links.keys() {
        if marks[&start] != Mark::Unvisited {
            continue;
        }
        let mut path = Vec::new();
        let mut cursor = Some(start);
        while let Some(node) = cursor {
            match marks.get(&node).copied() {
                Some(Mark::InProgress) => return Some(node),
                Some(Mark::Unvisited) => {
                    marks.insert(node, Mark::InProgress);
                    path.push(node);
                    cursor = links.get(&node).copied();
                }
                Some(Mark::Done) | None => cursor = None,
            }
        }
        for node in path {
            marks.insert(node, Mark::Done);
        }
    }
    None
}
