//! Compiling module declarations into a [`StaticIr`].

use converge_foundation::{
    FieldPath, FieldPathError, FieldPathId, StepId, fnv1a64_mix, fnv1a64_mix_u32, fnv1a64_str,
};
use indexmap::IndexMap;
use tracing::{debug, instrument};

use crate::declaration::{FieldEntry, ModuleDeclaration, Scheduling};
use crate::error::{Error, Result};

use super::registry::FieldPathRegistry;
use super::topology::{CycleError, dependents, find_link_cycle, topological_levels};
use super::types::{Scope, ScopeOrder, StaticIr, Step, StepBody, StepKind, TriggerIndex};

/// A derivation entry after path validation, before id assignment.
struct PendingStep {
    out: FieldPath,
    deps: Vec<FieldPath>,
    from: Option<FieldPath>,
    body: StepBody,
    scheduling: Scheduling,
    label: String,
    group: String,
}

/// Builder collecting declaration groups into one static IR.
///
/// Groups can be added one at a time; the first collision between two groups
/// is reported immediately.
pub struct IrBuilder {
    declaration: ModuleDeclaration,
    owners: IndexMap<FieldPath, String>,
    pending: Vec<PendingStep>,
    reserved: Vec<FieldPath>,
}

fn parse(raw: &str, context: impl FnOnce() -> String) -> Result<FieldPath> {
    FieldPath::parse(raw).map_err(|source: FieldPathError| Error::InvalidFieldPath {
        raw: raw.to_string(),
        context: context(),
        source,
    })
}

impl IrBuilder {
    /// Start a builder for a declaration (its groups are added by [`Self::build`]).
    pub fn new(declaration: &ModuleDeclaration) -> Self {
        Self {
            declaration: declaration.clone(),
            owners: IndexMap::new(),
            pending: Vec::new(),
            reserved: Vec::new(),
        }
    }

    fn claim(&mut self, path: &FieldPath, group: &str) -> Result<()> {
        if let Some(first) = self.owners.get(path) {
            return Err(Error::DuplicateFieldPath {
                path: path.to_string(),
                first_group: first.clone(),
                second_group: group.to_string(),
            });
        }
        self.owners.insert(path.clone(), group.to_string());
        Ok(())
    }

    fn add_group(&mut self, index: usize) -> Result<()> {
        let group = self.declaration.groups()[index].clone();
        let name = group.name().to_string();

        for (raw, entry) in group.entries() {
            let out = parse(raw, || format!("group `{name}`"))?;
            self.claim(&out, &name)?;

            match entry {
                FieldEntry::Computed(computed) => {
                    if computed.deps.is_empty() {
                        return Err(Error::MissingDeps {
                            path: out.to_string(),
                        });
                    }
                    if out.has_wildcard() {
                        return Err(Error::WildcardTarget {
                            path: out.to_string(),
                        });
                    }
                    let deps = computed
                        .deps
                        .iter()
                        .map(|d| parse(d, || format!("deps of `{out}`")))
                        .collect::<Result<Vec<_>>>()?;
                    self.pending.push(PendingStep {
                        label: out.to_string(),
                        out,
                        deps,
                        from: None,
                        body: StepBody::Computed {
                            derive: computed.derive.clone(),
                            equals: computed.equals.clone(),
                        },
                        scheduling: computed.scheduling,
                        group: name.clone(),
                    });
                }
                FieldEntry::Link(link) => {
                    if out.has_wildcard() {
                        return Err(Error::WildcardTarget {
                            path: out.to_string(),
                        });
                    }
                    let from = parse(&link.from, || format!("link source of `{out}`"))?;
                    if from == out {
                        return Err(Error::SelfLink {
                            path: out.to_string(),
                        });
                    }
                    self.pending.push(PendingStep {
                        label: out.to_string(),
                        deps: vec![from.clone()],
                        from: Some(from),
                        out,
                        body: StepBody::Link,
                        scheduling: link.scheduling,
                        group: name.clone(),
                    });
                }
                FieldEntry::Source { deps } => {
                    for dep in deps {
                        parse(dep, || format!("source deps of `{out}`"))?;
                    }
                    self.reserved.push(out);
                }
                FieldEntry::Node | FieldEntry::List => self.reserved.push(out),
            }
        }
        Ok(())
    }

    /// Validate every group and compile the graph.
    #[instrument(skip(self), fields(module = %self.declaration.module_id()), name = "compile_ir")]
    pub fn build(mut self, generation: u64) -> Result<StaticIr> {
        for index in 0..self.declaration.groups().len() {
            self.add_group(index)?;
        }

        // Step ids follow output path order, independent of declaration order
        self.pending.sort_by(|a, b| a.out.cmp(&b.out));

        let registry = FieldPathRegistry::build(
            self.pending
                .iter()
                .flat_map(|p| std::iter::once(&p.out).chain(p.deps.iter())),
        );
        // Every step path is in the registry.
        let mut steps: Vec<Step> = Vec::with_capacity(self.pending.len());
        let mut bodies = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let Some(out) = registry.id(&pending.out) else {
                continue;
            };
            let mut deps: Vec<FieldPathId> =
                pending.deps.iter().filter_map(|d| registry.id(d)).collect();
            deps.sort();
            deps.dedup();
            steps.push(Step {
                id: StepId::from_index(steps.len()),
                kind: match pending.body {
                    StepBody::Computed { .. } => StepKind::Computed,
                    StepBody::Link => StepKind::Link,
                },
                out,
                deps,
                from: pending.from.as_ref().and_then(|f| registry.id(f)),
                scheduling: pending.scheduling,
                label: pending.label,
                group: pending.group,
            });
            bodies.push(pending.body);
        }

        if let Some(out) = find_link_cycle(&steps) {
            return Err(Error::LinkCycle {
                path: registry.path(out).to_string(),
            });
        }

        let edges = dependents(&steps, &registry);
        let mut orders: [ScopeOrder; 3] = Default::default();
        let mut levels = Vec::new();
        for scope in Scope::ALL {
            let (scope_levels, cyclic) = match topological_levels(&steps, &edges, scope) {
                Ok(levels) => (levels, Vec::new()),
                Err(CycleError { involved_steps, .. }) if scope == Scope::Immediate => {
                    return Err(Error::ImmediateCycle {
                        steps: involved_steps
                            .iter()
                            .map(|id| steps[id.index()].label.clone())
                            .collect(),
                    });
                }
                Err(CycleError {
                    involved_steps,
                    levels,
                }) => (levels, involved_steps),
            };
            let mut order: Vec<StepId> = scope_levels.iter().flatten().copied().collect();
            order.extend(cyclic.iter().copied());
            if scope == Scope::All {
                levels = scope_levels;
            }
            orders[scope.index()] = ScopeOrder { order, cyclic };
        }

        let triggers = trigger_index(&steps, &registry);

        let shape_warnings = match self.declaration.state_shape() {
            Some(shape) => steps
                .iter()
                .map(|s| registry.path(s.out))
                .filter(|p| !shape.contains(p))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let digest = digest(&steps, &registry, &self.reserved);

        debug!(
            steps = steps.len(),
            paths = registry.len(),
            deferred = orders[Scope::Deferred.index()].order.len(),
            digest = format_args!("{digest:016x}"),
            "static IR compiled"
        );

        Ok(StaticIr {
            module_id: self.declaration.module_id().clone(),
            registry,
            steps,
            bodies,
            orders,
            levels,
            triggers,
            reserved: self.reserved,
            shape_warnings,
            digest,
            generation,
        })
    }
}

/// Compile a declaration.
pub fn compile(declaration: &ModuleDeclaration, generation: u64) -> Result<StaticIr> {
    IrBuilder::new(declaration).build(generation)
}

fn trigger_index(steps: &[Step], registry: &FieldPathRegistry) -> TriggerIndex {
    let mut exact: Vec<Vec<StepId>> = vec![Vec::new(); registry.len()];
    let mut under: Vec<Vec<StepId>> = vec![Vec::new(); registry.len()];

    for step in steps {
        let mut inputs: Vec<FieldPathId> = step.deps.clone();
        inputs.push(step.out);
        inputs.sort();
        inputs.dedup();

        for input in inputs {
            exact[input.index()].push(step.id);
            for &prefix in registry.prefix_chain(input) {
                under[prefix.index()].push(step.id);
            }
        }
    }

    for list in exact.iter_mut().chain(under.iter_mut()) {
        list.sort();
        list.dedup();
    }
    TriggerIndex { exact, under }
}

fn digest(steps: &[Step], registry: &FieldPathRegistry, reserved: &[FieldPath]) -> u64 {
    let mut hash = fnv1a64_str("converge-ir");
    for (_, path) in registry.iter() {
        hash = fnv1a64_mix(hash, path.to_string().as_bytes());
        hash = fnv1a64_mix(hash, &[0]);
    }
    for step in steps {
        hash = fnv1a64_mix_u32(hash, step.kind as u32);
        hash = fnv1a64_mix_u32(hash, step.scheduling as u32);
        hash = fnv1a64_mix_u32(hash, step.out.0);
        hash = fnv1a64_mix_u32(hash, step.deps.len() as u32);
        for dep in &step.deps {
            hash = fnv1a64_mix_u32(hash, dep.0);
        }
    }
    for path in reserved {
        hash = fnv1a64_mix(hash, path.to_string().as_bytes());
        hash = fnv1a64_mix(hash, &[1]);
    }
    hash
}
