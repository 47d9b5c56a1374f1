//! Field dependency graph.
//!
//! An edge means "the dependant reads the dependency". Edges are persisted
//! as [`FieldDependencyRecord`]s so recomputation can be ordered without
//! re-parsing every formula; references that could not be resolved are kept
//! by name and repaired when a field with that name appears.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::catalog::{self, FieldDependencyRecord, FieldRecord};
use crate::formula::FormulaReference;
use crate::query::{Delete, Executor, Filter, Order, Query, Update, Value};
use crate::registry::FieldTypeRegistry;
use crate::storable::{fetch_records, insert_record};
use crate::{FieldId, TableError};

pub const CYCLE_ERROR: &str = "the formula references itself through a cycle";

/// Recomputation order for a change, with fields caught in cycles set aside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Fields to recompute, dependencies before dependants.
    pub order: Vec<FieldId>,
    /// Fields in a cycle. They are flagged with an error and not recomputed.
    pub cyclic: Vec<FieldId>,
}

#[derive(Debug, Clone, Default)]
pub struct FieldDependencyGraph {
    dependencies: BTreeMap<FieldId, BTreeSet<FieldId>>,
    dependants: BTreeMap<FieldId, BTreeSet<FieldId>>,
}

impl FieldDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted edges. A lookup depends on both its target and
    /// the link field it reads through.
    pub fn from_records(records: &[FieldDependencyRecord]) -> Self {
        let mut graph = Self::new();
        for record in records {
            if let Some(dependency) = record.dependency_id {
                graph.add_edge(record.dependant_id, dependency);
            }
            if let Some(via) = record.via_id {
                graph.add_edge(record.dependant_id, via);
            }
        }
        graph
    }

    pub fn add_edge(&mut self, dependant: FieldId, dependency: FieldId) {
        self.dependencies
            .entry(dependant)
            .or_default()
            .insert(dependency);
        self.dependants
            .entry(dependency)
            .or_default()
            .insert(dependant);
    }

    pub fn remove_field(&mut self, field: FieldId) {
        if let Some(dependencies) = self.dependencies.remove(&field) {
            for dependency in dependencies {
                if let Some(set) = self.dependants.get_mut(&dependency) {
                    set.remove(&field);
                }
            }
        }
        if let Some(dependants) = self.dependants.remove(&field) {
            for dependant in dependants {
                if let Some(set) = self.dependencies.get_mut(&dependant) {
                    set.remove(&field);
                }
            }
        }
    }

    pub fn dependencies_of(&self, field: FieldId) -> BTreeSet<FieldId> {
        self.dependencies.get(&field).cloned().unwrap_or_default()
    }

    pub fn dependants_of(&self, field: FieldId) -> BTreeSet<FieldId> {
        self.dependants.get(&field).cloned().unwrap_or_default()
    }

    /// Every field that transitively reads one of `changed`.
    pub fn all_dependants(&self, changed: &[FieldId]) -> BTreeSet<FieldId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<FieldId> = changed.to_vec();
        while let Some(field) = stack.pop() {
            for dependant in self.dependants.get(&field).into_iter().flatten() {
                if seen.insert(*dependant) {
                    stack.push(*dependant);
                }
            }
        }
        seen
    }

    /// Strongly connected components that form cycles, including self
    /// references. Members and components are sorted.
    pub fn cycles(&self) -> Vec<Vec<FieldId>> {
        let nodes: BTreeSet<FieldId> = self
            .dependencies
            .keys()
            .chain(self.dependants.keys())
            .copied()
            .collect();
        self.cycles_within(&nodes)
    }

    /// The order in which the dependants of `changed` must be recomputed.
    /// Fails if any of them take part in a cycle.
    pub fn topological_update_order(&self, changed: &[FieldId]) -> Result<Vec<FieldId>, TableError> {
        let reachable = self.all_dependants(changed);
        let mut scope = reachable.clone();
        scope.extend(changed.iter().copied());

        let cycles = self.cycles_within(&scope);
        if !cycles.is_empty() {
            let mut members: Vec<FieldId> = cycles.into_iter().flatten().collect();
            members.sort_unstable();
            return Err(TableError::CyclicDependency(members));
        }
        Ok(self.kahn(&reachable))
    }

    /// Like [`topological_update_order`](Self::topological_update_order),
    /// but fields caught in a cycle are reported instead of failing the plan.
    /// Fields downstream of a cycle are still ordered.
    pub fn update_plan(&self, changed: &[FieldId]) -> UpdatePlan {
        let cyclic: BTreeSet<FieldId> = self.cycles().into_iter().flatten().collect();
        let reachable = self.all_dependants(changed);

        let mut touched = reachable.clone();
        touched.extend(changed.iter().copied());
        let plan_cyclic: Vec<FieldId> = touched.intersection(&cyclic).copied().collect();

        let acyclic: BTreeSet<FieldId> = reachable.difference(&cyclic).copied().collect();
        UpdatePlan {
            order: self.kahn(&acyclic),
            cyclic: plan_cyclic,
        }
    }

    /// Order an arbitrary set of fields by the edges among them.
    pub fn evaluation_order(&self, nodes: &BTreeSet<FieldId>) -> UpdatePlan {
        let cyclic: BTreeSet<FieldId> = self.cycles_within(nodes).into_iter().flatten().collect();
        let acyclic: BTreeSet<FieldId> = nodes.difference(&cyclic).copied().collect();
        UpdatePlan {
            order: self.kahn(&acyclic),
            cyclic: cyclic.into_iter().collect(),
        }
    }

    /// Kahn's algorithm over the subgraph induced by `nodes`. Ties resolve to
    /// the lowest id so the order is deterministic.
    fn kahn(&self, nodes: &BTreeSet<FieldId>) -> Vec<FieldId> {
        let mut in_degree: HashMap<FieldId, usize> = nodes
            .iter()
            .map(|n| {
                let degree = self
                    .dependencies
                    .get(n)
                    .map(|deps| deps.iter().filter(|d| nodes.contains(*d) && *d != n).count())
                    .unwrap_or(0);
                (*n, degree)
            })
            .collect();

        let mut ready: BTreeSet<FieldId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for dependant in self.dependants.get(&node).into_iter().flatten() {
                if !nodes.contains(dependant) || *dependant == node {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(dependant) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependant);
                    }
                }
            }
        }
        order
    }

    /// Tarjan's algorithm on the subgraph induced by `nodes`, iterative to
    /// keep long dependency chains off the call stack.
    fn cycles_within(&self, nodes: &BTreeSet<FieldId>) -> Vec<Vec<FieldId>> {
        let successors = |v: FieldId| -> Vec<FieldId> {
            self.dependants
                .get(&v)
                .map(|s| s.iter().filter(|w| nodes.contains(*w)).copied().collect())
                .unwrap_or_default()
        };

        let mut next_index = 0usize;
        let mut index: HashMap<FieldId, usize> = HashMap::new();
        let mut lowlink: HashMap<FieldId, usize> = HashMap::new();
        let mut on_stack: HashSet<FieldId> = HashSet::new();
        let mut stack: Vec<FieldId> = Vec::new();
        let mut components = Vec::new();

        for &root in nodes {
            if index.contains_key(&root) {
                continue;
            }
            let mut work: Vec<(FieldId, usize)> = vec![(root, 0)];
            while let Some((v, child)) = work.pop() {
                if child == 0 && !index.contains_key(&v) {
                    index.insert(v, next_index);
                    lowlink.insert(v, next_index);
                    next_index += 1;
                    stack.push(v);
                    on_stack.insert(v);
                }

                let succ = successors(v);
                if child < succ.len() {
                    let w = succ[child];
                    work.push((v, child + 1));
                    match index.get(&w) {
                        None => work.push((w, 0)),
                        Some(&w_index) if on_stack.contains(&w) => {
                            let low = lowlink.get(&v).copied().unwrap_or(w_index).min(w_index);
                            lowlink.insert(v, low);
                        }
                        Some(_) => {}
                    }
                    continue;
                }

                let v_low = lowlink.get(&v).copied().unwrap_or(0);
                if Some(&v_low) == index.get(&v) {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack.remove(&w);
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    let self_loop = component.len() == 1 && succ.contains(&v);
                    if component.len() > 1 || self_loop {
                        component.sort_unstable();
                        components.push(component);
                    }
                }
                if let Some(&(parent, _)) = work.last() {
                    let parent_low = lowlink.get(&parent).copied().unwrap_or(v_low).min(v_low);
                    lowlink.insert(parent, parent_low);
                }
            }
        }
        components.sort();
        components
    }
}

/// Load every resolved edge of the catalog.
pub async fn load_graph<E: Executor + ?Sized>(exec: &mut E) -> Result<FieldDependencyGraph, TableError> {
    let records: Vec<FieldDependencyRecord> =
        fetch_records(exec, &Query::of::<FieldDependencyRecord>().order_by("id", Order::Asc)).await?;
    Ok(FieldDependencyGraph::from_records(&records))
}

pub async fn records_for_dependant<E: Executor + ?Sized>(
    exec: &mut E,
    field_id: FieldId,
) -> Result<Vec<FieldDependencyRecord>, TableError> {
    fetch_records(
        exec,
        &Query::of::<FieldDependencyRecord>()
            .eq("dependant_id", field_id)
            .order_by("id", Order::Asc),
    )
    .await
}

/// Replace the persisted dependencies of `field` with what its current
/// definition references.
pub async fn rebuild_field_dependencies<E: Executor + ?Sized>(
    exec: &mut E,
    registry: &FieldTypeRegistry,
    field: &FieldRecord,
) -> Result<Vec<FieldDependencyRecord>, TableError> {
    delete_field_dependencies(exec, field.id).await?;
    if field.trashed {
        return Ok(Vec::new());
    }

    let field_type = registry.type_of(field)?;
    let references = match field_type.expression(field) {
        Ok(Some(expr)) => expr.references(),
        Ok(None) => return Ok(Vec::new()),
        Err(e) => {
            debug!(field_id = field.id, error = %e, "Skipping dependencies of an invalid formula");
            return Ok(Vec::new());
        }
    };

    let siblings = catalog::fields_for_table(exec, field.table_id).await?;
    let mut records = Vec::new();
    for reference in references {
        match reference {
            FormulaReference::Field(name) => {
                let record = match siblings.iter().find(|f| f.name == name) {
                    Some(dependency) => edge(field.id, Some(dependency.id), None, None),
                    None => edge(field.id, None, None, Some(name)),
                };
                records.push(record);
            }
            FormulaReference::Lookup { via, target } => {
                let link = siblings
                    .iter()
                    .find(|f| f.name == via && f.link_row_table_id.is_some());
                let Some(link) = link else {
                    records.push(edge(field.id, None, None, Some(via)));
                    continue;
                };
                records.push(edge(field.id, Some(link.id), None, None));

                let target_fields = match link.link_row_table_id {
                    Some(table_id) => catalog::fields_for_table(exec, table_id).await?,
                    None => Vec::new(),
                };
                let record = match target_fields.iter().find(|f| f.name == target) {
                    Some(dependency) => edge(field.id, Some(dependency.id), Some(link.id), None),
                    None => edge(field.id, None, Some(link.id), Some(target)),
                };
                records.push(record);
            }
        }
    }

    let mut stored = Vec::with_capacity(records.len());
    for record in records {
        stored.push(insert_record(exec, &record).await?);
    }
    Ok(stored)
}

fn edge(
    dependant: FieldId,
    dependency: Option<FieldId>,
    via: Option<FieldId>,
    broken: Option<String>,
) -> FieldDependencyRecord {
    FieldDependencyRecord {
        id: 0,
        dependant_id: dependant,
        dependency_id: dependency,
        via_id: via,
        broken_reference_field_name: broken,
    }
}

pub async fn delete_field_dependencies<E: Executor + ?Sized>(
    exec: &mut E,
    field_id: FieldId,
) -> Result<(), TableError> {
    exec.delete(&Delete::of::<FieldDependencyRecord>().eq("dependant_id", field_id))
        .await?;
    Ok(())
}

/// Turn every edge pointing at `field` into a broken reference by name.
/// Returns the affected dependants.
pub async fn break_dependants<E: Executor + ?Sized>(
    exec: &mut E,
    field: &FieldRecord,
) -> Result<BTreeSet<FieldId>, TableError> {
    let query = Query::of::<FieldDependencyRecord>().filter(Filter::Any(vec![
        Filter::Eq("dependency_id".into(), Value::Int(field.id)),
        Filter::Eq("via_id".into(), Value::Int(field.id)),
    ]));
    let records: Vec<FieldDependencyRecord> = fetch_records(exec, &query).await?;
    let dependants: BTreeSet<FieldId> = records.iter().map(|r| r.dependant_id).collect();

    exec.update(
        &Update::of::<FieldDependencyRecord>()
            .set("dependency_id", Value::Null(crate::ColumnType::BigInt))
            .set("broken_reference_field_name", field.name.as_str())
            .eq("dependency_id", field.id),
    )
    .await?;
    exec.update(
        &Update::of::<FieldDependencyRecord>()
            .set("via_id", Value::Null(crate::ColumnType::BigInt))
            .eq("via_id", field.id),
    )
    .await?;
    Ok(dependants)
}

/// Rebuild the dependants holding a broken reference to `name`. Returns the
/// ids of the rebuilt fields.
pub async fn fix_broken_references<E: Executor + ?Sized>(
    exec: &mut E,
    registry: &FieldTypeRegistry,
    name: &str,
) -> Result<BTreeSet<FieldId>, TableError> {
    let records: Vec<FieldDependencyRecord> = fetch_records(
        exec,
        &Query::of::<FieldDependencyRecord>().eq("broken_reference_field_name", name),
    )
    .await?;
    let dependants: BTreeSet<FieldId> = records.iter().map(|r| r.dependant_id).collect();

    let mut rebuilt = BTreeSet::new();
    for dependant in catalog::fields_by_ids(exec, &dependants.iter().copied().collect::<Vec<_>>()).await? {
        if dependant.trashed {
            continue;
        }
        rebuild_field_dependencies(exec, registry, &dependant).await?;
        rebuilt.insert(dependant.id);
    }
    Ok(rebuilt)
}

/// Recompute the error state of computed fields from their dependency
/// records and the current cycles. Returns the fields whose error changed.
pub async fn refresh_errors<E: Executor + ?Sized>(
    exec: &mut E,
    registry: &FieldTypeRegistry,
    graph: &FieldDependencyGraph,
    field_ids: &BTreeSet<FieldId>,
) -> Result<Vec<FieldRecord>, TableError> {
    let cyclic: BTreeSet<FieldId> = graph.cycles().into_iter().flatten().collect();
    let mut changed = Vec::new();

    let ids: Vec<FieldId> = field_ids.iter().copied().collect();
    for mut field in catalog::fields_by_ids(exec, &ids).await? {
        if field.trashed {
            continue;
        }
        let field_type = registry.type_of(&field)?;
        let error = match field_type.expression(&field) {
            Ok(None) => continue,
            Err(e) => Some(e.to_string()),
            Ok(Some(_)) => {
                let broken = records_for_dependant(exec, field.id)
                    .await?
                    .into_iter()
                    .find_map(|r| r.broken_reference_field_name);
                match broken {
                    Some(name) => Some(format!("the formula references the unknown field {:?}", name)),
                    None if cyclic.contains(&field.id) => Some(CYCLE_ERROR.to_string()),
                    None => None,
                }
            }
        };
        if error != field.error {
            if error.is_some() {
                warn!(field_id = field.id, error = ?error, "Field is now in an error state");
            }
            exec.update(
                &Update::of::<FieldRecord>()
                    .set(
                        "error",
                        error
                            .clone()
                            .map(Value::String)
                            .unwrap_or(Value::Null(crate::ColumnType::Text)),
                    )
                    .eq("id", field.id),
            )
            .await?;
            field.error = error;
            changed.push(field);
        }
    }
    Ok(changed)
}

/// Ids of fields whose records reference `field_id` directly.
pub async fn direct_dependants<E: Executor + ?Sized>(
    exec: &mut E,
    field_id: FieldId,
) -> Result<BTreeSet<FieldId>, TableError> {
    let records: Vec<FieldDependencyRecord> = fetch_records(
        exec,
        &Query::of::<FieldDependencyRecord>().filter(Filter::Any(vec![
            Filter::Eq("dependency_id".into(), Value::Int(field_id)),
            Filter::Eq("via_id".into(), Value::Int(field_id)),
        ])),
    )
    .await?;
    Ok(records.into_iter().map(|r| r.dependant_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(FieldId, FieldId)]) -> FieldDependencyGraph {
        let mut graph = FieldDependencyGraph::new();
        for (dependant, dependency) in edges {
            graph.add_edge(*dependant, *dependency);
        }
        graph
    }

    #[test]
    fn dependencies_come_before_dependants() {
        // 2 and 3 read 1, 4 reads 2 and 3, 5 reads 4.
        let g = graph(&[(2, 1), (3, 1), (4, 2), (4, 3), (5, 4)]);
        assert_eq!(g.topological_update_order(&[1]).unwrap(), vec![2, 3, 4, 5]);
        assert_eq!(g.topological_update_order(&[3]).unwrap(), vec![4, 5]);
        assert!(g.topological_update_order(&[5]).unwrap().is_empty());
    }

    #[test]
    fn cycles_fail_the_strict_order() {
        let g = graph(&[(2, 1), (3, 2), (2, 3)]);
        match g.topological_update_order(&[1]) {
            Err(TableError::CyclicDependency(members)) => assert_eq!(members, vec![2, 3]),
            other => panic!("expected a cycle, got {:?}", other),
        }
        assert_eq!(g.cycles(), vec![vec![2, 3]]);
    }

    #[test]
    fn plans_exclude_cycles_without_disturbing_other_fields() {
        // 2 <-> 3 is a cycle, 4 reads 3, 5 reads 1 directly.
        let g = graph(&[(2, 1), (3, 2), (2, 3), (4, 3), (5, 1)]);
        let plan = g.update_plan(&[1]);
        assert_eq!(plan.cyclic, vec![2, 3]);
        assert_eq!(plan.order, vec![4, 5]);
    }

    #[test]
    fn self_references_are_cycles() {
        let g = graph(&[(7, 7)]);
        assert_eq!(g.cycles(), vec![vec![7]]);
        assert_eq!(g.update_plan(&[7]).cyclic, vec![7]);
    }

    #[test]
    fn long_chains_do_not_recurse() {
        let edges: Vec<(FieldId, FieldId)> = (1..20_000).map(|i| (i + 1, i)).collect();
        let g = graph(&edges);
        assert!(g.cycles().is_empty());
        assert_eq!(g.topological_update_order(&[1]).unwrap().len(), 19_999);
    }

    #[test]
    fn removing_a_field_drops_its_edges() {
        let mut g = graph(&[(2, 1), (3, 2)]);
        g.remove_field(2);
        assert!(g.dependants_of(1).is_empty());
        assert!(g.dependencies_of(3).is_empty());
    }
}
