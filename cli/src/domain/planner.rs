//! Resource planner: diff a declared topology against the last snapshot.
//!
//! Pure and deterministic. Ordering is derived from an explicit dependency
//! graph, never from declaration order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use keel_common::{
    Action, ChangeOp, ChangeSet, DeclaredTopology, IngressRule, InstanceParams,
    ResourceKind, ResourceParams, StateSnapshot, instance_name, policy_name,
};

use crate::domain::bootstrap::{digest, effective_bootstrap};
use crate::domain::error::CycleError;

// ── Dependency graph ─────────────────────────────────────────────────────────

/// Directed acyclic graph of "node depends on node" edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    /// node -> the nodes it depends on
    deps: BTreeMap<N, BTreeSet<N>>,
}

impl<N> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            deps: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Copy + Display> DependencyGraph<N> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: N) {
        self.deps.entry(node).or_default();
    }

    /// Record that `node` must be created after `dependency`.
    pub fn add_dependency(&mut self, node: N, dependency: N) {
        self.add_node(dependency);
        self.deps.entry(node).or_default().insert(dependency);
    }

    /// Kahn's algorithm. Among ready nodes the smallest (by `Ord`) goes first.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] naming the nodes that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<N>, CycleError> {
        let mut remaining: BTreeMap<N, usize> =
            self.deps.iter().map(|(n, d)| (*n, d.len())).collect();
        let mut ready: BTreeSet<N> = remaining
            .iter()
            .filter(|(_, in_degree)| **in_degree == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.deps.len());

        while let Some(node) = ready.pop_first() {
            remaining.remove(&node);
            order.push(node);
            for (dependent, deps) in &self.deps {
                if !deps.contains(&node) {
                    continue;
                }
                if let Some(in_degree) = remaining.get_mut(dependent) {
                    *in_degree -= 1;
                    if *in_degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(order)
        } else {
            Err(CycleError(
                remaining.keys().map(ToString::to_string).collect(),
            ))
        }
    }

    /// Every node that transitively depends on `node`.
    #[must_use]
    pub fn dependents_of(&self, node: N) -> BTreeSet<N> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![node];
        while let Some(current) = frontier.pop() {
            for (dependent, deps) in &self.deps {
                if deps.contains(&current) && found.insert(*dependent) {
                    frontier.push(*dependent);
                }
            }
        }
        found
    }
}

/// The fixed graph of managed resources: the instance references both the
/// credential pair and the network policy.
#[must_use]
pub fn resource_graph() -> DependencyGraph<ResourceKind> {
    let mut graph = DependencyGraph::new();
    for kind in ResourceKind::ALL {
        graph.add_node(kind);
    }
    graph.add_dependency(ResourceKind::Instance, ResourceKind::CredentialPair);
    graph.add_dependency(ResourceKind::Instance, ResourceKind::NetworkPolicy);
    graph
}

// ── Planning ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Create,
    Update,
    Replace,
    Destroy,
    Noop,
}

/// Normalise ingress rules to a sorted set.
#[must_use]
pub fn normalize_ingress(rules: &[IngressRule]) -> Vec<IngressRule> {
    rules
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Desired parameters per resource kind for `target`.
fn desired_params(target: &str, declared: &DeclaredTopology) -> BTreeMap<ResourceKind, ResourceParams> {
    let mut out = BTreeMap::new();
    if let Some(cred) = &declared.ssh_credential {
        out.insert(
            ResourceKind::CredentialPair,
            ResourceParams::CredentialPair(cred.clone()),
        );
    }
    out.insert(
        ResourceKind::NetworkPolicy,
        ResourceParams::NetworkPolicy {
            name: policy_name(target),
            ingress: normalize_ingress(&declared.ingress),
        },
    );
    let bootstrap = effective_bootstrap(declared.bootstrap.as_deref()).to_string();
    out.insert(
        ResourceKind::Instance,
        ResourceParams::Instance(InstanceParams {
            name: instance_name(target),
            class: declared.instance_class.clone(),
            image_id: declared.image_id.clone(),
            bootstrap_digest: digest(&bootstrap),
            bootstrap,
            key_name: declared.ssh_credential.as_ref().map(|c| c.name.clone()),
        }),
    );
    out
}

fn compare(kind: ResourceKind, desired: &ResourceParams, snapshot: &StateSnapshot) -> Decision {
    let res = &snapshot.resources;
    match (kind, desired) {
        (ResourceKind::CredentialPair, ResourceParams::CredentialPair(want)) => {
            match &res.credential_pair {
                None => Decision::Create,
                Some(have)
                    if have.name == want.name && have.public_key_path == want.public_key_path =>
                {
                    Decision::Noop
                }
                Some(_) => Decision::Replace,
            }
        }
        (ResourceKind::NetworkPolicy, ResourceParams::NetworkPolicy { name, ingress }) => {
            match &res.network_policy {
                None => Decision::Create,
                Some(have) if have.name != *name => Decision::Replace,
                Some(have) if normalize_ingress(&have.ingress) != *ingress => Decision::Update,
                Some(_) => Decision::Noop,
            }
        }
        (ResourceKind::Instance, ResourceParams::Instance(want)) => match &res.instance {
            None => Decision::Create,
            Some(have) if have.lifecycle.is_terminated() => Decision::Replace,
            Some(have)
                if have.class != want.class
                    || have.image_id != want.image_id
                    || have.bootstrap_digest != want.bootstrap_digest
                    || have.key_name != want.key_name
                    || have.name != want.name =>
            {
                Decision::Replace
            }
            Some(_) => Decision::Noop,
        },
        _ => Decision::Replace,
    }
}

fn existing(snapshot: &StateSnapshot, kind: ResourceKind) -> Option<ResourceParams> {
    snapshot.resources.id_of(kind).map(|id| ResourceParams::Existing {
        id: id.to_string(),
    })
}

fn op(resource_kind: ResourceKind, action: Action, params: ResourceParams) -> ChangeOp {
    ChangeOp {
        resource_kind,
        action,
        params,
    }
}

/// Diff `declared` against `snapshot` into an ordered change-set.
///
/// All destroys come first, in reverse dependency order; creates, updates
/// and no-ops follow in dependency order. Replacing a resource replaces
/// every existing resource that depends on it.
///
/// # Errors
///
/// Returns [`CycleError`] if the resource graph is cyclic.
pub fn plan(declared: &DeclaredTopology, snapshot: &StateSnapshot) -> Result<ChangeSet, CycleError> {
    let graph = resource_graph();
    let order = graph.topological_order()?;
    let desired = desired_params(&snapshot.target_key, declared);

    let mut decisions: BTreeMap<ResourceKind, Decision> = BTreeMap::new();
    for kind in &order {
        let present = snapshot.resources.id_of(*kind).is_some();
        let decision = match desired.get(kind) {
            Some(params) => compare(*kind, params, snapshot),
            None if present => Decision::Destroy,
            None => continue,
        };
        decisions.insert(*kind, decision);
    }

    // Replacement and removal cascade to existing dependents.
    for kind in &order {
        if matches!(
            decisions.get(kind),
            Some(Decision::Replace | Decision::Destroy)
        ) {
            for dependent in graph.dependents_of(*kind) {
                if let Some(d) = decisions.get_mut(&dependent) {
                    if matches!(*d, Decision::Update | Decision::Noop) {
                        *d = Decision::Replace;
                    }
                }
            }
        }
    }

    let mut operations = Vec::new();
    for kind in order.iter().rev() {
        if !matches!(
            decisions.get(kind),
            Some(Decision::Replace | Decision::Destroy)
        ) {
            continue;
        }
        if let Some(params) = existing(snapshot, *kind) {
            operations.push(op(*kind, Action::Destroy, params));
        }
    }
    for kind in &order {
        let (Some(decision), Some(params)) = (decisions.get(kind), desired.get(kind)) else {
            continue;
        };
        match decision {
            Decision::Create | Decision::Replace => {
                operations.push(op(*kind, Action::Create, params.clone()));
            }
            Decision::Update => operations.push(op(*kind, Action::Update, params.clone())),
            Decision::Noop => {
                if let Some(params) = existing(snapshot, *kind) {
                    operations.push(op(*kind, Action::Noop, params));
                }
            }
            Decision::Destroy => {}
        }
    }

    Ok(ChangeSet { operations })
}

/// Destroy every recorded resource in reverse dependency order.
///
/// # Errors
///
/// Returns [`CycleError`] if the resource graph is cyclic.
pub fn plan_teardown(snapshot: &StateSnapshot) -> Result<ChangeSet, CycleError> {
    let order = resource_graph().topological_order()?;
    let operations = order
        .iter()
        .rev()
        .filter_map(|kind| existing(snapshot, *kind).map(|p| op(*kind, Action::Destroy, p)))
        .collect();
    Ok(ChangeSet { operations })
}
