//! Resource graph builder.
//!
//! Collects declared resources and grants, checks every dependency edge
//! names a declared resource, and orders the resources so that providers
//! come before their consumers. Independent resources keep declaration order.

use greenlight_config::Topology;
use greenlight_core::Resource;
use greenlight_core::access::Grant;
use greenlight_core::resource::DependencyEdge;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Output key a grant principal waits on before its grants can be applied.
const GRANT_KEY: &str = "arn";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("'{consumer}' requires '{key}' of undeclared resource '{provider}'")]
    UnresolvedReference {
        consumer: String,
        provider: String,
        key: String,
    },

    #[error("grant principal '{0}' is not declared")]
    UnknownPrincipal(String),

    #[error("duplicate resource: {0}")]
    Duplicate(String),
}

impl From<GraphError> for greenlight_core::Error {
    fn from(err: GraphError) -> Self {
        greenlight_core::Error::Configuration(err.to_string())
    }
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    resources: Vec<Resource>,
    index: HashMap<String, usize>,
    grants: Vec<Grant>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare every resource and grant of a parsed topology.
    pub fn from_topology(topology: &Topology) -> Result<Self, GraphError> {
        let mut builder = Self::new();
        for resource in &topology.resources {
            builder.declare(resource.clone())?;
        }
        for grant in &topology.grants {
            builder.declare_grant(grant.clone());
        }
        Ok(builder)
    }

    /// Register a resource. Names are unique.
    pub fn declare(&mut self, resource: Resource) -> Result<(), GraphError> {
        if self.index.contains_key(&resource.name) {
            return Err(GraphError::Duplicate(resource.name));
        }
        self.index.insert(resource.name.clone(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Register a grant. The principal depends on the granted resource, so
    /// the grant can be applied as soon as the principal is ready.
    pub fn declare_grant(&mut self, grant: Grant) {
        if !self.grants.contains(&grant) {
            self.grants.push(grant);
        }
    }

    fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .resources
            .iter()
            .flat_map(Resource::dependencies)
            .collect();
        for grant in &self.grants {
            let edge = DependencyEdge {
                consumer: grant.principal.clone(),
                provider: grant.resource.clone(),
                key: GRANT_KEY.to_string(),
            };
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }
        edges
    }

    /// Order the declared resources. Fails on a reference to an undeclared
    /// resource or on a cycle, before anything is materialized.
    pub fn build(self) -> Result<ProvisionPlan, GraphError> {
        let edges = self.edges();

        for edge in &edges {
            if !self.index.contains_key(&edge.provider) {
                return Err(GraphError::UnresolvedReference {
                    consumer: edge.consumer.clone(),
                    provider: edge.provider.clone(),
                    key: edge.key.clone(),
                });
            }
            if !self.index.contains_key(&edge.consumer) {
                // Only grants can introduce an undeclared consumer.
                return Err(GraphError::UnknownPrincipal(edge.consumer.clone()));
            }
        }

        let n = self.resources.len();
        // providers[i]: distinct resources i depends on
        let mut providers: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut consumers: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for edge in &edges {
            let c = self.index[&edge.consumer];
            let p = self.index[&edge.provider];
            providers[c].insert(p);
            consumers[p].insert(c);
        }

        // Kahn's algorithm; the ready set is ordered by declaration index.
        let mut pending: Vec<usize> = providers.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &c in &consumers[next] {
                pending[c] -= 1;
                if pending[c] == 0 {
                    ready.insert(c);
                }
            }
        }

        if order.len() < n {
            let cycle = find_cycle(&providers, &pending)
                .into_iter()
                .map(|i| self.resources[i].name.clone())
                .collect();
            return Err(GraphError::Cycle { cycle });
        }

        let mut slots: Vec<Option<Resource>> = self.resources.into_iter().map(Some).collect();
        let resources = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        Ok(ProvisionPlan {
            resources,
            edges,
            grants: self.grants,
        })
    }
}

/// Every resource left with pending providers depends on at least one other
/// such resource, so walking those edges must revisit a node. The result
/// reads in "depends on" order and ends where it starts.
fn find_cycle(providers: &[BTreeSet<usize>], pending: &[usize]) -> Vec<usize> {
    let Some(start) = (0..pending.len()).find(|&i| pending[i] > 0) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = providers[current].iter().find(|&&p| pending[p] > 0) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&i| i == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

/// Resources in provisioning order, with the edges and grants between them.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    resources: Vec<Resource>,
    edges: Vec<DependencyEdge>,
    grants: Vec<Grant>,
}

impl ProvisionPlan {
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Resource names in provisioning order.
    pub fn order(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Edges the named resource needs satisfied before it can be created.
    pub fn dependencies_of<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a DependencyEdge> + 'a {
        self.edges.iter().filter(move |e| e.consumer == name)
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    /// Grants held by `principal`, in declaration order.
    pub fn grants_for<'a>(&'a self, principal: &'a str) -> impl Iterator<Item = &'a Grant> + 'a {
        self.grants.iter().filter(move |g| g.principal == principal)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
