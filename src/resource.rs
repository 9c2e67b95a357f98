//! Accounting for CPUs/GPUs/custom resources across nodes.
//!
//! A [`ResourcePool`] is the only shared mutable structure touched while a
//! session is executing; every mutation holds its lock for the duration of
//! the call. `acquire` never blocks — it either returns an allocation or
//! reports that nothing fits right now, leaving the decision of whether (and
//! when) to retry to the scheduler.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ResourceResult<T> = Result<T, ResourceError>;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("release of an allocation not currently held: node {node} type {kind} instance {instance}")]
    NotHeld {
        node: String,
        kind: String,
        instance: String,
    },
    #[error("request exceeds total pool capacity for resource type '{0}'")]
    ExceedsCapacity(String),
}

/// One instance of a typed resource on a node (e.g. a single GPU).
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInstance {
    pub id: String,
    pub slots: u32,
    available: u32,
}

impl ResourceInstance {
    pub fn new(id: impl Into<String>, slots: u32) -> Self {
        let id = id.into();
        Self {
            id,
            slots,
            available: slots,
        }
    }
}

/// A node in the pool: a set of typed resource instances.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    pub id: String,
    pub resources: HashMap<String, Vec<ResourceInstance>>,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resources: HashMap::new(),
        }
    }

    pub fn with_resource(mut self, kind: impl Into<String>, instances: Vec<ResourceInstance>) -> Self {
        self.resources.insert(kind.into(), instances);
        self
    }

    fn capacity(&self, kind: &str) -> u32 {
        self.resources
            .get(kind)
            .map(|v| v.iter().map(|i| i.slots).sum())
            .unwrap_or(0)
    }

    fn available(&self, kind: &str) -> u32 {
        self.resources
            .get(kind)
            .map(|v| v.iter().map(|i| i.available).sum())
            .unwrap_or(0)
    }
}

/// Whether a request must be satisfied from a single node or may span nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePolicy {
    #[default]
    Auto,
    SingleNode,
    AnyNode,
}

/// A request to acquire some slots of one or more resource types.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    pub counts: HashMap<String, u32>,
    pub node_count: Option<u32>,
    pub policy: NodePolicy,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, count: u32) -> Self {
        self.counts.insert(kind.into(), count);
        self
    }
}

/// One (node, resource type, instance, slots) grant held by a running case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub node_id: String,
    pub kind: String,
    pub instance_id: String,
    pub slots: u32,
}

/// The full set of grants backing one running case. Returned intact on
/// release.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub grants: Vec<Grant>,
}

pub enum AcquireOutcome {
    Granted(ResourceAllocation),
    NoFitNow,
}

pub struct ResourcePool {
    nodes: Mutex<Vec<ResourceNode>>,
}

impl ResourcePool {
    pub fn new(nodes: Vec<ResourceNode>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    /// Total capacity of a resource type across the whole pool.
    pub fn total(&self, kind: &str) -> u32 {
        self.nodes.lock().iter().map(|n| n.capacity(kind)).sum()
    }

    /// A read-only snapshot of per-node availability, for status reporting.
    pub fn snapshot(&self) -> Vec<ResourceNode> {
        self.nodes.lock().clone()
    }

    /// Attempt to acquire `request`. Never partially succeeds.
    pub fn acquire(&self, request: &ResourceRequest) -> ResourceResult<AcquireOutcome> {
        for (kind, &count) in &request.counts {
            if count > self.total(kind) {
                return Err(ResourceError::ExceedsCapacity(kind.clone()));
            }
        }

        let mut nodes = self.nodes.lock();

        let single_node = match request.policy {
            NodePolicy::SingleNode => true,
            NodePolicy::AnyNode => false,
            NodePolicy::Auto => request.node_count.unwrap_or(1) <= 1,
        };

        if single_node {
            if let Some(grants) = try_single_node(&mut nodes, request) {
                return Ok(AcquireOutcome::Granted(ResourceAllocation { grants }));
            }
            if request.policy == NodePolicy::SingleNode {
                return Ok(AcquireOutcome::NoFitNow);
            }
        }

        match try_spanning(&mut nodes, request) {
            Some(grants) => Ok(AcquireOutcome::Granted(ResourceAllocation { grants })),
            None => Ok(AcquireOutcome::NoFitNow),
        }
    }

    /// Return a previously granted allocation's slots to the pool.
    pub fn release(&self, allocation: &ResourceAllocation) -> ResourceResult<()> {
        let mut nodes = self.nodes.lock();
        for grant in &allocation.grants {
            let node = nodes
                .iter_mut()
                .find(|n| n.id == grant.node_id)
                .ok_or_else(|| ResourceError::NotHeld {
                    node: grant.node_id.clone(),
                    kind: grant.kind.clone(),
                    instance: grant.instance_id.clone(),
                })?;
            let instance = node
                .resources
                .get_mut(&grant.kind)
                .and_then(|v| v.iter_mut().find(|i| i.id == grant.instance_id))
                .ok_or_else(|| ResourceError::NotHeld {
                    node: grant.node_id.clone(),
                    kind: grant.kind.clone(),
                    instance: grant.instance_id.clone(),
                })?;
            instance.available = (instance.available + grant.slots).min(instance.slots);
        }
        Ok(())
    }
}

/// Try to satisfy the whole request from one node, packing onto the fewest
/// instances and breaking ties by ascending instance id.
fn try_single_node(nodes: &mut [ResourceNode], request: &ResourceRequest) -> Option<Vec<Grant>> {
    let candidate = nodes
        .iter()
        .enumerate()
        .find(|(_, n)| {
            request
                .counts
                .iter()
                .all(|(kind, &count)| n.available(kind) >= count)
        })
        .map(|(i, _)| i)?;

    let node = &mut nodes[candidate];
    let mut grants = Vec::new();
    for (kind, &count) in &request.counts {
        if count == 0 {
            continue;
        }
        grants.extend(take_from_node(node, kind, count)?);
    }
    Some(grants)
}

/// Greedily accumulate capacity across nodes (ascending id) until the
/// request is satisfied.
fn try_spanning(nodes: &mut [ResourceNode], request: &ResourceRequest) -> Option<Vec<Grant>> {
    let mut remaining = request.counts.clone();
    let mut grants = Vec::new();

    for node in nodes.iter_mut() {
        if remaining.values().all(|&v| v == 0) {
            break;
        }
        for (kind, need) in remaining.iter_mut() {
            if *need == 0 {
                continue;
            }
            let take = (*need).min(node.available(kind));
            if take > 0 {
                if let Some(g) = take_from_node(node, kind, take) {
                    grants.extend(g);
                    *need -= take;
                }
            }
        }
    }

    if remaining.values().all(|&v| v == 0) {
        Some(grants)
    } else {
        // Roll back whatever we provisionally took.
        for grant in &grants {
            if let Some(instance) = node_instance_mut(nodes, &grant.node_id, &grant.kind, &grant.instance_id) {
                instance.available += grant.slots;
            }
        }
        None
    }
}

fn take_from_node(node: &mut ResourceNode, kind: &str, mut need: u32) -> Option<Vec<Grant>> {
    let instances = node.resources.get_mut(kind)?;
    instances.sort_by(|a, b| a.id.cmp(&b.id));
    let mut grants = Vec::new();
    for instance in instances.iter_mut() {
        if need == 0 {
            break;
        }
        let take = need.min(instance.available);
        if take > 0 {
            instance.available -= take;
            grants.push(Grant {
                node_id: node.id.clone(),
                kind: kind.to_string(),
                instance_id: instance.id.clone(),
                slots: take,
            });
            need -= take;
        }
    }
    if need == 0 { Some(grants) } else { None }
}

fn node_instance_mut<'a>(
    nodes: &'a mut [ResourceNode],
    node_id: &str,
    kind: &str,
    instance_id: &str,
) -> Option<&'a mut ResourceInstance> {
    nodes
        .iter_mut()
        .find(|n| n.id == node_id)?
        .resources
        .get_mut(kind)?
        .iter_mut()
        .find(|i| i.id == instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_pool() -> ResourcePool {
        ResourcePool::new(vec![
            ResourceNode::new("0").with_resource(
                "cpus",
                vec![ResourceInstance::new("0", 4)],
            ),
            ResourceNode::new("1").with_resource(
                "cpus",
                vec![ResourceInstance::new("0", 2)],
            ),
        ])
    }

    #[test]
    fn acquire_fits_on_single_node() {
        let pool = two_node_pool();
        let req = ResourceRequest::new().with("cpus", 3);
        match pool.acquire(&req).unwrap() {
            AcquireOutcome::Granted(alloc) => {
                assert_eq!(alloc.grants.len(), 1);
                assert_eq!(alloc.grants[0].node_id, "0");
            }
            AcquireOutcome::NoFitNow => panic!("expected a fit"),
        }
    }

    #[test]
    fn acquire_respects_capacity_and_releases() {
        let pool = two_node_pool();
        let req = ResourceRequest::new().with("cpus", 4);
        let alloc = match pool.acquire(&req).unwrap() {
            AcquireOutcome::Granted(a) => a,
            AcquireOutcome::NoFitNow => panic!("expected a fit"),
        };
        assert_eq!(pool.total("cpus"), 6);

        // Pool is now fully consumed on node 0; a second request for node 0's
        // capacity has no fit until release.
        let req2 = ResourceRequest::new().with("cpus", 1).with("cpus", 1);
        let _ = req2;
        let req_more = ResourceRequest::new().with("cpus", 5);
        assert!(matches!(
            pool.acquire(&req_more).unwrap(),
            AcquireOutcome::NoFitNow
        ));

        pool.release(&alloc).unwrap();
        assert!(matches!(
            pool.acquire(&ResourceRequest::new().with("cpus", 4)).unwrap(),
            AcquireOutcome::Granted(_)
        ));
    }

    #[test]
    fn acquire_exceeding_total_capacity_is_an_error() {
        let pool = two_node_pool();
        let req = ResourceRequest::new().with("cpus", 100);
        assert!(matches!(
            pool.acquire(&req),
            Err(ResourceError::ExceedsCapacity(ref k)) if k == "cpus"
        ));
    }

    #[test]
    fn release_of_unheld_allocation_errors() {
        let pool = two_node_pool();
        let bogus = ResourceAllocation {
            grants: vec![Grant {
                node_id: "9".into(),
                kind: "cpus".into(),
                instance_id: "0".into(),
                slots: 1,
            }],
        };
        assert!(pool.release(&bogus).is_err());
    }

    #[test]
    fn spanning_combines_multiple_nodes() {
        let pool = two_node_pool();
        let req = ResourceRequest {
            counts: HashMap::from([("cpus".to_string(), 6)]),
            node_count: Some(2),
            policy: NodePolicy::Auto,
        };
        match pool.acquire(&req).unwrap() {
            AcquireOutcome::Granted(alloc) => {
                let nodes: std::collections::HashSet<_> =
                    alloc.grants.iter().map(|g| g.node_id.clone()).collect();
                assert_eq!(nodes.len(), 2);
            }
            AcquireOutcome::NoFitNow => panic!("expected spanning fit"),
        }
    }
}
