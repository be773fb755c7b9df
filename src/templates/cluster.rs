// src/templates/cluster.rs
//! Request clustering: templates whose request blocks would produce
//! byte-identical requests are coalesced into one execution unit, so the
//! network sees a single request while every member's matcher set runs
//! against the shared response.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::model::Template;

/// What the engine schedules: a lone template or a coalesced cluster
#[derive(Debug, Clone)]
pub enum ExecutionUnit {
    Single(Arc<Template>),
    Cluster(Vec<Arc<Template>>),
}

impl ExecutionUnit {
    pub fn templates(&self) -> &[Arc<Template>] {
        match self {
            ExecutionUnit::Single(t) => std::slice::from_ref(t),
            ExecutionUnit::Cluster(ts) => ts,
        }
    }

    /// The template whose request block is actually issued
    pub fn representative(&self) -> &Arc<Template> {
        match self {
            ExecutionUnit::Single(t) => t,
            ExecutionUnit::Cluster(ts) => &ts[0],
        }
    }

    pub fn len(&self) -> usize {
        self.templates().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates().is_empty()
    }
}

/// Fingerprint of the request bytes a template would emit, when the
/// template is clusterable. Clustering requires exactly one HTTP request
/// block with no payloads; anything else executes standalone.
pub fn cluster_key(template: &Template) -> Option<String> {
    if template.disable_clustering || template.self_contained {
        return None;
    }
    if !template.dns.is_empty() || !template.network.is_empty() {
        return None;
    }
    if template.http.len() != 1 {
        return None;
    }

    let request = &template.http[0];
    if !request.payloads.is_empty() {
        return None;
    }
    // Cluster execution issues exactly one request
    if request.path.len() != 1 {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(request.method.as_bytes());
    for path in &request.path {
        hasher.update(b"\x00");
        hasher.update(path.as_bytes());
    }
    let mut headers: Vec<_> = request.headers.iter().collect();
    headers.sort();
    for (key, value) in headers {
        hasher.update(b"\x00");
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }
    if let Some(body) = &request.body {
        hasher.update(b"\x00");
        hasher.update(body.as_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// Group templates into execution units. Order within the result follows
/// the input order of each unit's first member.
pub fn cluster(templates: Vec<Arc<Template>>) -> Vec<ExecutionUnit> {
    let mut buckets: HashMap<String, Vec<Arc<Template>>> = HashMap::new();
    let mut order: Vec<UnitSlot> = Vec::new();

    enum UnitSlot {
        Single(Arc<Template>),
        ClusterRef(String),
    }

    for template in templates {
        match cluster_key(&template) {
            Some(key) => {
                let bucket = buckets.entry(key.clone()).or_default();
                if bucket.is_empty() {
                    order.push(UnitSlot::ClusterRef(key));
                }
                bucket.push(template);
            }
            None => order.push(UnitSlot::Single(template)),
        }
    }

    let mut units = Vec::with_capacity(order.len());
    let mut clustered = 0usize;
    for slot in order {
        match slot {
            UnitSlot::Single(t) => units.push(ExecutionUnit::Single(t)),
            UnitSlot::ClusterRef(key) => {
                let mut members = buckets.remove(&key).unwrap_or_default();
                if members.len() == 1 {
                    units.push(ExecutionUnit::Single(members.pop().expect("one member")));
                } else {
                    clustered += members.len();
                    units.push(ExecutionUnit::Cluster(members));
                }
            }
        }
    }

    if clustered > 0 {
        debug!(
            "clustered {} templates into {} units",
            clustered,
            units.len()
        );
    }
    units
}
