//! Master-side registry of known nodes

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use super::{Heartbeat, NodeInfo, NodeRole, NodeStatus};
use crate::{Result, ScanError};

/// Node table shared by the heartbeat listener, health checker and dispatcher
#[derive(Default)]
pub struct ClusterRegistry {
    nodes: RwLock<HashMap<String, NodeInfo>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, NodeInfo>> {
        match self.nodes.read() {
            Ok(nodes) => nodes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, NodeInfo>> {
        match self.nodes.write() {
            Ok(nodes) => nodes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or refresh a node. Returns true when the node is new or back from offline.
    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) -> bool {
        let info = NodeInfo::from_heartbeat(heartbeat);
        let mut nodes = self.write();
        let previous = nodes.insert(info.id.clone(), info);

        match previous {
            None => {
                log::info!(
                    "node registered node={} role={} address={}",
                    heartbeat.node_id,
                    heartbeat.role,
                    heartbeat.address
                );
                true
            }
            Some(old) if old.status == NodeStatus::Offline && heartbeat.status.is_healthy() => {
                log::info!("node back online node={}", heartbeat.node_id);
                true
            }
            Some(_) => false,
        }
    }

    /// Returns true if the node was healthy before
    pub fn mark_offline(&self, node_id: &str) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(node_id) {
            Some(node) if node.status.is_healthy() => {
                node.status = NodeStatus::Offline;
                node.load = 0.0;
                node.active_jobs = 0;
                log::warn!("node offline node={}", node_id);
                true
            }
            _ => false,
        }
    }

    /// Mark every healthy node silent for longer than `timeout` offline and return their ids
    pub fn expire_stale(&self, timeout: Duration) -> Vec<String> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let now = Utc::now();
        let mut expired = Vec::new();

        let mut nodes = self.write();
        for node in nodes.values_mut() {
            if node.status.is_healthy() && now.signed_duration_since(node.last_heartbeat) > timeout {
                node.status = NodeStatus::Offline;
                node.load = 0.0;
                node.active_jobs = 0;
                log::warn!(
                    "node missed heartbeats node={} last_heartbeat={}",
                    node.id,
                    node.last_heartbeat.to_rfc3339()
                );
                expired.push(node.id.clone());
            }
        }
        expired
    }

    /// Healthy worker nodes
    pub fn online_nodes(&self) -> Vec<NodeInfo> {
        self.read()
            .values()
            .filter(|node| node.role == NodeRole::Worker && node.status.is_healthy())
            .cloned()
            .collect()
    }

    /// Pick the healthy worker with the lowest `outstanding / capacity` that still has room.
    ///
    /// `Err(NoHealthyNode)` when no worker is healthy; `Ok(None)` when all are at their window.
    pub fn select_least_loaded<F>(&self, outstanding: F) -> Result<Option<String>>
    where
        F: Fn(&str) -> usize,
    {
        let nodes = self.online_nodes();
        if nodes.is_empty() {
            return Err(ScanError::NoHealthyNode);
        }

        let best = nodes
            .iter()
            .filter_map(|node| {
                let pending = outstanding(&node.id);
                (pending < node.max_pending).then(|| (pending as f64 / node.capacity as f64, &node.id))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, id)| id.clone());
        Ok(best)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.read().get(node_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn remove(&self, node_id: &str) -> Option<NodeInfo> {
        self.write().remove(node_id)
    }
}
