use crate::profile::ConnectionProfile;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_HISTORY_CAPACITY: usize = 60;

pub type SharedFleet = Arc<RwLock<FleetState>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceleratorSample {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    pub utilization_percent: f64,
    pub memory_utilization_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub temperature_celsius: f64,
    pub power_draw_watts: f64,
    pub power_limit_watts: f64,
}

impl AcceleratorSample {
    pub fn memory_used_percent(&self) -> f64 {
        percent(self.memory_used_mb, self.memory_total_mb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: String,
    pub user: String,
    pub command: String,
    pub accelerator_index: Option<u32>,
    pub memory_used_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub node_id: Uuid,
    pub connected: bool,
    pub timestamp_unix: i64,
    pub error: Option<String>,
    pub cpu_usage_percent: f64,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub accelerators: Vec<AcceleratorSample>,
    pub processes: Vec<ProcessSample>,
}

impl NodeSnapshot {
    pub fn empty(node_id: Uuid, timestamp_unix: i64) -> Self {
        Self {
            node_id,
            connected: false,
            timestamp_unix,
            error: None,
            cpu_usage_percent: 0.0,
            ram_used_gb: 0.0,
            ram_total_gb: 0.0,
            accelerators: Vec::new(),
            processes: Vec::new(),
        }
    }

    pub fn ram_used_percent(&self) -> f64 {
        percent(self.ram_used_gb, self.ram_total_gb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp_unix: i64,
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    pub accelerator_utilization: BTreeMap<u32, f64>,
}

impl HistoryPoint {
    pub fn from_snapshot(snapshot: &NodeSnapshot) -> Self {
        Self {
            timestamp_unix: snapshot.timestamp_unix,
            cpu_usage_percent: snapshot.cpu_usage_percent,
            ram_usage_percent: snapshot.ram_used_percent(),
            accelerator_utilization: snapshot
                .accelerators
                .iter()
                .map(|a| (a.index, a.utilization_percent))
                .collect(),
        }
    }
}

/// Bounded FIFO of history points; the oldest point is evicted first.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Unknown,
    Connected,
    Errored,
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub profile: ConnectionProfile,
    pub generation: u64,
    pub status: NodeStatus,
    pub snapshot: Option<NodeSnapshot>,
    pub history: HistoryBuffer,
    pub last_poll_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Decoded(NodeSnapshot),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Applied {
        name: String,
        previous: NodeStatus,
        status: NodeStatus,
    },
    /// The node was removed (or re-registered) while its poll was running.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: Uuid,
    pub generation: u64,
    pub added: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FleetState {
    pub started_at_unix: i64,
    pub last_cycle_unix: i64,
    pub interval_secs: u64,
    pub history_capacity: usize,
    nodes: BTreeMap<Uuid, NodeEntry>,
    next_generation: u64,
}

impl FleetState {
    pub fn new(now_unix: i64, interval_secs: u64, history_capacity: usize) -> Self {
        Self {
            started_at_unix: now_unix,
            interval_secs,
            history_capacity,
            ..Self::default()
        }
    }

    /// Adds a node, or replaces the profile of an existing one while keeping
    /// its snapshot and history.
    pub fn upsert_profile(&mut self, profile: ConnectionProfile) -> Registration {
        let id = profile.id;
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.profile = profile;
            return Registration {
                id,
                generation: entry.generation,
                added: false,
            };
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.nodes.insert(
            id,
            NodeEntry {
                profile,
                generation,
                status: NodeStatus::Unknown,
                snapshot: None,
                history: HistoryBuffer::new(self.history_capacity),
                last_poll_ms: None,
            },
        );
        Registration {
            id,
            generation,
            added: true,
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Option<NodeEntry> {
        self.nodes.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> Vec<&NodeEntry> {
        let mut nodes: Vec<&NodeEntry> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.generation);
        nodes
    }

    pub fn connected_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Connected)
            .count()
    }

    pub fn targets(&self) -> Vec<(ConnectionProfile, u64)> {
        self.nodes()
            .into_iter()
            .map(|n| (n.profile.clone(), n.generation))
            .collect()
    }

    pub fn apply_outcome(
        &mut self,
        id: Uuid,
        generation: u64,
        now_unix: i64,
        elapsed_ms: u64,
        outcome: NodeOutcome,
    ) -> ApplyResult {
        let Some(entry) = self.nodes.get_mut(&id) else {
            return ApplyResult::Discarded;
        };
        if entry.generation != generation {
            return ApplyResult::Discarded;
        }

        let previous = entry.status;
        entry.last_poll_ms = Some(elapsed_ms);
        match outcome {
            NodeOutcome::Decoded(mut snapshot) => {
                snapshot.node_id = id;
                snapshot.connected = true;
                snapshot.error = None;
                snapshot.timestamp_unix = now_unix;
                entry.history.push(HistoryPoint::from_snapshot(&snapshot));
                entry.snapshot = Some(snapshot);
                entry.status = NodeStatus::Connected;
            }
            NodeOutcome::Failed(message) => {
                let mut snapshot = NodeSnapshot::empty(id, now_unix);
                snapshot.error = Some(message);
                entry.history.push(HistoryPoint::from_snapshot(&snapshot));
                entry.snapshot = Some(snapshot);
                entry.status = NodeStatus::Errored;
            }
        }

        ApplyResult::Applied {
            name: entry.profile.display_name().to_string(),
            previous,
            status: entry.status,
        }
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn percent(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        (used / total) * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64) -> HistoryPoint {
        HistoryPoint {
            timestamp_unix: ts,
            cpu_usage_percent: ts as f64,
            ram_usage_percent: 0.0,
            accelerator_utilization: BTreeMap::new(),
        }
    }

    fn snapshot_with_gpu(util: f64) -> NodeSnapshot {
        let mut snapshot = NodeSnapshot::empty(Uuid::nil(), 0);
        snapshot.cpu_usage_percent = 12.5;
        snapshot.ram_used_gb = 8.0;
        snapshot.ram_total_gb = 32.0;
        snapshot.accelerators.push(AcceleratorSample {
            index: 0,
            uuid: "GPU-a".to_string(),
            name: "A100".to_string(),
            utilization_percent: util,
            memory_utilization_percent: 10.0,
            memory_used_mb: 1000.0,
            memory_total_mb: 0.0,
            temperature_celsius: 50.0,
            power_draw_watts: 100.0,
            power_limit_watts: 400.0,
        });
        snapshot
    }

    #[test]
    fn history_buffer_evicts_oldest_on_overflow() {
        let mut history = HistoryBuffer::new(DEFAULT_HISTORY_CAPACITY);
        for ts in 0..=DEFAULT_HISTORY_CAPACITY as i64 {
            history.push(point(ts));
        }
        assert_eq!(history.len(), DEFAULT_HISTORY_CAPACITY);
        assert_eq!(history.iter().next().map(|p| p.timestamp_unix), Some(1));
        assert_eq!(
            history.iter().last().map(|p| p.timestamp_unix),
            Some(DEFAULT_HISTORY_CAPACITY as i64)
        );
    }

    #[test]
    fn zero_totals_give_zero_percent() {
        let snapshot = snapshot_with_gpu(40.0);
        let gpu = &snapshot.accelerators[0];
        assert_eq!(gpu.memory_used_percent(), 0.0);
        assert!(gpu.memory_used_percent().is_finite());

        let empty = NodeSnapshot::empty(Uuid::nil(), 0);
        assert_eq!(empty.ram_used_percent(), 0.0);
    }

    #[test]
    fn decoded_outcome_appends_history_point() {
        let mut fleet = FleetState::new(0, 3, DEFAULT_HISTORY_CAPACITY);
        let profile = ConnectionProfile::new("gpu-01", "10.0.0.1", "ml");
        let reg = fleet.upsert_profile(profile);
        assert!(reg.added);

        let result = fleet.apply_outcome(
            reg.id,
            reg.generation,
            100,
            12,
            NodeOutcome::Decoded(snapshot_with_gpu(40.0)),
        );
        assert_eq!(
            result,
            ApplyResult::Applied {
                name: "gpu-01".to_string(),
                previous: NodeStatus::Unknown,
                status: NodeStatus::Connected,
            }
        );

        let entry = fleet.get(reg.id).expect("entry");
        let snapshot = entry.snapshot.as_ref().expect("snapshot");
        assert!(snapshot.connected);
        assert_eq!(snapshot.node_id, reg.id);
        assert_eq!(snapshot.timestamp_unix, 100);

        let latest = entry.history.iter().last().expect("history point");
        assert_eq!(latest.cpu_usage_percent, 12.5);
        assert_eq!(latest.ram_usage_percent, 25.0);
        assert_eq!(latest.accelerator_utilization.get(&0), Some(&40.0));
    }

    #[test]
    fn failure_replaces_snapshot_and_records_zero_point() {
        let mut fleet = FleetState::new(0, 3, DEFAULT_HISTORY_CAPACITY);
        let reg = fleet.upsert_profile(ConnectionProfile::new("gpu-01", "10.0.0.1", "ml"));
        fleet.apply_outcome(
            reg.id,
            reg.generation,
            100,
            5,
            NodeOutcome::Decoded(snapshot_with_gpu(40.0)),
        );
        fleet.apply_outcome(
            reg.id,
            reg.generation,
            103,
            5,
            NodeOutcome::Failed("connection refused".to_string()),
        );

        let entry = fleet.get(reg.id).expect("entry");
        assert_eq!(entry.status, NodeStatus::Errored);
        let snapshot = entry.snapshot.as_ref().expect("snapshot");
        assert!(!snapshot.connected);
        assert_eq!(snapshot.error.as_deref(), Some("connection refused"));
        assert_eq!(snapshot.cpu_usage_percent, 0.0);
        assert!(snapshot.accelerators.is_empty());
        assert_eq!(snapshot.timestamp_unix, 103);

        let points: Vec<&HistoryPoint> = entry.history.iter().collect();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].timestamp_unix, 103);
        assert_eq!(points[1].cpu_usage_percent, 0.0);
        assert!(points[1].accelerator_utilization.is_empty());
    }

    #[test]
    fn outcome_for_removed_or_reregistered_node_is_discarded() {
        let mut fleet = FleetState::new(0, 3, DEFAULT_HISTORY_CAPACITY);
        let profile = ConnectionProfile::new("gpu-01", "10.0.0.1", "ml");
        let reg = fleet.upsert_profile(profile.clone());
        fleet.remove(reg.id);

        let result = fleet.apply_outcome(
            reg.id,
            reg.generation,
            100,
            5,
            NodeOutcome::Decoded(snapshot_with_gpu(1.0)),
        );
        assert_eq!(result, ApplyResult::Discarded);
        assert!(fleet.get(reg.id).is_none());

        let again = fleet.upsert_profile(profile);
        assert_ne!(again.generation, reg.generation);
        let result = fleet.apply_outcome(
            reg.id,
            reg.generation,
            100,
            5,
            NodeOutcome::Decoded(snapshot_with_gpu(1.0)),
        );
        assert_eq!(result, ApplyResult::Discarded);
        assert!(fleet.get(reg.id).and_then(|e| e.snapshot.as_ref()).is_none());
    }

    #[test]
    fn profile_update_keeps_history() {
        let mut fleet = FleetState::new(0, 3, DEFAULT_HISTORY_CAPACITY);
        let mut profile = ConnectionProfile::new("gpu-01", "10.0.0.1", "ml");
        let reg = fleet.upsert_profile(profile.clone());
        fleet.apply_outcome(
            reg.id,
            reg.generation,
            100,
            5,
            NodeOutcome::Decoded(snapshot_with_gpu(40.0)),
        );

        profile.port = 2222;
        let update = fleet.upsert_profile(profile);
        assert!(!update.added);
        assert_eq!(update.generation, reg.generation);

        let entry = fleet.get(reg.id).expect("entry");
        assert_eq!(entry.profile.port, 2222);
        assert_eq!(entry.history.len(), 1);
    }
}
