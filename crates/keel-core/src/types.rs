//! Shared types used across Keel crates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a task.
pub type TaskId = String;

/// Identifier of a host known to the resource manager.
pub type HostId = String;

/// Identifier of a single resource offer.
pub type OfferId = String;

/// Attribute labels attached to a host: name → set of values.
pub type AttributeMap = BTreeMap<String, BTreeSet<String>>;

// ── Jobs ───────────────────────────────────────────────────────────

/// Identity of a job: `{role}/{environment}/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub role: String,
    pub environment: String,
    pub name: String,
}

impl JobKey {
    pub fn new(role: &str, environment: &str, name: &str) -> Self {
        Self {
            role: role.to_string(),
            environment: environment.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.role, self.environment, self.name)
    }
}

/// How a job turns into pending tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Tasks are created as soon as the job is received.
    Immediate,
    /// Tasks are created each time the schedule fires.
    Cron {
        schedule: String,
        #[serde(default)]
        collision: CronCollisionPolicy,
    },
}

/// What a cron run does when the previous run still has active tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronCollisionPolicy {
    /// Kill the running tasks, launch the new run once they are gone.
    #[default]
    KillExisting,
    /// Skip the new run.
    CancelNew,
    /// Launch the new run alongside the old one.
    RunOverlap,
}

/// A job definition handed to the job managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub key: JobKey,
    pub kind: JobKind,
    pub task: TaskConfig,
    /// Number of task instances per run.
    pub instances: u32,
}

// ── Resources and constraints ─────────────────────────────────────

/// A resource vector, used both for task requests and offer capacity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    /// Number of ports.
    pub ports: u32,
}

impl Resources {
    pub fn new(cpus: f64, ram_mb: u64, disk_mb: u64, ports: u32) -> Self {
        Self {
            cpus,
            ram_mb,
            disk_mb,
            ports,
        }
    }

    /// Whether `request` fits entirely within these resources.
    pub fn contains(&self, request: &Resources) -> bool {
        self.cpus >= request.cpus
            && self.ram_mb >= request.ram_mb
            && self.disk_mb >= request.disk_mb
            && self.ports >= request.ports
    }
}

/// A placement constraint on a named host attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub attribute: String,
    pub kind: ConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// The host attribute must (or, negated, must not) carry one of `values`.
    Value {
        #[serde(default)]
        negated: bool,
        values: BTreeSet<String>,
    },
    /// At most `limit` active tasks of the same job may share an attribute value.
    Limit { limit: u32 },
}

impl Constraint {
    pub fn value(attribute: &str, values: &[&str]) -> Self {
        Self {
            attribute: attribute.to_string(),
            kind: ConstraintKind::Value {
                negated: false,
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        }
    }

    pub fn not_value(attribute: &str, values: &[&str]) -> Self {
        Self {
            attribute: attribute.to_string(),
            kind: ConstraintKind::Value {
                negated: true,
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        }
    }

    pub fn limit(attribute: &str, limit: u32) -> Self {
        Self {
            attribute: attribute.to_string(),
            kind: ConstraintKind::Limit { limit },
        }
    }
}

/// What a task needs and how it is run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub resources: Resources,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Failures tolerated before the task is no longer rescheduled.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Command line handed to the executor.
    #[serde(default)]
    pub command: String,
}

fn default_max_failures() -> u32 {
    1
}

impl TaskConfig {
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            constraints: Vec::new(),
            priority: 0,
            max_failures: default_max_failures(),
            command: String::new(),
        }
    }
}

// ── Task lifecycle ────────────────────────────────────────────────

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Assigned,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Restarting,
}

impl TaskState {
    pub const ALL: [TaskState; 9] = [
        TaskState::Pending,
        TaskState::Assigned,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Finished,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Lost,
        TaskState::Restarting,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// Whether a task in this state occupies (or is about to occupy) a host.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::Assigned | TaskState::Starting | TaskState::Running | TaskState::Restarting
        )
    }

    /// The static transition table.
    pub fn can_transition_to(self, target: TaskState) -> bool {
        use TaskState::*;
        match self {
            Pending => matches!(target, Assigned | Killed | Lost),
            Assigned => matches!(
                target,
                Starting | Running | Finished | Failed | Killed | Lost | Restarting
            ),
            Starting => matches!(
                target,
                Running | Finished | Failed | Killed | Lost | Restarting
            ),
            Running => matches!(target, Finished | Failed | Killed | Lost | Restarting),
            Restarting => matches!(target, Finished | Failed | Killed | Lost),
            Finished | Failed | Killed | Lost => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Starting => "STARTING",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Lost => "LOST",
            TaskState::Restarting => "RESTARTING",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a transition against the table, treating `None` as "no such task yet".
///
/// `∅ → PENDING` is the only way a task enters the table.
pub fn is_valid_transition(from: Option<TaskState>, to: TaskState) -> bool {
    match from {
        None => to == TaskState::Pending,
        Some(from) => from.can_transition_to(to),
    }
}

/// One entry in a task's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub state: TaskState,
    pub message: String,
}

/// The scheduler's record of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job: JobKey,
    pub instance: u32,
    pub state: TaskState,
    pub assigned_host: Option<HostId>,
    pub config: TaskConfig,
    pub failure_count: u32,
    pub history: Vec<TaskEvent>,
    /// Storage version, bumped on every durable commit.
    pub version: u64,
    /// Epoch milliseconds after which a terminal task may be pruned.
    pub retain_until: Option<u64>,
}

impl Task {
    /// Timestamp of the most recent transition.
    pub fn last_transition_at(&self) -> u64 {
        self.history.last().map(|e| e.timestamp).unwrap_or_default()
    }
}

// ── Offers and hosts ──────────────────────────────────────────────

/// Capacity offered by the resource manager on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub host: HostId,
    pub resources: Resources,
    #[serde(default)]
    pub attributes: AttributeMap,
}

/// Maintenance state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceMode {
    #[default]
    None,
    Scheduled,
    Draining,
    Drained,
}

impl MaintenanceMode {
    /// `NONE → SCHEDULED → DRAINING → DRAINED`; any mode may return to `NONE`.
    pub fn can_transition_to(self, target: MaintenanceMode) -> bool {
        use MaintenanceMode::*;
        match (self, target) {
            (None, Scheduled) | (Scheduled, Draining) | (Draining, Drained) => true,
            (Scheduled | Draining | Drained, None) => true,
            _ => false,
        }
    }

    /// Whether new work must be kept off the host.
    pub fn blocks_scheduling(self) -> bool {
        matches!(self, MaintenanceMode::Draining | MaintenanceMode::Drained)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceMode::None => "NONE",
            MaintenanceMode::Scheduled => "SCHEDULED",
            MaintenanceMode::Draining => "DRAINING",
            MaintenanceMode::Drained => "DRAINED",
        }
    }
}

impl fmt::Display for MaintenanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels and maintenance mode for a host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostAttributes {
    pub host: HostId,
    pub attributes: AttributeMap,
    pub mode: MaintenanceMode,
}

impl HostAttributes {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            attributes: AttributeMap::new(),
            mode: MaintenanceMode::None,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .entry(name.to_string())
            .or_default()
            .insert(value.to_string());
        self
    }

    /// Values of a named attribute. The pseudo-attribute `host` resolves to the host id.
    pub fn values(&self, name: &str) -> BTreeSet<String> {
        if name == "host" {
            return BTreeSet::from([self.host.clone()]);
        }
        self.attributes.get(name).cloned().unwrap_or_default()
    }
}
