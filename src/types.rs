//! Core identifiers and enums for the task subsystem
//!
//! NewType wrappers and closed enums shared by every module:
//! execution ids, task ids, status values, component kinds,
//! fan-out strategies, and memory operations.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// ============================================================================
// TASK EXECUTION ID
// ============================================================================

/// Identity of one task execution (ULID, sortable by mint time)
///
/// Primary key for both the state store and the per-execution config store.
/// Minted once by create_state and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskExecId(Ulid);

impl TaskExecId {
    /// Mint a fresh execution id
    pub fn mint() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for TaskExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskExecId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

// ============================================================================
// TASK ID
// ============================================================================

/// Strongly-typed authored task identifier
///
/// Guarantees (enforced on construction and deserialization):
/// - Non-empty after trimming
/// - Maximum 256 characters
///
/// Collection children carry derived ids of the form `parent.item[3]`,
/// so brackets and dots are allowed here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Maximum allowed length
    pub const MAX_LENGTH: usize = 256;

    /// Create a new TaskId with validation
    pub fn new(id: impl AsRef<str>) -> Result<Self, TaskIdError> {
        let id = id.as_ref().trim();

        if id.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(TaskIdError::TooLong(id.len()));
        }

        Ok(TaskId(id.to_string()))
    }

    /// Derived id for a collection item child
    pub fn item_child(&self, index: usize) -> TaskId {
        TaskId(format!("{}.item[{}]", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = TaskIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        TaskId::new(s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskIdError {
    #[error("task id cannot be empty")]
    Empty,
    #[error("task id too long ({0} > {})", TaskId::MAX_LENGTH)]
    TooLong(usize),
}

// ============================================================================
// STATUS
// ============================================================================

/// Execution status of a task state
///
/// `pending → running → {waiting ↔ running}* → {success | failed | canceled}`.
/// Terminal states are sticky; the store write path rejects any write that
/// would leave one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Waiting,
    Success,
    Failed,
    Canceled,
}

impl Status {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Canceled)
    }

    /// Whether a transition from `self` to `next` is legal
    pub fn can_transition_to(&self, next: Status) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            // terminal is sticky
            (s, _) if s.is_terminal() => false,
            // external cancel from any non-terminal state
            (_, Status::Canceled) => true,
            (Status::Pending, Status::Running) => true,
            // execute start is implicit; a fast activity may complete (or a
            // wait task park) before the running write lands
            (Status::Pending, Status::Success | Status::Failed | Status::Waiting) => true,
            // waiting is only reachable through dispatch (wait tasks)
            (Status::Running, Status::Waiting) => true,
            (Status::Waiting, Status::Running) => true,
            (Status::Running, Status::Success | Status::Failed) => true,
            // runtime timers may fail a waiting task directly
            (Status::Waiting, Status::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Waiting => "waiting",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// COMPONENT / EXECUTION TYPE
// ============================================================================

/// Which component executes a task
///
/// A config binds at most one of agent/tool; neither means the task is a
/// pure orchestrator (parent containers, wait, memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Task,
    Agent,
    Tool,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Task => "task",
            Component::Agent => "agent",
            Component::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// How the state machine drives a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Basic,
    Parallel,
    Collection,
    Composite,
}

impl ExecutionType {
    /// Container types materialize child states
    pub fn can_have_children(&self) -> bool {
        matches!(
            self,
            ExecutionType::Parallel | ExecutionType::Collection | ExecutionType::Composite
        )
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionType::Basic => "basic",
            ExecutionType::Parallel => "parallel",
            ExecutionType::Collection => "collection",
            ExecutionType::Composite => "composite",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// FAN-OUT STRATEGY / COLLECTION MODE
// ============================================================================

/// Completion rule for a parallel parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Success iff all children succeed; never short-circuits
    #[default]
    WaitAll,
    /// Fail the parent on the first child failure
    FailFast,
    /// Success if at least one child succeeds
    BestEffort,
    /// First terminal child wins; siblings are canceled
    Race,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::WaitAll => "wait_all",
            Strategy::FailFast => "fail_fast",
            Strategy::BestEffort => "best_effort",
            Strategy::Race => "race",
        };
        write!(f, "{s}")
    }
}

/// Child scheduling for a collection parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    #[default]
    Parallel,
    Sequential,
}

// ============================================================================
// MEMORY OPERATIONS
// ============================================================================

/// Operations dispatched by the memory driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOp {
    Read,
    Write,
    Append,
    Delete,
    Flush,
    Health,
    Clear,
    Stats,
}

impl fmt::Display for MemoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryOp::Read => "read",
            MemoryOp::Write => "write",
            MemoryOp::Append => "append",
            MemoryOp::Delete => "delete",
            MemoryOp::Flush => "flush",
            MemoryOp::Health => "health",
            MemoryOp::Clear => "clear",
            MemoryOp::Stats => "stats",
        };
        write!(f, "{s}")
    }
}

/// Role carried by a memory message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

// ============================================================================
// VARIABLE NAMES
// ============================================================================

static VAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// Validate an `item_var` / `index_var` name
pub fn is_valid_variable_name(name: &str) -> bool {
    VAR_NAME.is_match(name)
}

// ============================================================================
// DURATION STRINGS
// ============================================================================

/// Parse a duration string like "250ms", "30s", "5m", "1h" into a Duration
///
/// A bare integer is taken as seconds.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let s = duration_str.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    s.parse::<u64>().ok().map(Duration::from_secs)
}

// ============================================================================
// TESTS
// ============================================================================
