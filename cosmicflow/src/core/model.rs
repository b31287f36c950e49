//! Requirement, trigger-event and data-movement types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CosmicflowError;

/// The functional user pair attached to a requirement or a trigger event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionalUsers {
    /// The user that initiates the interaction.
    #[serde(default)]
    pub initiator: String,
    /// The user that receives the result.
    #[serde(default)]
    pub receiver: String,
}

impl FunctionalUsers {
    /// Creates a functional user pair.
    #[must_use]
    pub fn new(initiator: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            initiator: initiator.into(),
            receiver: receiver.into(),
        }
    }

    /// Returns true if neither side is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.initiator.trim().is_empty() && self.receiver.trim().is_empty()
    }

    /// Renders the pair the way it appears in the table's functional user column.
    #[must_use]
    pub fn label(&self) -> String {
        format!("发起者：{}\n接收者：{}", self.initiator, self.receiver)
    }
}

/// Structured requirement handed to the engine by the extraction collaborator.
///
/// Immutable once stage 1 begins; the coordinator only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementOutline {
    /// Requirement name. Every table row's customer requirement must equal it.
    pub name: String,
    /// Business background.
    #[serde(default)]
    pub background: String,
    /// Initiator/receiver pair.
    #[serde(default)]
    pub functional_users: FunctionalUsers,
    /// Raw detailed plan text.
    #[serde(default)]
    pub detailed_plan: String,
    /// Target number of data-movement rows for the whole requirement.
    pub target_rows: usize,
}

impl RequirementOutline {
    /// Creates a requirement with a name and a target row count.
    #[must_use]
    pub fn new(name: impl Into<String>, target_rows: usize) -> Self {
        Self {
            name: name.into(),
            background: String::new(),
            functional_users: FunctionalUsers::default(),
            detailed_plan: String::new(),
            target_rows,
        }
    }

    /// Sets the business background.
    #[must_use]
    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    /// Sets the functional user pair.
    #[must_use]
    pub fn with_functional_users(
        mut self,
        initiator: impl Into<String>,
        receiver: impl Into<String>,
    ) -> Self {
        self.functional_users = FunctionalUsers::new(initiator, receiver);
        self
    }

    /// Sets the detailed plan text.
    #[must_use]
    pub fn with_detailed_plan(mut self, plan: impl Into<String>) -> Self {
        self.detailed_plan = plan.into();
        self
    }

    /// Checks the preconditions the engine relies on.
    pub fn ensure_valid(&self) -> Result<(), CosmicflowError> {
        if self.name.trim().is_empty() {
            return Err(CosmicflowError::InvalidRequirement(
                "requirement name is empty".to_string(),
            ));
        }
        if self.target_rows == 0 {
            return Err(CosmicflowError::InvalidRequirement(format!(
                "requirement '{}' has a zero target row count",
                self.name
            )));
        }
        Ok(())
    }
}

/// COSMIC data movement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementType {
    /// Data enters the process from a functional user.
    #[serde(rename = "E")]
    Entry,
    /// Data leaves the process towards a functional user.
    #[serde(rename = "X")]
    Exit,
    /// Data is read from persistent storage.
    #[serde(rename = "R")]
    Read,
    /// Data is written to persistent storage.
    #[serde(rename = "W")]
    Write,
}

impl MovementType {
    /// All four kinds in canonical order.
    pub const ALL: [Self; 4] = [Self::Entry, Self::Exit, Self::Read, Self::Write];

    /// The single-letter code used in the table.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Entry => "E",
            Self::Exit => "X",
            Self::Read => "R",
            Self::Write => "W",
        }
    }

    /// Parses the canonical single-letter code. Anything else is rejected.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "E" => Some(Self::Entry),
            "X" => Some(Self::Exit),
            "R" => Some(Self::Read),
            "W" => Some(Self::Write),
            _ => None,
        }
    }

    /// Recognises common spellings of a movement type that are not the
    /// canonical code (English words, lower case, Chinese terms).
    #[must_use]
    pub fn from_alias(text: &str) -> Option<Self> {
        let normalized = text.trim().trim_matches('*').trim().to_lowercase();
        match normalized.as_str() {
            "e" | "entry" | "input" | "输入" | "进入" => Some(Self::Entry),
            "x" | "exit" | "output" | "输出" | "退出" => Some(Self::Exit),
            "r" | "read" | "读" | "读取" => Some(Self::Read),
            "w" | "write" | "写" | "写入" => Some(Self::Write),
            _ => None,
        }
    }

    /// Returns true for movements that cross the boundary towards a user or
    /// storage as output.
    #[must_use]
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Exit | Self::Write)
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One COSMIC row reduced to its counted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMovement {
    /// Movement kind.
    #[serde(rename = "type")]
    pub kind: MovementType,
    /// Data group moved.
    pub data_group: String,
    /// Attributes of the data group.
    pub data_attributes: Vec<String>,
    /// Owning functional process.
    pub process_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProcessRepr {
    Text(String),
    Detailed {
        #[serde(default)]
        id: String,
        #[serde(alias = "name", alias = "process")]
        description: String,
        #[serde(default)]
        data_movements: Vec<DataMovement>,
    },
}

/// An atomic, triggerable unit of behaviour.
///
/// Deserializes from either a bare description string or an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ProcessRepr")]
pub struct FunctionalProcess {
    /// Process id, unique within a run (may be empty until ids are assigned).
    pub id: String,
    /// Process description.
    pub description: String,
    /// Movements owned by this process, in table order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_movements: Vec<DataMovement>,
}

impl From<ProcessRepr> for FunctionalProcess {
    fn from(repr: ProcessRepr) -> Self {
        match repr {
            ProcessRepr::Text(description) => Self {
                id: String::new(),
                description,
                data_movements: Vec::new(),
            },
            ProcessRepr::Detailed {
                id,
                description,
                data_movements,
            } => Self {
                id,
                description,
                data_movements,
            },
        }
    }
}

impl FunctionalProcess {
    /// Creates a process without movements.
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            data_movements: Vec::new(),
        }
    }
}

/// A business occurrence that initiates one or more functional processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Event id, unique within a run (may be empty until ids are assigned).
    #[serde(default)]
    pub id: String,
    /// Event name.
    #[serde(alias = "event", alias = "trigger_event")]
    pub name: String,
    /// Functional user requirement the event belongs to.
    #[serde(default, alias = "requirement")]
    pub user_requirement: String,
    /// Initiator/receiver pair.
    #[serde(default)]
    pub functional_users: FunctionalUsers,
    /// Processes triggered by the event, in order.
    #[serde(default, alias = "processes")]
    pub functional_processes: Vec<FunctionalProcess>,
}

impl TriggerEvent {
    /// Creates an event without processes.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            user_requirement: String::new(),
            functional_users: FunctionalUsers::default(),
            functional_processes: Vec::new(),
        }
    }

    /// Sets the functional user requirement.
    #[must_use]
    pub fn with_user_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.user_requirement = requirement.into();
        self
    }

    /// Appends a process.
    #[must_use]
    pub fn with_process(mut self, process: FunctionalProcess) -> Self {
        self.functional_processes.push(process);
        self
    }

    /// Number of functional processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.functional_processes.len()
    }
}
