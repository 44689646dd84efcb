//! Domain records persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use blackbelt_core::EngineError;

macro_rules! string_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn from_str(value: &str) -> Result<Self, EngineError> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::BadRequest(format!(
                        concat!("invalid ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Node layer in the process graph: blocks at the roots, units under
    /// blocks, resources attached to blocks.
    NodeType {
        Block => "Block",
        Unit => "Unit",
        Resource => "Resource",
    }
}

string_enum! {
    ParamRole {
        Input => "Input",
        Control => "Control",
        Output => "Output",
    }
}

string_enum! {
    ParamDataType {
        Scalar => "Scalar",
        Spectrum => "Spectrum",
        Image => "Image",
        Grade => "Grade",
    }
}

string_enum! {
    RiskCategory {
        Top => "Top",
        Equipment => "Equipment",
        Material => "Material",
        Human => "Human",
        Environment => "Environment",
        Method => "Method",
    }
}

string_enum! {
    BatchStatus {
        Running => "Running",
        Completed => "Completed",
    }
}

string_enum! {
    MeasurementSource {
        History => "HISTORY",
        Simulation => "SIMULATION",
        Sensor => "SENSOR",
        Input => "INPUT",
    }
}

string_enum! {
    /// Instruction recipient.
    TargetRole {
        Operator => "Operator",
        Qa => "QA",
        TeamLeader => "TeamLeader",
        Manager => "Manager",
    }
}

string_enum! {
    ActionPriority {
        Critical => "CRITICAL",
        High => "HIGH",
        Medium => "MEDIUM",
        Low => "LOW",
    }
}

impl ActionPriority {
    /// Numeric rank for priority ordering, highest first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

string_enum! {
    /// Instruction lifecycle. Transitions only move forward.
    InstructionStatus {
        Pending => "Pending",
        Read => "Read",
        Done => "Done",
    }
}

string_enum! {
    InstructionKind {
        Tactical => "tactical",
        Strategic => "strategic",
    }
}

/// A unit in the process graph. Created at bootstrap, immutable after.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessNode {
    pub code: String,
    pub name: String,
    pub node_type: NodeType,
    pub parent_code: Option<String>,
}

/// Directed material flow between two nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source_code: String,
    pub target_code: String,
    pub name: Option<String>,
    pub loss_rate: Option<f64>,
}

/// A measurable attribute of a node, with optional specification limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterDef {
    pub node_code: String,
    pub code: String,
    pub name: String,
    pub unit: Option<String>,
    pub role: ParamRole,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
    pub target: Option<f64>,
    pub data_type: ParamDataType,
}

impl ParameterDef {
    /// Limit sanity: `lsl < usl` when both present, target inside them.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let (Some(lsl), Some(usl)) = (self.lsl, self.usl) {
            if lsl >= usl {
                return Err(EngineError::BadRequest(format!(
                    "parameter {}.{}: lsl {} must be below usl {}",
                    self.node_code, self.code, lsl, usl
                )));
            }
        }
        if let Some(target) = self.target {
            if self.lsl.map(|l| target < l).unwrap_or(false)
                || self.usl.map(|u| target > u).unwrap_or(false)
            {
                return Err(EngineError::BadRequest(format!(
                    "parameter {}.{}: target {} outside specification limits",
                    self.node_code, self.code, target
                )));
            }
        }
        Ok(())
    }
}

/// Fault-tree node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskNode {
    pub code: String,
    pub name: String,
    pub category: RiskCategory,
    pub base_probability: f64,
}

/// Causal edge between risks (child cause → parent effect). The full set
/// must form a DAG; the importer rejects cycles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskEdge {
    pub source_code: String,
    pub target_code: String,
    pub weight: f64,
}

/// Remediation template matched to issues by the decision engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionDef {
    pub code: String,
    pub name: String,
    pub risk_code: Option<String>,
    pub target_role: TargetRole,
    pub instruction_template: String,
    pub priority: ActionPriority,
    pub category: Option<String>,
    pub estimated_impact: Option<String>,
    pub active: bool,
}

/// Production run. Created implicitly by the first measurement write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub product_name: String,
    pub operator_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BatchStatus,
}

pub const DEFAULT_PRODUCT_NAME: &str = "稳心颗粒";

/// Single data point in the append-only measurement stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub batch_id: String,
    pub node_code: String,
    pub param_code: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: MeasurementSource,
}

/// New measurement before insertion (id and timestamp default applied by
/// the store).
#[derive(Clone, Debug, Deserialize)]
pub struct NewMeasurement {
    pub batch_id: String,
    pub node_code: String,
    pub param_code: String,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: MeasurementSource,
}

/// Materialised per-role directive with a Pending → Read → Done
/// lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instruction {
    pub id: i64,
    pub target_date: String,
    pub role: TargetRole,
    pub action_code: String,
    pub batch_id: Option<String>,
    pub node_code: Option<String>,
    pub param_code: Option<String>,
    pub content: String,
    pub status: InstructionStatus,
    pub priority: ActionPriority,
    /// String-keyed bag of scalars; readers tolerate unknown keys.
    pub evidence: Map<String, Value>,
    pub feedback: Option<String>,
    pub instruction_type: InstructionKind,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
}

/// New instruction before insertion.
#[derive(Clone, Debug)]
pub struct NewInstruction {
    pub target_date: String,
    pub role: TargetRole,
    pub action_code: String,
    pub batch_id: Option<String>,
    pub node_code: Option<String>,
    pub param_code: Option<String>,
    pub content: String,
    pub priority: ActionPriority,
    pub evidence: Map<String, Value>,
    pub instruction_type: InstructionKind,
}
