//! Scenario engine: graph data model, collaborator callbacks and the
//! directed-graph interpreter that drives a connector through scripted
//! sequences.

pub mod callbacks;
pub mod executor;
pub mod graph;

pub use callbacks::{ChargePointScenarioTarget, ScenarioCallbacks};
pub use executor::{ExecutorContext, ExecutorState, ScenarioExecutor};
pub use graph::{
    ExecutionMode, NodeKind, PlugAction, ScenarioDefinition, ScenarioEdge, ScenarioNode,
    ScenarioValidationError, TargetType, TxAction,
};
