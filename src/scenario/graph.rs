//! Scenario graph model
//!
//! A scenario is a directed graph: exactly one Start node, any number of
//! End nodes, and edges walked in declaration order. Definitions are
//! plain serde data so they round-trip through the scenario repository.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::fsm::ConnectorStatus;
use crate::domain::meter::AutoMeterConfig;

/// What the scenario drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetType {
    Connector,
    ChargePoint,
}

/// How the executor advances through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// Run to an End node, then finish.
    Oneshot,
    /// Pause before every node; advance on explicit `step()`.
    Step,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Oneshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlugAction {
    PlugIn,
    PlugOut,
}

/// Canvas position, kept for round-tripping editor layouts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

fn default_timeout() -> u64 {
    0
}

/// Node behavior, tagged by `type` with parameters under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum NodeKind {
    Start,
    End,
    #[serde(rename_all = "camelCase")]
    StatusChange { status: ConnectorStatus },
    #[serde(rename_all = "camelCase")]
    Transaction {
        action: TxAction,
        #[serde(default)]
        tag_id: Option<String>,
        #[serde(default)]
        battery_capacity_kwh: Option<f64>,
        #[serde(default)]
        initial_soc: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    MeterValue {
        value: i64,
        #[serde(default)]
        send_message: bool,
    },
    #[serde(rename_all = "camelCase")]
    Delay { seconds: u64 },
    #[serde(rename_all = "camelCase")]
    Notification {
        message_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ConnectorPlug { action: PlugAction },
    /// Wait until the target connector reaches a status.
    #[serde(rename_all = "camelCase")]
    StatusTrigger {
        target_status: ConnectorStatus,
        /// 0 waits forever.
        #[serde(default = "default_timeout")]
        timeout_seconds: u64,
    },
    /// Own the connector and wait for a RemoteStartTransaction.
    #[serde(rename_all = "camelCase")]
    RemoteStartTrigger {
        #[serde(default = "default_timeout")]
        timeout_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    ReserveNow {
        expiry_minutes: i64,
        id_tag: String,
        #[serde(default)]
        parent_id_tag: Option<String>,
        #[serde(default)]
        reservation_id: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    CancelReservation { reservation_id: i32 },
    #[serde(rename_all = "camelCase")]
    WaitForReservation {
        #[serde(default = "default_timeout")]
        timeout_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    WaitForMeterValue {
        target_value: i64,
        #[serde(default = "default_timeout")]
        timeout_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    AutoMeterStart { config: AutoMeterConfig },
    AutoMeterStop,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::StatusChange { .. } => "statusChange",
            Self::Transaction { .. } => "transaction",
            Self::MeterValue { .. } => "meterValue",
            Self::Delay { .. } => "delay",
            Self::Notification { .. } => "notification",
            Self::ConnectorPlug { .. } => "connectorPlug",
            Self::StatusTrigger { .. } => "statusTrigger",
            Self::RemoteStartTrigger { .. } => "remoteStartTrigger",
            Self::ReserveNow { .. } => "reserveNow",
            Self::CancelReservation { .. } => "cancelReservation",
            Self::WaitForReservation { .. } => "waitForReservation",
            Self::WaitForMeterValue { .. } => "waitForMeterValue",
            Self::AutoMeterStart { .. } => "autoMeterStart",
            Self::AutoMeterStop => "autoMeterStop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// A complete scenario definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDefinition {
    pub id: String,
    pub name: String,
    pub target_type: TargetType,
    /// Connector id as a string for connector targets.
    pub target_id: String,
    pub nodes: Vec<ScenarioNode>,
    pub edges: Vec<ScenarioEdge>,
    #[serde(default)]
    pub default_execution_mode: ExecutionMode,
    #[serde(default = "crate::scenario::graph::default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Re-enter Start after reaching an End node.
    #[serde(default, rename = "loop")]
    pub loop_scenario: bool,
}

pub(crate) fn default_enabled() -> bool {
    true
}

/// Structural problems that make a scenario unrunnable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScenarioValidationError {
    #[error("scenario has no Start node")]
    NoStartNode,
    #[error("scenario has {0} Start nodes; exactly one is required")]
    MultipleStartNodes(usize),
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("edge {edge_id} references unknown node {node_id}")]
    DanglingEdge { edge_id: String, node_id: String },
}

impl ScenarioDefinition {
    pub fn validate(&self) -> Result<(), ScenarioValidationError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ScenarioValidationError::DuplicateNodeId(node.id.clone()));
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .count();
        match starts {
            0 => return Err(ScenarioValidationError::NoStartNode),
            1 => {}
            n => return Err(ScenarioValidationError::MultipleStartNodes(n)),
        }

        for edge in &self.edges {
            for node_id in [&edge.source, &edge.target] {
                if !seen.contains(node_id.as_str()) {
                    return Err(ScenarioValidationError::DanglingEdge {
                        edge_id: edge.id.clone(),
                        node_id: node_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&ScenarioNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&ScenarioNode> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Outgoing edges of `id`, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a ScenarioEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Connector id for connector-targeted scenarios.
    pub fn target_connector(&self) -> Option<u32> {
        (self.target_type == TargetType::Connector)
            .then(|| self.target_id.parse().ok())
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, kind: NodeKind) -> ScenarioNode {
        ScenarioNode { id: id.into(), position: None, kind }
    }

    fn edge(id: &str, source: &str, target: &str) -> ScenarioEdge {
        ScenarioEdge { id: id.into(), source: source.into(), target: target.into() }
    }

    fn minimal() -> ScenarioDefinition {
        ScenarioDefinition {
            id: "s1".into(),
            name: "minimal".into(),
            target_type: TargetType::Connector,
            target_id: "1".into(),
            nodes: vec![node("start", NodeKind::Start), node("end", NodeKind::End)],
            edges: vec![edge("e1", "start", "end")],
            default_execution_mode: ExecutionMode::Oneshot,
            enabled: true,
            trigger: None,
            loop_scenario: false,
        }
    }

    #[test]
    fn minimal_scenario_validates() {
        assert!(minimal().validate().is_ok());
        assert_eq!(minimal().target_connector(), Some(1));
    }

    #[test]
    fn missing_start_is_rejected() {
        let mut s = minimal();
        s.nodes.retain(|n| n.id != "start");
        s.edges.clear();
        assert_eq!(s.validate(), Err(ScenarioValidationError::NoStartNode));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut s = minimal();
        s.nodes.push(node("end", NodeKind::End));
        assert_eq!(
            s.validate(),
            Err(ScenarioValidationError::DuplicateNodeId("end".into()))
        );
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut s = minimal();
        s.edges.push(edge("e2", "end", "nowhere"));
        assert_eq!(
            s.validate(),
            Err(ScenarioValidationError::DanglingEdge {
                edge_id: "e2".into(),
                node_id: "nowhere".into()
            })
        );
    }

    #[test]
    fn node_json_shape_roundtrips() {
        let raw = r#"{
            "id": "n3",
            "type": "statusTrigger",
            "data": { "targetStatus": "Charging", "timeoutSeconds": 30 },
            "position": { "x": 10.0, "y": 20.0 }
        }"#;
        let parsed: ScenarioNode = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.kind,
            NodeKind::StatusTrigger {
                target_status: ConnectorStatus::Charging,
                timeout_seconds: 30
            }
        );
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["type"], "statusTrigger");
        assert_eq!(back["data"]["targetStatus"], "Charging");
    }

    #[test]
    fn unit_nodes_parse_without_data() {
        let parsed: ScenarioNode =
            serde_json::from_str(r#"{ "id": "s", "type": "start" }"#).unwrap();
        assert_eq!(parsed.kind, NodeKind::Start);
        let parsed: ScenarioNode =
            serde_json::from_str(r#"{ "id": "x", "type": "autoMeterStop" }"#).unwrap();
        assert_eq!(parsed.kind, NodeKind::AutoMeterStop);
    }
}
