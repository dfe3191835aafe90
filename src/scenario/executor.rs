//! Scenario executor
//!
//! Walks a validated scenario graph, invoking callbacks for effect nodes
//! and parking on the event bus for wait nodes. Supports oneshot and
//! stepped execution, looping scenarios, hard timeouts on waits and
//! immediate cancellation: `stop()` aborts outstanding waits and their
//! cleanup runs on the way out, so no bus subscription, timer or
//! scenario-handler registration survives the run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SimEvent};
use crate::scenario::callbacks::ScenarioCallbacks;
use crate::scenario::graph::{
    ExecutionMode, NodeKind, PlugAction, ScenarioDefinition, TxAction,
};
use crate::support::errors::SimulatorError;

/// Tag used when a transaction node does not name one.
const DEFAULT_TAG: &str = "SCENARIO";

/// Executor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Stepping,
    Waiting,
    Completed,
    Error,
}

/// Observable executor snapshot.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub state: ExecutorState,
    pub current_node: Option<String>,
    pub error: Option<String>,
}

impl ExecutorContext {
    fn idle() -> Self {
        Self { state: ExecutorState::Idle, current_node: None, error: None }
    }
}

/// Directed-graph scenario interpreter.
pub struct ScenarioExecutor {
    scenario: ScenarioDefinition,
    callbacks: Arc<dyn ScenarioCallbacks>,
    bus: EventBus,
    target_connector: u32,
    context: Arc<Mutex<ExecutorContext>>,
    step: Arc<Notify>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScenarioExecutor {
    pub fn new(
        scenario: ScenarioDefinition,
        callbacks: Arc<dyn ScenarioCallbacks>,
        bus: EventBus,
    ) -> Self {
        let target_connector = scenario.target_connector().unwrap_or(1);
        Self {
            scenario,
            callbacks,
            bus,
            target_connector,
            context: Arc::new(Mutex::new(ExecutorContext::idle())),
            step: Arc::new(Notify::new()),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn context(&self) -> ExecutorContext {
        self.context.lock().unwrap().clone()
    }

    pub fn state(&self) -> ExecutorState {
        self.context.lock().unwrap().state
    }

    /// Begin execution. Starting from Completed or Error resets the
    /// run; starting while active is refused.
    pub fn start(&self, mode: ExecutionMode) -> Result<(), SimulatorError> {
        {
            let context = self.context.lock().unwrap();
            if matches!(
                context.state,
                ExecutorState::Running | ExecutorState::Stepping | ExecutorState::Waiting
            ) {
                return Err(SimulatorError::Scenario("scenario is already running".into()));
            }
        }
        self.scenario
            .validate()
            .map_err(|e| SimulatorError::Scenario(e.to_string()))?;

        // Drop the finished task handle of a previous run, if any.
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());

        let run = Run {
            scenario: self.scenario.clone(),
            callbacks: self.callbacks.clone(),
            bus: self.bus.clone(),
            target_connector: self.target_connector,
            context: self.context.clone(),
            step: self.step.clone(),
            cancel: token,
            mode,
        };
        run.set_state(|ctx| {
            ctx.state = match mode {
                ExecutionMode::Oneshot => ExecutorState::Running,
                ExecutionMode::Step => ExecutorState::Stepping,
            };
            ctx.current_node = None;
            ctx.error = None;
        });

        info!(scenario = self.scenario.name.as_str(), ?mode, "scenario started");
        *self.task.lock().unwrap() = Some(tokio::spawn(run.run()));
        Ok(())
    }

    /// Advance one node in step mode.
    pub fn step(&self) {
        self.step.notify_one();
    }

    /// Cancel the run. Outstanding waits are aborted; effects already
    /// applied stay applied.
    pub async fn stop(&self) {
        let token = self.cancel.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
        }
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut context = self.context.lock().unwrap();
        context.state = ExecutorState::Idle;
        context.current_node = None;
        info!("scenario stopped");
    }
}

/// Node outcome inside the run loop.
enum Flow {
    Continue,
    End,
}

enum NodeError {
    Cancelled,
    Failed(String),
}

/// Everything one run needs, detached from the executor handle.
struct Run {
    scenario: ScenarioDefinition,
    callbacks: Arc<dyn ScenarioCallbacks>,
    bus: EventBus,
    target_connector: u32,
    context: Arc<Mutex<ExecutorContext>>,
    step: Arc<Notify>,
    cancel: CancellationToken,
    mode: ExecutionMode,
}

impl Run {
    fn set_state(&self, mutate: impl FnOnce(&mut ExecutorContext)) {
        let snapshot = {
            let mut context = self.context.lock().unwrap();
            mutate(&mut context);
            context.clone()
        };
        self.callbacks.on_state_change(&snapshot);
    }

    fn active_state(&self) -> ExecutorState {
        match self.mode {
            ExecutionMode::Oneshot => ExecutorState::Running,
            ExecutionMode::Step => ExecutorState::Stepping,
        }
    }

    async fn run(self) {
        // validated before spawn
        let start_id = match self.scenario.start_node() {
            Some(node) => node.id.clone(),
            None => return,
        };
        let mut executed: HashSet<String> = HashSet::new();
        let mut current = start_id.clone();
        let mut first = true;

        loop {
            // Keep looping scenarios preemptible even when every node on
            // the cycle completes synchronously.
            tokio::task::yield_now().await;
            if self.cancel.is_cancelled() {
                return;
            }

            // Step mode pauses before every node except the Start entry.
            if self.mode == ExecutionMode::Step && !first {
                self.set_state(|ctx| ctx.state = ExecutorState::Stepping);
                tokio::select! {
                    _ = self.step.notified() => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
            first = false;

            self.set_state(|ctx| {
                ctx.state = self.active_state();
                ctx.current_node = Some(current.clone());
            });
            self.callbacks.on_node_execute(&current);

            let node = match self.scenario.node(&current) {
                Some(node) => node.clone(),
                None => {
                    self.fail(format!("node vanished from scenario: {current}"));
                    return;
                }
            };

            match self.execute_node(&node.id, &node.kind).await {
                Err(NodeError::Cancelled) => return,
                Err(NodeError::Failed(message)) => {
                    self.fail(message);
                    return;
                }
                Ok(Flow::End) => {
                    if self.scenario.loop_scenario {
                        debug!("end node with loop; re-entering start");
                        executed.clear();
                        current = start_id.clone();
                        continue;
                    }
                    self.set_state(|ctx| ctx.state = ExecutorState::Completed);
                    info!("scenario completed");
                    return;
                }
                Ok(Flow::Continue) => {
                    executed.insert(current.clone());
                    // First edge to an unvisited node wins; with every
                    // target already visited, the first edge is taken.
                    let next = self
                        .scenario
                        .outgoing(&current)
                        .find(|e| !executed.contains(&e.target))
                        .or_else(|| self.scenario.outgoing(&current).next())
                        .map(|e| e.target.clone());
                    match next {
                        Some(next) => current = next,
                        None => {
                            self.set_state(|ctx| ctx.state = ExecutorState::Completed);
                            info!("scenario completed (no outgoing edge)");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fail(&self, message: String) {
        warn!(error = message.as_str(), "scenario failed");
        self.callbacks.on_error(&message);
        self.set_state(|ctx| {
            ctx.state = ExecutorState::Error;
            ctx.error = Some(message);
        });
    }

    async fn execute_node(&self, node_id: &str, kind: &NodeKind) -> Result<Flow, NodeError> {
        let sync = |result: crate::support::errors::SimResult<()>| match result {
            Ok(()) => Ok(Flow::Continue),
            Err(e) => Err(NodeError::Failed(e.to_string())),
        };

        match kind {
            NodeKind::Start => Ok(Flow::Continue),
            NodeKind::End => Ok(Flow::End),

            NodeKind::StatusChange { status } => sync(self.callbacks.on_status_change(*status)),
            NodeKind::Transaction { action: TxAction::Start, tag_id, battery_capacity_kwh, initial_soc } => {
                let tag = tag_id.as_deref().unwrap_or(DEFAULT_TAG);
                sync(self.callbacks.on_start_transaction(tag, *battery_capacity_kwh, *initial_soc))
            }
            NodeKind::Transaction { action: TxAction::Stop, .. } => {
                sync(self.callbacks.on_stop_transaction())
            }
            NodeKind::MeterValue { value, send_message } => {
                self.callbacks
                    .on_set_meter_value(*value)
                    .map_err(|e| NodeError::Failed(e.to_string()))?;
                if *send_message {
                    self.callbacks
                        .on_send_meter_value()
                        .map_err(|e| NodeError::Failed(e.to_string()))?;
                }
                Ok(Flow::Continue)
            }
            NodeKind::Notification { message_type, payload } => {
                sync(self.callbacks.on_send_notification(message_type, payload))
            }
            NodeKind::ConnectorPlug { action } => {
                sync(self.callbacks.on_connector_plug(*action == PlugAction::PlugIn))
            }
            NodeKind::ReserveNow { expiry_minutes, id_tag, parent_id_tag, reservation_id } => sync(
                self.callbacks.on_reserve_now(
                    *expiry_minutes,
                    id_tag,
                    parent_id_tag.as_deref(),
                    *reservation_id,
                ),
            ),
            NodeKind::CancelReservation { reservation_id } => {
                sync(self.callbacks.on_cancel_reservation(*reservation_id))
            }
            NodeKind::AutoMeterStart { config } => sync(self.callbacks.on_auto_meter_start(config)),
            NodeKind::AutoMeterStop => sync(self.callbacks.on_auto_meter_stop()),

            NodeKind::Delay { seconds } => {
                let total = *seconds;
                for tick in 0..total {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            self.callbacks.on_node_progress(node_id, total - tick - 1, total);
                        }
                        _ = self.cancel.cancelled() => return Err(NodeError::Cancelled),
                    }
                }
                Ok(Flow::Continue)
            }

            NodeKind::StatusTrigger { target_status, timeout_seconds } => {
                let target_connector = self.target_connector;
                let target_status = *target_status;
                self.wait_for(*timeout_seconds, move |event| match event {
                    SimEvent::StatusChanged { connector_id, new, .. }
                        if *connector_id == target_connector && *new == target_status =>
                    {
                        Some(())
                    }
                    _ => None,
                })
                .await?;
                Ok(Flow::Continue)
            }

            NodeKind::RemoteStartTrigger { timeout_seconds } => {
                // Registration is dropped on every exit path.
                let _guard = ScenarioHandlerGuard::register(self.callbacks.as_ref());
                let target_connector = self.target_connector;
                self.wait_for(*timeout_seconds, move |event| match event {
                    SimEvent::RemoteStartReceived { connector_id, tag_id }
                        if *connector_id == target_connector =>
                    {
                        Some(tag_id.clone())
                    }
                    _ => None,
                })
                .await?;
                Ok(Flow::Continue)
            }

            NodeKind::WaitForReservation { timeout_seconds } => {
                if self.callbacks.reservation_for_target().is_some() {
                    return Ok(Flow::Continue);
                }
                let target_connector = self.target_connector;
                self.wait_for(*timeout_seconds, move |event| match event {
                    SimEvent::ReservationCreated { connector_id, .. }
                        if *connector_id == target_connector || *connector_id == 0 =>
                    {
                        Some(())
                    }
                    _ => None,
                })
                .await?;
                Ok(Flow::Continue)
            }

            NodeKind::WaitForMeterValue { target_value, timeout_seconds } => {
                let target_connector = self.target_connector;
                let target_value = *target_value;
                self.wait_for(*timeout_seconds, move |event| match event {
                    SimEvent::MeterValueChanged { connector_id, value }
                        if *connector_id == target_connector && *value >= target_value =>
                    {
                        Some(())
                    }
                    _ => None,
                })
                .await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Park on the bus until `pred` matches. Timeout 0 waits forever.
    /// The subscription dies with the future on every exit path.
    async fn wait_for<T>(
        &self,
        timeout_seconds: u64,
        pred: impl FnMut(&SimEvent) -> Option<T>,
    ) -> Result<T, NodeError> {
        self.set_state(|ctx| ctx.state = ExecutorState::Waiting);
        let timeout = (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds));

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(NodeError::Cancelled),
            outcome = self.bus.wait_for(timeout, pred) => {
                outcome.map_err(|e| NodeError::Failed(e.to_string()))
            }
        };

        if result.is_ok() {
            self.set_state(|ctx| ctx.state = self.active_state());
        }
        result
    }
}

/// Unregisters the scenario handler when dropped.
struct ScenarioHandlerGuard<'a> {
    callbacks: &'a dyn ScenarioCallbacks,
}

impl<'a> ScenarioHandlerGuard<'a> {
    fn register(callbacks: &'a dyn ScenarioCallbacks) -> Self {
        callbacks.register_scenario_handler();
        Self { callbacks }
    }
}

impl Drop for ScenarioHandlerGuard<'_> {
    fn drop(&mut self) {
        self.callbacks.unregister_scenario_handler();
    }
}
