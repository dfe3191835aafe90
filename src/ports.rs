//! Boundary traits
//!
//! Collaborators the core talks to but does not implement: scripted
//! scenario persistence and the diagnostics upload target. Default
//! implementations are provided for the CLI and for tests; real
//! deployments supply their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::scenario::graph::ScenarioDefinition;
use crate::support::errors::{SimResult, SimulatorError};

// ── Diagnostics upload ─────────────────────────────────────────

/// Receives the GetDiagnostics snapshot. Uploads are fire-and-forget
/// from the handler's point of view.
#[async_trait]
pub trait FileUploadSink: Send + Sync {
    async fn upload(&self, location: &str, file_name: &str, contents: &[u8]) -> SimResult<()>;
}

/// Logs the upload and discards the bytes. The CLI default.
#[derive(Debug, Default)]
pub struct NullUploadSink;

#[async_trait]
impl FileUploadSink for NullUploadSink {
    async fn upload(&self, location: &str, file_name: &str, contents: &[u8]) -> SimResult<()> {
        info!(location, file_name, bytes = contents.len(), "diagnostics upload discarded");
        Ok(())
    }
}

// ── Scenario persistence ───────────────────────────────────────

/// Listener invoked after a scenario save that matches its filter.
pub type ScenarioListener = Box<dyn Fn(&ScenarioDefinition) + Send + Sync>;

/// Storage boundary for scenario definitions, keyed by charge point and
/// optionally by connector.
#[async_trait]
pub trait ScenarioRepository: Send + Sync {
    async fn load(
        &self,
        charge_point_id: &str,
        connector_id: Option<u32>,
    ) -> SimResult<Option<ScenarioDefinition>>;

    async fn save(&self, charge_point_id: &str, scenario: &ScenarioDefinition) -> SimResult<()>;

    async fn delete(&self, charge_point_id: &str, scenario_id: &str) -> SimResult<()>;

    async fn list(&self, charge_point_id: &str) -> SimResult<Vec<ScenarioDefinition>>;

    /// Register a listener invoked after every successful save for
    /// `charge_point_id`. A `connector_id` filter narrows it to
    /// scenarios targeting that connector.
    fn subscribe(&self, charge_point_id: &str, connector_id: Option<u32>, listener: ScenarioListener);
}

struct ScenarioSubscription {
    charge_point_id: String,
    connector_id: Option<u32>,
    listener: ScenarioListener,
}

/// Subscription bookkeeping shared by the repository implementations.
#[derive(Default)]
struct ScenarioSubscribers {
    subscriptions: Mutex<Vec<ScenarioSubscription>>,
}

impl ScenarioSubscribers {
    fn add(&self, charge_point_id: &str, connector_id: Option<u32>, listener: ScenarioListener) {
        self.subscriptions.lock().unwrap().push(ScenarioSubscription {
            charge_point_id: charge_point_id.to_string(),
            connector_id,
            listener,
        });
    }

    fn notify(&self, charge_point_id: &str, scenario: &ScenarioDefinition) {
        for sub in self.subscriptions.lock().unwrap().iter() {
            let cp_match = sub.charge_point_id == charge_point_id;
            let connector_match = sub
                .connector_id
                .map_or(true, |id| scenario.target_connector() == Some(id));
            if cp_match && connector_match {
                (sub.listener)(scenario);
            }
        }
    }
}

/// In-memory repository for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryScenarioRepository {
    scenarios: Mutex<HashMap<String, Vec<ScenarioDefinition>>>,
    subscribers: ScenarioSubscribers,
}

impl MemoryScenarioRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScenarioRepository for MemoryScenarioRepository {
    async fn load(
        &self,
        charge_point_id: &str,
        connector_id: Option<u32>,
    ) -> SimResult<Option<ScenarioDefinition>> {
        let scenarios = self.scenarios.lock().unwrap();
        let list = match scenarios.get(charge_point_id) {
            Some(list) => list,
            None => return Ok(None),
        };
        Ok(list
            .iter()
            .find(|s| match connector_id {
                Some(id) => s.target_connector() == Some(id),
                None => true,
            })
            .cloned())
    }

    async fn save(&self, charge_point_id: &str, scenario: &ScenarioDefinition) -> SimResult<()> {
        {
            let mut scenarios = self.scenarios.lock().unwrap();
            let list = scenarios.entry(charge_point_id.to_string()).or_default();
            list.retain(|s| s.id != scenario.id);
            list.push(scenario.clone());
        }
        self.subscribers.notify(charge_point_id, scenario);
        Ok(())
    }

    async fn delete(&self, charge_point_id: &str, scenario_id: &str) -> SimResult<()> {
        if let Some(list) = self.scenarios.lock().unwrap().get_mut(charge_point_id) {
            list.retain(|s| s.id != scenario_id);
        }
        Ok(())
    }

    async fn list(&self, charge_point_id: &str) -> SimResult<Vec<ScenarioDefinition>> {
        Ok(self
            .scenarios
            .lock()
            .unwrap()
            .get(charge_point_id)
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe(
        &self,
        charge_point_id: &str,
        connector_id: Option<u32>,
        listener: ScenarioListener,
    ) {
        self.subscribers.add(charge_point_id, connector_id, listener);
    }
}

/// One JSON file per scenario under `dir/{charge_point_id}/{id}.json`.
pub struct FileScenarioRepository {
    dir: PathBuf,
    subscribers: ScenarioSubscribers,
}

impl FileScenarioRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), subscribers: ScenarioSubscribers::default() }
    }

    /// Parse one scenario definition from a JSON file.
    pub async fn load_file(path: &Path) -> SimResult<ScenarioDefinition> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", path.display())))
    }

    /// Resolve `path` for `charge_point_id`: a directory is treated as a
    /// repository root, a file as a single scenario definition.
    pub async fn load_path(
        path: &Path,
        charge_point_id: &str,
    ) -> SimResult<Option<ScenarioDefinition>> {
        if path.is_dir() {
            Self::new(path).load(charge_point_id, None).await
        } else {
            Self::load_file(path).await.map(Some)
        }
    }

    fn cp_dir(&self, charge_point_id: &str) -> PathBuf {
        self.dir.join(charge_point_id)
    }

    async fn read_all(&self, charge_point_id: &str) -> SimResult<Vec<ScenarioDefinition>> {
        let dir = self.cp_dir(charge_point_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", dir.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SimulatorError::Config(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            out.push(Self::load_file(&path).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ScenarioRepository for FileScenarioRepository {
    async fn load(
        &self,
        charge_point_id: &str,
        connector_id: Option<u32>,
    ) -> SimResult<Option<ScenarioDefinition>> {
        let all = self.read_all(charge_point_id).await?;
        Ok(all
            .into_iter()
            .find(|s| match connector_id {
                Some(id) => s.target_connector() == Some(id),
                None => true,
            }))
    }

    async fn save(&self, charge_point_id: &str, scenario: &ScenarioDefinition) -> SimResult<()> {
        let dir = self.cp_dir(charge_point_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", dir.display())))?;
        let path = dir.join(format!("{}.json", scenario.id));
        let raw = serde_json::to_string_pretty(scenario)
            .map_err(|e| SimulatorError::Config(e.to_string()))?;
        tokio::fs::write(&path, raw)
            .await
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", path.display())))?;
        self.subscribers.notify(charge_point_id, scenario);
        Ok(())
    }

    async fn delete(&self, charge_point_id: &str, scenario_id: &str) -> SimResult<()> {
        let path = self.cp_dir(charge_point_id).join(format!("{scenario_id}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SimulatorError::Config(format!("{}: {e}", path.display()))),
        }
    }

    async fn list(&self, charge_point_id: &str) -> SimResult<Vec<ScenarioDefinition>> {
        self.read_all(charge_point_id).await
    }

    fn subscribe(
        &self,
        charge_point_id: &str,
        connector_id: Option<u32>,
        listener: ScenarioListener,
    ) {
        self.subscribers.add(charge_point_id, connector_id, listener);
    }
}
