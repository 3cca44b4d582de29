use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::process::PluginProcess;
use crate::types::{InstanceState, Method, Parameters, PluginRef, PluginStatus, RunAction};
use crate::{Plugin, PluginError, Result};

/// Default bound on the ready handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── PluginClient ─────────────────────────────────────────────────────────

/// Owning client for exactly one plugin instance.
///
/// One client serves one action invocation: it is created, spawned, used,
/// then killed. `kill` is idempotent and also runs implicitly on drop (the
/// child is started with `kill_on_drop`), so every exit path of the caller
/// releases the process.
pub struct PluginClient {
    plugin: PluginRef,
    instance_id: String,
    callback: String,
    state: InstanceState,
    process: Option<PluginProcess>,
}

impl PluginClient {
    /// Create an instance in the `Spawning` state without starting a process.
    pub fn new(plugin: PluginRef, instance_id: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            plugin,
            instance_id: instance_id.into(),
            callback: callback.into(),
            state: InstanceState::Spawning,
            process: None,
        }
    }

    /// Create and spawn in one step, blocking until the plugin is ready.
    pub async fn launch(
        plugin: PluginRef,
        instance_id: impl Into<String>,
        callback: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut client = Self::new(plugin, instance_id, callback);
        client.spawn(timeout).await?;
        Ok(client)
    }

    /// Start the process and wait for its ready line.
    ///
    /// On any failure the process is killed and the instance is `Dead`.
    pub async fn spawn(&mut self, timeout: Duration) -> Result<()> {
        if self.state != InstanceState::Spawning || self.process.is_some() {
            return Err(PluginError::Handshake(format!(
                "instance '{}' was already spawned",
                self.instance_id
            )));
        }

        let mut process = match PluginProcess::spawn(&self.plugin, &self.instance_id, &self.callback)
        {
            Ok(p) => p,
            Err(e) => {
                self.state = InstanceState::Dead;
                return Err(e);
            }
        };

        if let Err(e) = process.handshake(&self.instance_id, timeout).await {
            process.kill().await;
            self.state = InstanceState::Dead;
            return Err(e);
        }

        info!(plugin = %self.plugin.name, instance = %self.instance_id, "plugin spawned");
        self.process = Some(process);
        self.state = InstanceState::Ready;
        Ok(())
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn plugin(&self) -> &PluginRef {
        &self.plugin
    }

    /// Run the action, surfacing transport problems as errors.
    ///
    /// Exactly one attempt is made. A transport failure leaves the instance
    /// `Dead`; the caller still owns the `kill`.
    pub async fn try_run(&mut self, action: &RunAction) -> Result<PluginStatus> {
        self.state = InstanceState::Running;
        let result = self.call(Method::Run, Some(action)).await;
        let status = result.and_then(|value| {
            serde_json::from_value::<PluginStatus>(value.clone()).map_err(|e| {
                PluginError::Protocol {
                    line: value.to_string(),
                    source: e,
                }
            })
        });
        self.state = match status {
            Ok(_) => InstanceState::Ready,
            Err(_) => InstanceState::Dead,
        };
        status
    }

    /// Terminate the process and release it. Safe to call at any time and
    /// any number of times.
    pub async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill().await;
            info!(plugin = %self.plugin.name, instance = %self.instance_id, "plugin killed");
        }
        self.state = InstanceState::Dead;
    }

    async fn call(&mut self, method: Method, params: Option<&RunAction>) -> Result<serde_json::Value> {
        let process = self.process.as_mut().ok_or_else(|| {
            PluginError::Transport(format!("instance '{}' is not running", self.instance_id))
        })?;
        process.call(method, params).await
    }

    async fn call_string(&mut self, method: Method) -> Result<String> {
        let value = self.call(method, None).await?;
        match value {
            serde_json::Value::String(s) => Ok(s),
            other => Err(PluginError::Transport(format!(
                "expected a string for {method:?}, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl Plugin for PluginClient {
    async fn name(&mut self) -> Result<String> {
        self.call_string(Method::Name).await
    }

    async fn author(&mut self) -> Result<String> {
        self.call_string(Method::Author).await
    }

    async fn description(&mut self) -> Result<String> {
        self.call_string(Method::Description).await
    }

    async fn parameters(&mut self) -> Result<Parameters> {
        let value = self.call(Method::Parameters, None).await?;
        serde_json::from_value(value.clone()).map_err(|e| PluginError::Protocol {
            line: value.to_string(),
            source: e,
        })
    }

    async fn run(&mut self, action: &RunAction) -> PluginStatus {
        match self.try_run(action).await {
            Ok(status) => status,
            Err(e) => {
                warn!(plugin = %self.plugin.name, instance = %self.instance_id, "plugin run failed: {e}");
                PluginStatus::Fail
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
