//! Out-of-process action plugins.
//!
//! A plugin is an executable installed under `<plugins_dir>/<name>/`. The
//! host starts one process per action invocation, waits for a ready line,
//! talks JSON lines over stdin/stdout, and kills the process afterwards.
//!
//! # Architecture
//!
//! ```text
//! ProgressListener  ← TCP callback address, plugin pushes progress entries
//!     │
//!     ▼
//! PluginClient      ← owns one instance: Spawning → Ready → Running → Dead
//!     │               implements the `Plugin` trait
//!     ▼
//! PluginProcess     ← `<dir>/<name>` with CDS_PLUGIN_INSTANCE / CDS_PLUGIN_CALLBACK
//!                     ready handshake, then {"id","method","params"} requests
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use cds_plugin::{Plugin, PluginClient, PluginRef, ProgressListener, RunAction};
//!
//! let listener = ProgressListener::bind("127.0.0.1:0").await?;
//! let plugin = PluginRef::new("git", "/var/lib/cds/plugins/git");
//! let mut client =
//!     PluginClient::launch(plugin, "inst-1", listener.address(), timeout).await?;
//! let status = client.run(&RunAction::default()).await;
//! client.kill().await;
//! ```

pub mod callback;
pub mod client;
pub mod error;
pub mod types;

pub(crate) mod process;

use async_trait::async_trait;

pub use callback::ProgressListener;
pub use client::{PluginClient, DEFAULT_HANDSHAKE_TIMEOUT};
pub use error::PluginError;
pub use types::{
    InstanceState, Parameters, PluginManifest, PluginRef, PluginStatus, ProgressEntry, RunAction,
    CALLBACK_ENV, INSTANCE_ENV,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, PluginError>;

/// The capability a plugin exposes to the host.
///
/// Metadata calls are a single round-trip each. `run` never fails: any
/// transport problem is reported as [`PluginStatus::Fail`].
#[async_trait]
pub trait Plugin: Send {
    async fn name(&mut self) -> Result<String>;
    async fn author(&mut self) -> Result<String>;
    async fn description(&mut self) -> Result<String>;
    async fn parameters(&mut self) -> Result<Parameters>;
    async fn run(&mut self, action: &RunAction) -> PluginStatus;
}
