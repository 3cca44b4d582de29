use crate::output::{print_json, print_table};
use anyhow::Context;
use cds_core::config::Config;
use cds_core::error::{CdsError, NotFoundKind};
use cds_plugin::{Parameters, Plugin, PluginClient, PluginRef, ProgressListener};
use clap::Subcommand;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Subcommand)]
pub enum PluginSubcommand {
    /// Start a plugin and print what it reports about itself
    Info { name: String },
}

#[derive(Serialize)]
struct PluginInfo {
    name: String,
    author: String,
    description: String,
    parameters: Parameters,
}

pub fn run(root: &Path, subcmd: PluginSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PluginSubcommand::Info { name } => info(root, &name, json),
    }
}

fn info(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let plugins_dir = config.plugins_path(root);
    let plugin = PluginRef::discover(&plugins_dir, name)
        .with_context(|| format!("cannot read plugin '{name}'"))?
        .ok_or_else(|| CdsError::not_found(NotFoundKind::Plugin, name))?;
    let timeout = Duration::from_secs(config.plugin.handshake_timeout_secs);

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let info = rt.block_on(query(plugin, &config.plugin.callback_bind, timeout))?;

    if json {
        return print_json(&info);
    }
    println!("{} by {}", info.name, info.author);
    if !info.description.is_empty() {
        println!("  {}", info.description);
    }
    if !info.parameters.is_empty() {
        println!();
        let rows = info
            .parameters
            .into_iter()
            .map(|(k, v)| vec![k, v])
            .collect();
        print_table(&["PARAMETER", "DEFAULT"], rows);
    }
    Ok(())
}

async fn query(plugin: PluginRef, callback_bind: &str, timeout: Duration) -> anyhow::Result<PluginInfo> {
    let listener = ProgressListener::bind(callback_bind)
        .await
        .context("cannot bind progress listener")?;
    let instance = uuid::Uuid::new_v4().to_string();
    let name = plugin.name.clone();
    let mut client = PluginClient::launch(plugin, instance, listener.address(), timeout)
        .await
        .with_context(|| format!("cannot start plugin '{name}'"))?;

    let result = describe(&mut client).await;
    client.kill().await;
    result.with_context(|| format!("plugin '{name}' did not answer"))
}

async fn describe(client: &mut PluginClient) -> cds_plugin::Result<PluginInfo> {
    Ok(PluginInfo {
        name: client.name().await?,
        author: client.author().await?,
        description: client.description().await?,
        parameters: client.parameters().await?,
    })
}
