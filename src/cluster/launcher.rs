//! Node pool definitions and process launching.

use crate::config::CoordinatorConfig;
use crate::error::{Error, MembershipError, Result};
use crate::partitioning::RingNode;
use crate::types::NodeName;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A node the coordinator may start: name and the address it will listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDefinition {
    pub name: NodeName,
    pub host: String,
    pub port: u16,
}

impl NodeDefinition {
    pub fn new(name: impl Into<NodeName>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// The ring entry for this node.
    pub fn ring_node(&self) -> RingNode {
        RingNode::new(self.name.clone(), self.host.clone(), self.port)
    }
}

/// Parse a pool file: one `name host port` per line. Blank lines and lines
/// starting with `#` are skipped.
pub fn parse_pool(text: &str) -> Result<Vec<NodeDefinition>> {
    text.lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(idx, line)| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, host, port] => port
                    .parse()
                    .map(|port| NodeDefinition::new(*name, *host, port))
                    .map_err(|_| Error::Config(format!("line {}: bad port {:?}", idx + 1, port))),
                _ => Err(Error::Config(format!(
                    "line {}: expected `name host port`",
                    idx + 1
                ))),
            }
        })
        .collect()
}

/// Starts node processes.
///
/// Launching only has to get the process going; the coordinator confirms the
/// join separately through the coordination service.
#[async_trait]
pub trait NodeLauncher: Send + Sync + 'static {
    async fn launch(&self, node: &NodeDefinition, config: &CoordinatorConfig) -> Result<()>;
}

/// Launches nodes by running a command template, ssh by default.
#[derive(Debug, Default)]
pub struct SshLauncher;

impl SshLauncher {
    pub fn new() -> Self {
        Self
    }
}

/// Fill a launch template for one node, split into program and arguments.
pub fn render_launch_command(
    node: &NodeDefinition,
    config: &CoordinatorConfig,
) -> Option<(String, Vec<String>)> {
    let rendered = config
        .launch_command
        .replace("{host}", &node.host)
        .replace("{port}", &node.port.to_string())
        .replace("{cache_size}", &config.cache_size.to_string())
        .replace("{cache_strategy}", &config.cache_strategy.to_string())
        .replace("{coord_host}", &config.coordination_host)
        .replace("{coord_port}", &config.coordination_port.to_string())
        .replace("{name}", &node.name);
    let mut parts = rendered.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[async_trait]
impl NodeLauncher for SshLauncher {
    async fn launch(&self, node: &NodeDefinition, config: &CoordinatorConfig) -> Result<()> {
        let (program, args) =
            render_launch_command(node, config).ok_or_else(|| MembershipError::LaunchFailed {
                node: node.name.clone(),
                reason: "empty launch command".to_string(),
            })?;
        debug!(node = %node.name, %program, ?args, "Launching node");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MembershipError::LaunchFailed {
                node: node.name.clone(),
                reason: e.to_string(),
            })?;

        let name = node.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!(node = %name, "Launcher exited"),
                Ok(status) => warn!(node = %name, %status, "Launcher exited with failure"),
                Err(e) => warn!(node = %name, error = %e, "Launcher wait failed"),
            }
        });
        info!(node = %node.name, host = %node.host, port = node.port, "Launched node");
        Ok(())
    }
}
