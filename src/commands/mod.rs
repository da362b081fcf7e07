//! Invocation scaffolding: environment and stdin parsing, command
//! dispatch, and the supported-versions report.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::CniError;
use crate::ipam::IpamInvoker;
use crate::netstate::IpGateway;
use crate::plugin::{Command, CommandOutput, VxlanPlugin};
use crate::types::CmdArgs;

/// CNI specification version this plugin implements
pub const CNI_VERSION: &str = "1.0.0";

/// Parse command arguments from the environment and stdin. The command
/// itself is handled separately; everything else defaults to empty, the
/// orchestrator decides what is required per command.
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID").unwrap_or_default();
    let netns = env::var("CNI_NETNS").unwrap_or_default();
    let ifname = env::var("CNI_IFNAME").unwrap_or_default();
    let path = env::var("CNI_PATH").unwrap_or_default();
    let args = parse_cni_args(&env::var("CNI_ARGS").unwrap_or_default());

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse a `CNI_ARGS` string into key/value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();
    for pair in args_str.split(';').filter(|p| !p.is_empty()) {
        if let Some(idx) = pair.find('=') {
            args.insert(pair[..idx].to_string(), pair[idx + 1..].to_string());
        }
    }
    args
}

fn version_payload() -> String {
    format!(
        r#"{{"cniVersion": "{CNI_VERSION}", "supportedVersions": ["0.3.0", "0.3.1", "0.4.0", "{CNI_VERSION}"]}}"#
    )
}

/// Run one plugin invocation. Returns the payload to print on stdout, if
/// any; errors map to exit codes via [`CniError::exit_code`].
pub fn run_cni() -> Result<Option<String>, CniError> {
    let command = env::var("CNI_COMMAND")
        .map_err(|_| CniError::InvalidCommand("<unset>".to_string()))?;
    debug!(command, "CNI invocation");

    // VERSION touches neither the lock nor kernel state
    if command == "VERSION" {
        return Ok(Some(version_payload()));
    }

    let command = match command.as_str() {
        "ADD" => Command::Add,
        "DEL" => Command::Del,
        "CHECK" => Command::Check,
        other => return Err(CniError::InvalidCommand(other.to_string())),
    };

    let args = parse_args().map_err(CniError::Parse)?;
    if args.stdin_data.is_empty() {
        return Err(CniError::Parse(anyhow!("no bytes sent on stdin")));
    }
    let config = Config::parse(&args.stdin_data).map_err(CniError::Parse)?;

    let ipam_type = config
        .ipam
        .as_ref()
        .map(|i| i.plugin_type.clone())
        .unwrap_or_default();
    let ipam = IpamInvoker::from_search_path(&args.path, &ipam_type);
    let plugin = VxlanPlugin::new(config, args, Arc::new(IpGateway), ipam);

    let runtime = Runtime::new().map_err(|e| CniError::Interface(anyhow!(e)))?;
    match runtime.block_on(plugin.execute(command))? {
        CommandOutput::Add(result) => {
            let rendered = result
                .marshal()
                .map_err(|e| CniError::ResultAssembly(e.to_string()))?;
            Ok(Some(rendered))
        }
        CommandOutput::Del(report) => {
            if !report.is_clean() {
                warn!(
                    failures = report.failures.len(),
                    "teardown finished with recorded failures"
                );
            }
            Ok(None)
        }
        CommandOutput::Check => Ok(None),
    }
}
