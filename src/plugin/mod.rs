//! The per-invocation state machine: resolve which network applies, take
//! that network's lock, then drive the host interface manager and the IPAM
//! invoker through ADD, DEL or CHECK.

use anyhow::anyhow;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, NetworkSpec, ADDRESS_ANNOTATION, NETWORK_ANNOTATION};
use crate::error::CniError;
use crate::hostiface::HostInterface;
use crate::ipam::IpamInvoker;
use crate::lock::NamedLock;
use crate::netstate::NetState;
use crate::types::{CmdArgs, Interface, Result as CniResult, Route};

/// The three commands that run inside a network's critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
}

/// Output of one dispatched command
#[derive(Debug)]
pub enum CommandOutput {
    Add(CniResult),
    Del(TeardownReport),
    Check,
}

/// One recorded teardown failure
#[derive(Debug)]
pub struct TeardownFailure {
    pub step: &'static str,
    pub error: String,
}

/// Accumulated per-step outcomes of a DEL. Teardown never aborts on an
/// individual step; failures are recorded here so callers and tests can see
/// exactly which steps went wrong without parsing logs.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    fn record(&mut self, step: &'static str, error: anyhow::Error) {
        warn!(step, error = %format!("{error:#}"), "teardown step failed, continuing");
        self.failures.push(TeardownFailure {
            step,
            error: format!("{error:#}"),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// VXLAN plugin orchestrator
pub struct VxlanPlugin {
    config: Config,
    args: CmdArgs,
    net: Arc<dyn NetState>,
    ipam: IpamInvoker,
}

impl VxlanPlugin {
    pub fn new(config: Config, args: CmdArgs, net: Arc<dyn NetState>, ipam: IpamInvoker) -> Self {
        Self {
            config,
            args,
            net,
            ipam,
        }
    }

    /// Which configured network this request applies to. Precedence:
    /// annotation-supplied name, then the orchestrator namespace when
    /// configured, then the default network. Runs before the lock is taken.
    pub fn resolve_network(&self) -> Result<&NetworkSpec, CniError> {
        let mut network = self
            .config
            .args
            .as_ref()
            .and_then(|a| a.annotations.get(NETWORK_ANNOTATION))
            .filter(|n| !n.is_empty())
            .cloned();

        if network.is_none() && self.config.network_from_namespace {
            network = self
                .args
                .args
                .get("K8S_POD_NAMESPACE")
                .filter(|n| !n.is_empty())
                .cloned();
        }

        if network.is_none() {
            network = self
                .config
                .default_network
                .clone()
                .filter(|n| !n.is_empty());
        }

        let network = network.ok_or(CniError::NoNetwork)?;
        self.config
            .network(&network)
            .ok_or(CniError::NoMatchingNetwork(network))
    }

    /// Resolve the network, hold its lock for the duration of the command,
    /// and dispatch. The lock is released on every path out, including
    /// errors, via its drop guard.
    pub async fn execute(&self, command: Command) -> Result<CommandOutput, CniError> {
        let spec = self.resolve_network()?.clone();
        info!(?command, network = %spec.name, container = %self.args.container_id, "dispatching");

        let _lock = NamedLock::acquire(&spec.name).map_err(CniError::Lock)?;
        match command {
            Command::Add => self.add_network(&spec).await.map(CommandOutput::Add),
            Command::Del => Ok(CommandOutput::Del(self.del_network(&spec).await)),
            Command::Check => {
                // intended to validate that ADD's effects still hold; for
                // now CHECK always reports success
                Ok(CommandOutput::Check)
            }
        }
    }

    async fn add_network(&self, spec: &NetworkSpec) -> Result<CniResult, CniError> {
        let hi = HostInterface::new(spec.clone(), self.net.clone());
        let gateway = hi.gateway().map_err(CniError::Interface)?;

        // candidate address handed to the allocator as context; the
        // allocator's answer is the authoritative one
        let candidate = self.candidate_address(&gateway);

        hi.ensure().map_err(CniError::Interface)?;

        let mut result = self
            .ipam
            .allocate(&candidate, spec.exclude_first, spec.exclude_last)
            .await
            .map_err(CniError::Allocation)?;

        let address_str = result
            .first_address()
            .ok_or_else(|| CniError::ResultAssembly("IPAM result missing an address".into()))?;
        let address: IpNetwork = address_str
            .parse()
            .map_err(|e| CniError::Allocation(anyhow!("unparsable IPAM address {address_str:?}: {e}")))?;
        debug!(address = %address, "IPAM returned address");

        let link_index =
            match hi.attach_container_link(&self.args.netns, &self.args.ifname, address) {
                Ok(index) => index,
                Err(attach_err) => {
                    // the allocation must not be orphaned silently; release
                    // it and surface the original attach error
                    if let Err(release_err) = self.ipam.release(&address_str).await {
                        error!(error = %format!("{release_err:#}"), "failure while running IPAM delete");
                    }
                    return Err(CniError::Interface(attach_err));
                }
            };

        result.add_interface(Interface {
            name: self.args.ifname.clone(),
            mac: None,
            sandbox: Some(self.args.netns.clone()),
        });
        let gateway_ip = gateway.ip();
        match result.ips.as_mut().and_then(|ips| ips.first_mut()) {
            Some(ip) => {
                ip.gateway = Some(gateway_ip.to_string());
                ip.interface = Some(link_index as usize);
            }
            None => {
                return Err(CniError::ResultAssembly(
                    "IPAM result lost its address record".into(),
                ))
            }
        }
        result.add_route(Route {
            dst: default_route_destination(&gateway_ip),
            gw: Some(gateway_ip.to_string()),
        });
        if result.cni_version.is_empty() {
            result.cni_version = self.config.cni_version.clone();
        }

        Ok(result)
    }

    /// Best-effort teardown: every step runs regardless of earlier
    /// failures, and the command as a whole always succeeds.
    async fn del_network(&self, spec: &NetworkSpec) -> TeardownReport {
        let mut report = TeardownReport::default();
        let hi = HostInterface::new(spec.clone(), self.net.clone());

        debug!("ensuring host interface");
        if let Err(e) = hi.ensure() {
            report.record("ensure host interface", e);
        }

        debug!("deleting container link");
        if let Err(e) = hi.detach_container_link(&self.args.netns, &self.args.ifname) {
            report.record("detach container link", e);
        }

        if let Some(address) = self
            .config
            .prev_result
            .as_ref()
            .and_then(|r| r.first_address())
        {
            if let Err(e) = self.ipam.release(&address).await {
                report.record("release address", e);
            }
        }
        // TODO: if this was the last container link, tear down the host
        // interface pair (blocked on HostInterface::delete)

        report
    }

    /// Network-id of the CIDR, overridden by an in-subnet requested address
    fn candidate_address(&self, gateway: &IpNetwork) -> String {
        let requested = self
            .config
            .args
            .as_ref()
            .and_then(|a| a.annotations.get(ADDRESS_ANNOTATION));
        if let Some(requested) = requested {
            if let Ok(ip) = requested.parse::<IpAddr>() {
                if gateway.contains(ip) {
                    if let Ok(net) = IpNetwork::new(ip, gateway.prefix()) {
                        return net.to_string();
                    }
                }
            }
        }
        gateway.to_string()
    }
}

fn default_route_destination(gateway: &IpAddr) -> String {
    match gateway {
        IpAddr::V4(_) => "0.0.0.0/0".to_string(),
        IpAddr::V6(_) => "::/0".to_string(),
    }
}
