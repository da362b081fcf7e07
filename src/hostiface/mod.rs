//! The host's connection to one vxlan overlay.
//!
//! A host interface is a pair of links: a vxlan device participating in the
//! cluster's overlay and a macvlan slave of it acting as the host's own
//! attachment, carrying the network's gateway address. A bypass route and
//! policy rule in a dedicated table keep intra-overlay traffic on the
//! macvlan instead of the host's default route. The authoritative state
//! lives in the kernel, so everything is rediscovered by live query on each
//! invocation rather than cached.

use anyhow::{anyhow, bail, Context, Result};
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::config::NetworkSpec;
use crate::netstate::{NetState, RouteEntry, RuleEntry, VxlanLinkConfig};

/// Route table holding the bypass routes that override per-address routes
pub const VXLAN_ROUTE_TABLE: u32 = 192;

/// Manager for one network's host plumbing and container attachments
pub struct HostInterface {
    spec: NetworkSpec,
    vx_name: String,
    mv_name: String,
    net: Arc<dyn NetState>,
}

impl HostInterface {
    /// Cheap handle; performs no kernel calls until `ensure` or an
    /// attach/detach is invoked
    pub fn new(spec: NetworkSpec, net: Arc<dyn NetState>) -> Self {
        let vx_name = format!("vx_{}", spec.name);
        let mv_name = format!("mv_{}", spec.name);
        Self {
            spec,
            vx_name,
            mv_name,
            net,
        }
    }

    pub fn vx_name(&self) -> &str {
        &self.vx_name
    }

    pub fn mv_name(&self) -> &str {
        &self.mv_name
    }

    /// The gateway address: the network-id address of the configured CIDR,
    /// with the CIDR's prefix length
    pub fn gateway(&self) -> Result<IpNetwork> {
        let cidr: IpNetwork = self
            .spec
            .cidr
            .parse()
            .with_context(|| format!("invalid cidr {:?}", self.spec.cidr))?;
        Ok(IpNetwork::new(cidr.network(), cidr.prefix())?)
    }

    /// Discover-or-create the vxlan/macvlan pair, gateway address, and
    /// bypass route/rule. Idempotent: with unchanged kernel state a repeat
    /// call performs zero mutating operations. Partial state left behind by
    /// a failure is completed by a future invocation.
    pub fn ensure(&self) -> Result<()> {
        let gateway = self.gateway()?;
        let vx_exists = self.net.link_index(&self.vx_name)?.is_some();
        let mv_exists = self.net.link_index(&self.mv_name)?.is_some();

        if vx_exists && mv_exists && self.has_address(&gateway)? {
            debug!("found existing host interface, returning");
            return Ok(());
        }

        // host interface is incomplete, try to rebuild it
        if !vx_exists {
            debug!(name = %self.vx_name, "vxlan link missing, creating");
            let conf = vxlan_link_config(&self.spec)?;
            self.net.vxlan_add(&self.vx_name, &conf)?;
            self.net.link_set_up(&self.vx_name)?;
        }

        if !mv_exists {
            debug!(name = %self.mv_name, "macvlan link missing, creating");
            self.net.macvlan_add(&self.mv_name, &self.vx_name)?;
            self.net.addr_add(&self.mv_name, gateway)?;
            self.net.link_set_up(&self.mv_name)?;
        }

        debug!("validating/adding bypass route");
        self.check_or_add_bypass_route(&gateway)?;

        debug!("validating/adding bypass rule");
        self.check_or_add_bypass_rule(&gateway)?;

        if !self.has_address(&gateway)? {
            debug!(name = %self.mv_name, "macvlan missing gateway address, adding");
            self.net.addr_add(&self.mv_name, gateway)?;
        }

        Ok(())
    }

    fn has_address(&self, addr: &IpNetwork) -> Result<bool> {
        if self.net.link_index(&self.mv_name)?.is_none() {
            return Ok(false);
        }
        let addrs = self.net.addr_list(&self.mv_name)?;
        Ok(addrs
            .iter()
            .any(|a| a.ip() == addr.ip() && a.prefix() == addr.prefix()))
    }

    fn check_or_add_bypass_route(&self, subnet: &IpNetwork) -> Result<()> {
        let routes = self.net.route_list(VXLAN_ROUTE_TABLE)?;
        if routes
            .iter()
            .any(|r| r.dst == *subnet && r.dev == self.mv_name)
        {
            debug!("bypass route found, return");
            return Ok(());
        }
        self.net.route_add(&RouteEntry {
            dst: *subnet,
            dev: self.mv_name.clone(),
            table: VXLAN_ROUTE_TABLE,
        })
    }

    fn check_or_add_bypass_rule(&self, subnet: &IpNetwork) -> Result<()> {
        let rules = self.net.rule_list()?;
        if rules.iter().any(|r| {
            r.src == Some(*subnet) && r.dst == Some(*subnet) && r.table == VXLAN_ROUTE_TABLE
        }) {
            debug!("bypass rule found, return");
            return Ok(());
        }
        self.net.rule_add(&RuleEntry {
            src: Some(*subnet),
            dst: Some(*subnet),
            table: VXLAN_ROUTE_TABLE,
        })
    }

    /// Create a macvlan slave for a container, move it into the namespace at
    /// `ns_path`, rename it to `ifname`, assign `addr`, bring it up, and
    /// install a default route via the gateway. Returns the host-side link
    /// index. A partially created device is not cleaned up here; the caller
    /// owns any compensating action.
    pub fn attach_container_link(
        &self,
        ns_path: &str,
        ifname: &str,
        addr: IpNetwork,
    ) -> Result<u32> {
        let segments: Vec<&str> = ns_path.split('/').collect();
        if segments.len() < 3 {
            bail!("unexpected namespace path format: {ns_path:?}");
        }

        // temp name keyed to the namespace path so concurrent attachments
        // cannot collide in the host namespace before the move
        let temp_name = format!("cmvl_{}", segments[2]);
        debug!(temp_name, "temporary container link name");

        self.net.macvlan_add(&temp_name, &self.vx_name)?;
        let index = self
            .net
            .link_index(&temp_name)?
            .ok_or_else(|| anyhow!("link {temp_name:?} vanished after creation"))?;

        self.net.link_set_netns(&temp_name, ns_path)?;

        let gateway_ip = self.gateway()?.ip();
        self.net.with_netns(ns_path, &mut |net| {
            net.link_rename(&temp_name, ifname)?;
            net.link_set_up(ifname)?;
            net.addr_add(ifname, addr)?;
            net.default_route_add(gateway_ip)
        })?;

        Ok(index)
    }

    /// Delete the container's interface inside its namespace. A missing
    /// namespace or device surfaces as an error and is not retried.
    pub fn detach_container_link(&self, ns_path: &str, ifname: &str) -> Result<()> {
        self.net.with_netns(ns_path, &mut |net| {
            if net.link_index(ifname)?.is_none() {
                bail!("link {ifname:?} not found in namespace {ns_path:?}");
            }
            net.link_del(ifname)
        })
    }

    /// Full teardown of the network's host plumbing.
    pub fn delete(&self) -> Result<()> {
        debug!("HostInterface::delete()");
        // TODO:
        // remove bypass rule
        // remove bypass route
        // delete vxlan (should cascade delete address and macvlan)
        Ok(())
    }
}

/// Translate the spec's option map into kernel link attributes. A malformed
/// value for a recognized key is rejected before any mutation; unrecognized
/// keys are ignored, the option set is open.
fn vxlan_link_config(spec: &NetworkSpec) -> Result<VxlanLinkConfig> {
    let opts = &spec.options;
    let mut conf = VxlanLinkConfig {
        vni: spec.id,
        mtu: spec.mtu,
        ..Default::default()
    };

    if let Some(mac) = opts.get("vxlanhardwareaddr") {
        conf.hardware_addr = Some(parse_mac(mac)?);
    }
    conf.txqlen = parse_opt(opts, "vxlantxqlen")?;
    conf.vtep_dev = opts.get("vtepdev").cloned();
    conf.src_addr = parse_opt(opts, "srcaddr")?;
    conf.group = parse_opt(opts, "group")?;
    conf.ttl = parse_opt(opts, "ttl")?;
    conf.tos = parse_opt(opts, "tos")?;
    conf.learning = parse_opt(opts, "learning")?;
    conf.proxy = parse_opt(opts, "proxy")?;
    conf.rsc = parse_opt(opts, "rsc")?;
    conf.l2miss = parse_opt(opts, "l2miss")?;
    conf.l3miss = parse_opt(opts, "l3miss")?;
    conf.no_age = parse_opt(opts, "noage")?.unwrap_or(false);
    conf.gbp = parse_opt(opts, "gbp")?.unwrap_or(false);
    conf.age = parse_opt(opts, "age")?;
    conf.fdb_limit = parse_opt(opts, "limit")?;
    conf.port = parse_opt(opts, "port")?;

    if conf.no_age && conf.age.is_some() {
        bail!("options \"age\" and \"noage\" are mutually exclusive");
    }

    let port_low: Option<u16> = parse_opt(opts, "portlow")?;
    let port_high: Option<u16> = parse_opt(opts, "porthigh")?;
    conf.port_range = match (port_low, port_high) {
        (Some(low), Some(high)) if low <= high => Some((low, high)),
        (Some(low), Some(high)) => {
            bail!("portlow {low} exceeds porthigh {high}")
        }
        (None, None) => None,
        _ => bail!("options \"portlow\" and \"porthigh\" must be set together"),
    };

    Ok(conf)
}

fn parse_opt<T: FromStr>(opts: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match opts.get(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid value {value:?} for option {key:?}: {e}")),
        None => Ok(None),
    }
}

fn parse_mac(s: &str) -> Result<String> {
    let bytes: Vec<&str> = s.split(':').collect();
    let valid = bytes.len() == 6
        && bytes
            .iter()
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        bail!("invalid hardware address {s:?}");
    }
    Ok(s.to_ascii_lowercase())
}
