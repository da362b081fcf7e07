//! Gateway over the host's networking state.
//!
//! Everything the plugin does to the kernel goes through the [`NetState`]
//! trait so the managers can be exercised against an in-memory fake
//! ([`fake::FakeNetState`]) instead of real links, routes and namespaces.

use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use serde::Deserialize;
use std::net::IpAddr;
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

pub mod fake;

/// Kernel attributes applied when creating a vxlan link, already parsed
/// and validated from the network's option map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VxlanLinkConfig {
    pub vni: u32,
    pub mtu: Option<u32>,
    pub hardware_addr: Option<String>,
    pub txqlen: Option<u32>,
    pub vtep_dev: Option<String>,
    pub src_addr: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub tos: Option<u8>,
    pub learning: Option<bool>,
    pub proxy: Option<bool>,
    pub rsc: Option<bool>,
    pub l2miss: Option<bool>,
    pub l3miss: Option<bool>,
    pub no_age: bool,
    pub gbp: bool,
    pub age: Option<u32>,
    pub fdb_limit: Option<u32>,
    pub port: Option<u16>,
    pub port_range: Option<(u16, u16)>,
}

/// One route as seen in a routing table
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub dst: IpNetwork,
    pub dev: String,
    pub table: u32,
}

/// One policy routing rule
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEntry {
    pub src: Option<IpNetwork>,
    pub dst: Option<IpNetwork>,
    pub table: u32,
}

/// Capability over host networking primitives. Implementations operate on
/// whatever namespace is current for the calling context; [`NetState::with_netns`]
/// is the only way to change it.
pub trait NetState: Send + Sync {
    /// Index of the named link, or None when it does not exist
    fn link_index(&self, name: &str) -> Result<Option<u32>>;
    /// Create a vxlan link with the given attributes
    fn vxlan_add(&self, name: &str, conf: &VxlanLinkConfig) -> Result<()>;
    /// Create a macvlan link in bridge mode on the given parent
    fn macvlan_add(&self, name: &str, parent: &str) -> Result<()>;
    /// Delete a link by name
    fn link_del(&self, name: &str) -> Result<()>;
    /// Bring a link administratively up
    fn link_set_up(&self, name: &str) -> Result<()>;
    /// Rename a link
    fn link_rename(&self, name: &str, new_name: &str) -> Result<()>;
    /// Move a link into the namespace at the given path
    fn link_set_netns(&self, name: &str, ns_path: &str) -> Result<()>;
    /// Addresses currently assigned to a link
    fn addr_list(&self, dev: &str) -> Result<Vec<IpNetwork>>;
    /// Assign an address to a link
    fn addr_add(&self, dev: &str, addr: IpNetwork) -> Result<()>;
    /// Routes in the given table
    fn route_list(&self, table: u32) -> Result<Vec<RouteEntry>>;
    /// Add a route
    fn route_add(&self, route: &RouteEntry) -> Result<()>;
    /// Add a default route via the given gateway
    fn default_route_add(&self, gateway: IpAddr) -> Result<()>;
    /// All policy routing rules
    fn rule_list(&self) -> Result<Vec<RuleEntry>>;
    /// Add a policy routing rule
    fn rule_add(&self, rule: &RuleEntry) -> Result<()>;
    /// Run `body` with the namespace at `ns_path` current, restoring the
    /// original namespace on every exit path. All namespace-dependent calls
    /// for one logical operation must happen inside a single invocation.
    fn with_netns(
        &self,
        ns_path: &str,
        body: &mut (dyn FnMut(&dyn NetState) -> Result<()> + Send),
    ) -> Result<()>;
}

// Namespace is a per-thread attribute; two interleaved switches would make
// syscalls silently target the wrong namespace. Every switch in this process
// runs under this mutex on its own short-lived OS thread.
static NETNS_SECTION: Mutex<()> = Mutex::new(());

/// Real gateway shelling out to `ip(8)`, reading state back with `ip -j`
pub struct IpGateway;

#[derive(Deserialize)]
struct LinkJson {
    ifindex: u32,
}

#[derive(Deserialize)]
struct AddrInfoJson {
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

#[derive(Deserialize)]
struct AddrJson {
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Deserialize)]
struct RouteJson {
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    dev: Option<String>,
}

#[derive(Deserialize)]
struct RuleJson {
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    srclen: Option<u8>,
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    dstlen: Option<u8>,
    #[serde(default)]
    table: Option<serde_json::Value>,
}

impl IpGateway {
    fn run(&self, args: &[String]) -> Result<String> {
        let rendered = args.join(" ");
        debug!(args = %rendered, "ip");
        let output = Command::new("ip")
            .args(args)
            .output()
            .with_context(|| format!("failed to execute ip {rendered}"))?;
        if !output.status.success() {
            bail!(
                "ip {} failed: {}",
                rendered,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn ip(&self, args: &[&str]) -> Result<String> {
        let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&owned)
    }
}

impl NetState for IpGateway {
    fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let output = Command::new("ip")
            .args(["-j", "link", "show", "dev", name])
            .output()
            .context("failed to execute ip link show")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("does not exist") {
                return Ok(None);
            }
            bail!("ip link show dev {} failed: {}", name, stderr.trim());
        }
        parse_link_index(&output.stdout)
    }

    fn vxlan_add(&self, name: &str, conf: &VxlanLinkConfig) -> Result<()> {
        let mut args: Vec<String> = ["link", "add", "name", name]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(mac) = &conf.hardware_addr {
            args.extend(["address".into(), mac.clone()]);
        }
        if let Some(qlen) = conf.txqlen {
            args.extend(["txqueuelen".into(), qlen.to_string()]);
        }
        if let Some(mtu) = conf.mtu {
            args.extend(["mtu".into(), mtu.to_string()]);
        }
        args.extend(["type".into(), "vxlan".into(), "id".into(), conf.vni.to_string()]);
        if let Some(addr) = conf.src_addr {
            args.extend(["local".into(), addr.to_string()]);
        }
        if let Some(group) = conf.group {
            args.extend(["group".into(), group.to_string()]);
        }
        if let Some(dev) = &conf.vtep_dev {
            args.extend(["dev".into(), dev.clone()]);
        }
        if let Some(ttl) = conf.ttl {
            args.extend(["ttl".into(), ttl.to_string()]);
        }
        if let Some(tos) = conf.tos {
            args.extend(["tos".into(), tos.to_string()]);
        }
        for (flag, value) in [
            ("learning", conf.learning),
            ("proxy", conf.proxy),
            ("rsc", conf.rsc),
            ("l2miss", conf.l2miss),
            ("l3miss", conf.l3miss),
        ] {
            match value {
                Some(true) => args.push(flag.into()),
                Some(false) => args.push(format!("no{flag}")),
                None => {}
            }
        }
        if conf.no_age {
            args.extend(["ageing".into(), "0".into()]);
        } else if let Some(age) = conf.age {
            args.extend(["ageing".into(), age.to_string()]);
        }
        if let Some(limit) = conf.fdb_limit {
            args.extend(["maxaddress".into(), limit.to_string()]);
        }
        if let Some(port) = conf.port {
            args.extend(["dstport".into(), port.to_string()]);
        }
        if let Some((low, high)) = conf.port_range {
            args.extend(["srcport".into(), low.to_string(), high.to_string()]);
        }
        if conf.gbp {
            args.push("gbp".into());
        }
        self.run(&args)?;
        Ok(())
    }

    fn macvlan_add(&self, name: &str, parent: &str) -> Result<()> {
        self.ip(&[
            "link", "add", "name", name, "link", parent, "type", "macvlan", "mode", "bridge",
        ])?;
        Ok(())
    }

    fn link_del(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", "dev", name])?;
        Ok(())
    }

    fn link_set_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn link_rename(&self, name: &str, new_name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "name", new_name])?;
        Ok(())
    }

    fn link_set_netns(&self, name: &str, ns_path: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "netns", ns_path])?;
        Ok(())
    }

    fn addr_list(&self, dev: &str) -> Result<Vec<IpNetwork>> {
        let out = self.ip(&["-j", "addr", "show", "dev", dev])?;
        parse_addr_list(&out)
    }

    fn addr_add(&self, dev: &str, addr: IpNetwork) -> Result<()> {
        self.ip(&["addr", "add", &addr.to_string(), "dev", dev])?;
        Ok(())
    }

    fn route_list(&self, table: u32) -> Result<Vec<RouteEntry>> {
        let out = self.ip(&["-j", "route", "show", "table", &table.to_string()])?;
        parse_route_list(&out, table)
    }

    fn route_add(&self, route: &RouteEntry) -> Result<()> {
        self.ip(&[
            "route",
            "add",
            &route.dst.to_string(),
            "dev",
            &route.dev,
            "table",
            &route.table.to_string(),
        ])?;
        Ok(())
    }

    fn default_route_add(&self, gateway: IpAddr) -> Result<()> {
        self.ip(&["route", "add", "default", "via", &gateway.to_string()])?;
        Ok(())
    }

    fn rule_list(&self) -> Result<Vec<RuleEntry>> {
        let out = self.ip(&["-j", "rule", "show"])?;
        parse_rule_list(&out)
    }

    fn rule_add(&self, rule: &RuleEntry) -> Result<()> {
        let src = rule.src.map_or_else(|| "all".to_string(), |s| s.to_string());
        let dst = rule.dst.map_or_else(|| "all".to_string(), |d| d.to_string());
        self.ip(&[
            "rule",
            "add",
            "from",
            &src,
            "to",
            &dst,
            "table",
            &rule.table.to_string(),
        ])?;
        Ok(())
    }

    fn with_netns(
        &self,
        ns_path: &str,
        body: &mut (dyn FnMut(&dyn NetState) -> Result<()> + Send),
    ) -> Result<()> {
        let _section = NETNS_SECTION
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::thread::scope(|scope| {
            let worker = scope.spawn(move || -> Result<()> {
                let host = open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())
                    .context("failed to open the current network namespace")?;
                let outcome = enter_and_run(self, host, ns_path, body);
                let _ = close(host);
                outcome
            });
            match worker.join() {
                Ok(result) => result,
                Err(_) => bail!("namespace worker thread panicked"),
            }
        })
    }
}

/// Enter the target namespace, run the body, and restore `host` no matter
/// how the body exits. Runs on the pinned worker thread only.
fn enter_and_run(
    gateway: &IpGateway,
    host: i32,
    ns_path: &str,
    body: &mut (dyn FnMut(&dyn NetState) -> Result<()> + Send),
) -> Result<()> {
    let target = open(ns_path, OFlag::O_RDONLY, Mode::empty())
        .with_context(|| format!("failed to open network namespace {ns_path}"))?;
    if let Err(errno) = setns(target, CloneFlags::CLONE_NEWNET) {
        let _ = close(target);
        return Err(errno).with_context(|| format!("failed to enter network namespace {ns_path}"));
    }
    let body_result = body(gateway);
    let restored = setns(host, CloneFlags::CLONE_NEWNET);
    let _ = close(target);
    restored.context("failed to restore the original network namespace")?;
    body_result
}

fn parse_link_index(json: &[u8]) -> Result<Option<u32>> {
    let links: Vec<LinkJson> =
        serde_json::from_slice(json).context("failed to parse ip link output")?;
    Ok(links.first().map(|l| l.ifindex))
}

fn parse_addr_list(json: &str) -> Result<Vec<IpNetwork>> {
    let parsed: Vec<AddrJson> =
        serde_json::from_str(json).context("failed to parse ip addr output")?;
    let mut addrs = Vec::new();
    for entry in parsed {
        for info in entry.addr_info {
            if let (Some(local), Some(prefixlen)) = (info.local, info.prefixlen) {
                if let Ok(net) = format!("{local}/{prefixlen}").parse() {
                    addrs.push(net);
                }
            }
        }
    }
    Ok(addrs)
}

fn parse_route_list(json: &str, table: u32) -> Result<Vec<RouteEntry>> {
    let parsed: Vec<RouteJson> =
        serde_json::from_str(json).context("failed to parse ip route output")?;
    let mut routes = Vec::new();
    for entry in parsed {
        let (Some(dst), Some(dev)) = (entry.dst, entry.dev) else {
            continue;
        };
        if let Ok(dst) = dst.parse() {
            routes.push(RouteEntry { dst, dev, table });
        }
    }
    Ok(routes)
}

fn parse_rule_list(json: &str) -> Result<Vec<RuleEntry>> {
    let parsed: Vec<RuleJson> =
        serde_json::from_str(json).context("failed to parse ip rule output")?;
    let mut rules = Vec::new();
    for entry in parsed {
        let table = match entry.table {
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        };
        rules.push(RuleEntry {
            src: rule_net(entry.src, entry.srclen),
            dst: rule_net(entry.dst, entry.dstlen),
            table,
        });
    }
    Ok(rules)
}

// `ip -j rule` splits a selector into an address and a separate
// srclen/dstlen; the length is omitted when the prefix is full width
fn rule_net(addr: Option<String>, len: Option<u8>) -> Option<IpNetwork> {
    let addr = addr.filter(|a| a != "all")?;
    let ip: IpAddr = addr.parse().ok()?;
    match len {
        Some(len) => IpNetwork::new(ip, len).ok(),
        None => Some(ip.into()),
    }
}
