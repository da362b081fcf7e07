//! In-memory [`NetState`] used by the test suite. Models per-namespace
//! link/address/route/rule tables, counts mutating calls, and supports
//! injecting failures into individual operations.

use anyhow::{bail, Result};
use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use super::{NetState, RouteEntry, RuleEntry, VxlanLinkConfig};

/// Key under which the host (root) namespace is stored
pub const HOST_NS: &str = "/host";

#[derive(Debug, Clone, PartialEq)]
pub enum FakeLinkKind {
    Vxlan(VxlanLinkConfig),
    Macvlan { parent: String },
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub index: u32,
    pub kind: FakeLinkKind,
    pub up: bool,
    pub addrs: Vec<IpNetwork>,
}

#[derive(Debug, Default)]
struct NsTables {
    links: HashMap<String, FakeLink>,
    routes: Vec<RouteEntry>,
    rules: Vec<RuleEntry>,
    default_routes: Vec<IpAddr>,
}

#[derive(Debug)]
struct Inner {
    namespaces: HashMap<String, NsTables>,
    current: String,
    next_index: u32,
    mutations: u64,
    fail_ops: HashSet<&'static str>,
}

pub struct FakeNetState {
    inner: Mutex<Inner>,
}

impl Default for FakeNetState {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNetState {
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(HOST_NS.to_string(), NsTables::default());
        Self {
            inner: Mutex::new(Inner {
                namespaces,
                current: HOST_NS.to_string(),
                next_index: 1,
                mutations: 0,
                fail_ops: HashSet::new(),
            }),
        }
    }

    /// Register a namespace so `with_netns` and link moves can target it
    pub fn add_namespace(&self, path: &str) {
        let mut inner = self.lock();
        inner.namespaces.entry(path.to_string()).or_default();
    }

    /// Make the named operation fail until cleared
    pub fn fail_on(&self, op: &'static str) {
        self.lock().fail_ops.insert(op);
    }

    pub fn clear_failures(&self) {
        self.lock().fail_ops.clear();
    }

    /// Number of mutating gateway calls made so far
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    /// The namespace currently active for gateway calls
    pub fn current_namespace(&self) -> String {
        self.lock().current.clone()
    }

    /// Snapshot of a link in the given namespace
    pub fn link(&self, ns: &str, name: &str) -> Option<FakeLink> {
        self.lock()
            .namespaces
            .get(ns)
            .and_then(|tables| tables.links.get(name))
            .cloned()
    }

    pub fn routes(&self, ns: &str) -> Vec<RouteEntry> {
        self.lock()
            .namespaces
            .get(ns)
            .map(|t| t.routes.clone())
            .unwrap_or_default()
    }

    pub fn rules(&self, ns: &str) -> Vec<RuleEntry> {
        self.lock()
            .namespaces
            .get(ns)
            .map(|t| t.rules.clone())
            .unwrap_or_default()
    }

    pub fn default_routes(&self, ns: &str) -> Vec<IpAddr> {
        self.lock()
            .namespaces
            .get(ns)
            .map(|t| t.default_routes.clone())
            .unwrap_or_default()
    }

    /// Strip every address from a link, simulating plumbing that pre-exists
    /// without its gateway address
    pub fn clear_addresses(&self, ns: &str, name: &str) {
        let mut inner = self.lock();
        if let Some(link) = inner
            .namespaces
            .get_mut(ns)
            .and_then(|t| t.links.get_mut(name))
        {
            link.addrs.clear();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_fail(inner: &Inner, op: &'static str) -> Result<()> {
        if inner.fail_ops.contains(op) {
            bail!("injected failure: {op}");
        }
        Ok(())
    }
}

impl Inner {
    fn current_tables(&mut self) -> &mut NsTables {
        self.namespaces
            .entry(self.current.clone())
            .or_default()
    }
}

impl NetState for FakeNetState {
    fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "link_index")?;
        Ok(inner.current_tables().links.get(name).map(|l| l.index))
    }

    fn vxlan_add(&self, name: &str, conf: &VxlanLinkConfig) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "vxlan_add")?;
        if inner.current_tables().links.contains_key(name) {
            bail!("link {name:?} already exists");
        }
        inner.mutations += 1;
        let index = inner.next_index;
        inner.next_index += 1;
        inner.current_tables().links.insert(
            name.to_string(),
            FakeLink {
                index,
                kind: FakeLinkKind::Vxlan(conf.clone()),
                up: false,
                addrs: Vec::new(),
            },
        );
        Ok(())
    }

    fn macvlan_add(&self, name: &str, parent: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "macvlan_add")?;
        if !inner.current_tables().links.contains_key(parent) {
            bail!("parent link {parent:?} does not exist");
        }
        if inner.current_tables().links.contains_key(name) {
            bail!("link {name:?} already exists");
        }
        inner.mutations += 1;
        let index = inner.next_index;
        inner.next_index += 1;
        inner.current_tables().links.insert(
            name.to_string(),
            FakeLink {
                index,
                kind: FakeLinkKind::Macvlan {
                    parent: parent.to_string(),
                },
                up: false,
                addrs: Vec::new(),
            },
        );
        Ok(())
    }

    fn link_del(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "link_del")?;
        if inner.current_tables().links.remove(name).is_none() {
            bail!("link {name:?} does not exist");
        }
        inner.mutations += 1;
        Ok(())
    }

    fn link_set_up(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "link_set_up")?;
        match inner.current_tables().links.get_mut(name) {
            Some(link) => link.up = true,
            None => bail!("link {name:?} does not exist"),
        }
        inner.mutations += 1;
        Ok(())
    }

    fn link_rename(&self, name: &str, new_name: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "link_rename")?;
        let tables = inner.current_tables();
        match tables.links.remove(name) {
            Some(link) => {
                tables.links.insert(new_name.to_string(), link);
            }
            None => bail!("link {name:?} does not exist"),
        }
        inner.mutations += 1;
        Ok(())
    }

    fn link_set_netns(&self, name: &str, ns_path: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "link_set_netns")?;
        if !inner.namespaces.contains_key(ns_path) {
            bail!("no such network namespace: {ns_path:?}");
        }
        let link = match inner.current_tables().links.remove(name) {
            Some(link) => link,
            None => bail!("link {name:?} does not exist"),
        };
        inner
            .namespaces
            .entry(ns_path.to_string())
            .or_default()
            .links
            .insert(name.to_string(), link);
        inner.mutations += 1;
        Ok(())
    }

    fn addr_list(&self, dev: &str) -> Result<Vec<IpNetwork>> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "addr_list")?;
        match inner.current_tables().links.get(dev) {
            Some(link) => Ok(link.addrs.clone()),
            None => bail!("link {dev:?} does not exist"),
        }
    }

    fn addr_add(&self, dev: &str, addr: IpNetwork) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "addr_add")?;
        match inner.current_tables().links.get_mut(dev) {
            Some(link) => {
                if link.addrs.contains(&addr) {
                    bail!("address {addr} already assigned to {dev:?}");
                }
                link.addrs.push(addr);
            }
            None => bail!("link {dev:?} does not exist"),
        }
        inner.mutations += 1;
        Ok(())
    }

    fn route_list(&self, table: u32) -> Result<Vec<RouteEntry>> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "route_list")?;
        Ok(inner
            .current_tables()
            .routes
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    fn route_add(&self, route: &RouteEntry) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "route_add")?;
        inner.mutations += 1;
        inner.current_tables().routes.push(route.clone());
        Ok(())
    }

    fn default_route_add(&self, gateway: IpAddr) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "default_route_add")?;
        inner.mutations += 1;
        inner.current_tables().default_routes.push(gateway);
        Ok(())
    }

    fn rule_list(&self) -> Result<Vec<RuleEntry>> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "rule_list")?;
        Ok(inner.current_tables().rules.clone())
    }

    fn rule_add(&self, rule: &RuleEntry) -> Result<()> {
        let mut inner = self.lock();
        Self::check_fail(&inner, "rule_add")?;
        inner.mutations += 1;
        inner.current_tables().rules.push(rule.clone());
        Ok(())
    }

    fn with_netns(
        &self,
        ns_path: &str,
        body: &mut (dyn FnMut(&dyn NetState) -> Result<()> + Send),
    ) -> Result<()> {
        let previous = {
            let mut inner = self.lock();
            Self::check_fail(&inner, "with_netns")?;
            if !inner.namespaces.contains_key(ns_path) {
                bail!("no such network namespace: {ns_path:?}");
            }
            let previous = inner.current.clone();
            inner.current = ns_path.to_string();
            previous
        };
        let result = body(self);
        self.lock().current = previous;
        result
    }
}
