use std::collections::HashMap;
use std::sync::Arc;

use vxlan_cni::config::NetworkSpec;
use vxlan_cni::hostiface::{HostInterface, VXLAN_ROUTE_TABLE};
use vxlan_cni::lock::NamedLock;
use vxlan_cni::netstate::fake::{FakeLinkKind, FakeNetState, HOST_NS};

fn spec(name: &str, cidr: &str) -> NetworkSpec {
    NetworkSpec {
        id: 42,
        name: name.to_string(),
        cidr: cidr.to_string(),
        exclude_first: 0,
        exclude_last: 0,
        options: HashMap::new(),
        mtu: None,
    }
}

#[test]
fn ensure_creates_full_plumbing() {
    let net = Arc::new(FakeNetState::new());
    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());

    hi.ensure().unwrap();

    let vx = net.link(HOST_NS, "vx_app").expect("vxlan link created");
    assert!(vx.up);
    match vx.kind {
        FakeLinkKind::Vxlan(conf) => assert_eq!(conf.vni, 42),
        other => panic!("unexpected link kind: {other:?}"),
    }

    let mv = net.link(HOST_NS, "mv_app").expect("macvlan link created");
    assert!(mv.up);
    assert_eq!(mv.kind, FakeLinkKind::Macvlan { parent: "vx_app".to_string() });
    assert_eq!(mv.addrs, vec!["10.1.0.0/24".parse().unwrap()]);

    let routes = net.routes(HOST_NS);
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].dst, "10.1.0.0/24".parse().unwrap());
    assert_eq!(routes[0].dev, "mv_app");
    assert_eq!(routes[0].table, VXLAN_ROUTE_TABLE);

    let rules = net.rules(HOST_NS);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].src, Some("10.1.0.0/24".parse().unwrap()));
    assert_eq!(rules[0].dst, Some("10.1.0.0/24".parse().unwrap()));
    assert_eq!(rules[0].table, VXLAN_ROUTE_TABLE);
}

#[test]
fn ensure_is_idempotent() {
    let net = Arc::new(FakeNetState::new());
    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());

    hi.ensure().unwrap();
    let after_first = net.mutation_count();

    hi.ensure().unwrap();
    assert_eq!(net.mutation_count(), after_first, "second ensure must not mutate");
    assert_eq!(net.routes(HOST_NS).len(), 1, "bypass route must not duplicate");
    assert_eq!(net.rules(HOST_NS).len(), 1, "bypass rule must not duplicate");
}

#[test]
fn gateway_is_the_network_id_of_the_cidr() {
    let net = Arc::new(FakeNetState::new());

    let hi = HostInterface::new(spec("a", "10.1.0.0/24"), net.clone());
    assert_eq!(hi.gateway().unwrap().to_string(), "10.1.0.0/24");
    assert_eq!(hi.gateway().unwrap().ip().to_string(), "10.1.0.0");

    let hi = HostInterface::new(spec("b", "192.168.5.0/28"), net.clone());
    assert_eq!(hi.gateway().unwrap().ip().to_string(), "192.168.5.0");

    // a host address in the cidr still derives the network id
    let hi = HostInterface::new(spec("c", "10.1.0.5/24"), net);
    assert_eq!(hi.gateway().unwrap().to_string(), "10.1.0.0/24");
}

#[test]
fn ensure_repairs_a_macvlan_missing_its_gateway_address() {
    let net = Arc::new(FakeNetState::new());
    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());
    hi.ensure().unwrap();

    net.clear_addresses(HOST_NS, "mv_app");
    let before = net.mutation_count();

    hi.ensure().unwrap();
    let mv = net.link(HOST_NS, "mv_app").unwrap();
    assert_eq!(mv.addrs, vec!["10.1.0.0/24".parse().unwrap()]);
    assert_eq!(net.mutation_count(), before + 1, "only the address add may mutate");
}

#[test]
fn malformed_option_values_fail_before_any_mutation() {
    let net = Arc::new(FakeNetState::new());
    let mut bad = spec("app", "10.1.0.0/24");
    bad.options.insert("ttl".to_string(), "junk".to_string());

    let hi = HostInterface::new(bad, net.clone());
    assert!(hi.ensure().is_err());
    assert_eq!(net.mutation_count(), 0);
    assert!(net.link(HOST_NS, "vx_app").is_none());
}

#[test]
fn concurrent_ensure_serialized_by_lock_performs_no_extra_mutations() {
    // baseline: one ensure against a fresh fake
    let baseline = Arc::new(FakeNetState::new());
    HostInterface::new(spec("app", "10.1.0.0/24"), baseline.clone())
        .ensure()
        .unwrap();
    let single_run = baseline.mutation_count();

    let net = Arc::new(FakeNetState::new());
    let lock_dir = tempfile::tempdir().unwrap();
    let lock_name = format!("ensure-race-{}", std::process::id());

    let mut handles = Vec::new();
    for _ in 0..2 {
        let net = net.clone();
        let dir = lock_dir.path().to_path_buf();
        let name = lock_name.clone();
        handles.push(std::thread::spawn(move || {
            let lock = NamedLock::acquire_in(&dir, &name).unwrap();
            HostInterface::new(spec("app", "10.1.0.0/24"), net)
                .ensure()
                .unwrap();
            lock.release();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // the loser of the lock race observes the fully wired pair and mutates
    // nothing
    assert_eq!(net.mutation_count(), single_run);
    assert_eq!(net.routes(HOST_NS).len(), 1);
    assert_eq!(net.rules(HOST_NS).len(), 1);
}

#[test]
fn attach_wires_the_container_link_and_restores_the_namespace() {
    let net = Arc::new(FakeNetState::new());
    let ns = "/proc/4242/ns/net";
    net.add_namespace(ns);

    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());
    hi.ensure().unwrap();

    let index = hi
        .attach_container_link(ns, "eth0", "10.1.0.5/24".parse().unwrap())
        .unwrap();
    assert!(index > 0);

    let link = net.link(ns, "eth0").expect("container link in namespace");
    assert!(link.up);
    assert_eq!(link.addrs, vec!["10.1.0.5/24".parse().unwrap()]);
    assert_eq!(net.default_routes(ns), vec!["10.1.0.0".parse::<std::net::IpAddr>().unwrap()]);

    // the temp name derives from the pid segment of the namespace path and
    // must not linger in the host namespace
    assert!(net.link(HOST_NS, "cmvl_4242").is_none());
    assert_eq!(net.current_namespace(), HOST_NS);
}

#[test]
fn attach_failure_still_restores_the_namespace() {
    let net = Arc::new(FakeNetState::new());
    let ns = "/proc/4242/ns/net";
    net.add_namespace(ns);

    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());
    hi.ensure().unwrap();

    net.fail_on("addr_add");
    let err = hi
        .attach_container_link(ns, "eth0", "10.1.0.5/24".parse().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("injected failure"));
    assert_eq!(net.current_namespace(), HOST_NS);
}

#[test]
fn attach_rejects_a_short_namespace_path() {
    let net = Arc::new(FakeNetState::new());
    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net);
    let err = hi
        .attach_container_link("/x", "eth0", "10.1.0.5/24".parse().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("namespace path"));
}

#[test]
fn detach_deletes_the_link_and_restores_the_namespace() {
    let net = Arc::new(FakeNetState::new());
    let ns = "/proc/4242/ns/net";
    net.add_namespace(ns);

    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());
    hi.ensure().unwrap();
    hi.attach_container_link(ns, "eth0", "10.1.0.5/24".parse().unwrap())
        .unwrap();

    hi.detach_container_link(ns, "eth0").unwrap();
    assert!(net.link(ns, "eth0").is_none());
    assert_eq!(net.current_namespace(), HOST_NS);
}

#[test]
fn detach_surfaces_missing_namespace_and_missing_device() {
    let net = Arc::new(FakeNetState::new());
    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());

    assert!(hi.detach_container_link("/proc/1/ns/net", "eth0").is_err());

    net.add_namespace("/proc/1/ns/net");
    let err = hi.detach_container_link("/proc/1/ns/net", "eth0").unwrap_err();
    assert!(err.to_string().contains("not found"));
    assert_eq!(net.current_namespace(), HOST_NS);
}

#[test]
fn delete_is_a_documented_noop() {
    let net = Arc::new(FakeNetState::new());
    let hi = HostInterface::new(spec("app", "10.1.0.0/24"), net.clone());
    hi.ensure().unwrap();
    let before = net.mutation_count();

    hi.delete().unwrap();
    assert_eq!(net.mutation_count(), before);
    assert!(net.link(HOST_NS, "vx_app").is_some());
}
