use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use vxlan_cni::config::Config;
use vxlan_cni::error::CniError;
use vxlan_cni::ipam::IpamInvoker;
use vxlan_cni::netstate::fake::{FakeNetState, HOST_NS};
use vxlan_cni::plugin::{Command, CommandOutput, VxlanPlugin};
use vxlan_cni::types::CmdArgs;

const NETNS: &str = "/proc/4242/ns/net";

/// Stub IPAM executable: records every CNI_ARGS value it is called with and
/// answers allocation requests with a canned result.
fn write_ipam_stub(dir: &Path, response: &str) {
    let log = dir.join("calls.log");
    let script = format!(
        "#!/bin/sh\necho \"$CNI_ARGS\" >> {log}\ncase \"$CNI_ARGS\" in\n*EXCLUDE_FIRST*) cat <<'EOF'\n{response}\nEOF\n;;\nesac\n",
        log = log.display(),
    );
    let bin = dir.join("host-local");
    fs::write(&bin, script).unwrap();
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
}

fn ipam_calls(dir: &Path) -> Vec<String> {
    match fs::read_to_string(dir.join("calls.log")) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

fn stub_response(address: &str) -> String {
    format!(r#"{{"cniVersion": "1.0.0", "ips": [{{"address": "{address}"}}]}}"#)
}

fn test_config(network: &str, extra: &str) -> Config {
    let json = format!(
        r#"{{
            "cniVersion": "1.0.0",
            "name": "overlay",
            "type": "vxlan-cni",
            "ipam": {{"type": "host-local"}},
            "defaultNetwork": "{network}",
            "vxlans": [
                {{"id": 42, "name": "app", "cidr": "10.1.0.0/24", "excludeFirst": 4, "excludeLast": 1}},
                {{"id": 43, "name": "batch", "cidr": "10.2.0.0/24"}}
            ]{extra}
        }}"#
    );
    Config::parse(json.as_bytes()).unwrap()
}

fn test_args(search_dir: &Path) -> CmdArgs {
    CmdArgs {
        container_id: "cid-1234".to_string(),
        netns: NETNS.to_string(),
        ifname: "eth0".to_string(),
        args: HashMap::new(),
        path: search_dir.to_string_lossy().into_owned(),
        stdin_data: Vec::new(),
    }
}

fn plugin_for(config: Config, args: CmdArgs, net: Arc<FakeNetState>) -> VxlanPlugin {
    let ipam = IpamInvoker::from_search_path(&args.path, "host-local");
    VxlanPlugin::new(config, args, net, ipam)
}

#[tokio::test]
async fn add_end_to_end_assembles_the_result() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.5/24"));
    let net = Arc::new(FakeNetState::new());
    net.add_namespace(NETNS);

    let plugin = plugin_for(test_config("app", ""), test_args(dir.path()), net.clone());
    let output = plugin.execute(Command::Add).await.unwrap();
    let result = match output {
        CommandOutput::Add(result) => result,
        _ => panic!("expected an ADD result"),
    };

    let interfaces = result.interfaces.as_deref().unwrap();
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].name, "eth0");
    assert_eq!(interfaces[0].sandbox.as_deref(), Some(NETNS));

    let ips = result.ips.as_deref().unwrap();
    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0].address, "10.1.0.5/24");
    assert_eq!(ips[0].gateway.as_deref(), Some("10.1.0.0"));
    assert!(ips[0].interface.is_some());

    let routes = result.routes.as_deref().unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].dst, "0.0.0.0/0");
    assert_eq!(routes[0].gw.as_deref(), Some("10.1.0.0"));

    // the exclusion bounds travel to the allocator
    let calls = ipam_calls(dir.path());
    assert_eq!(calls, vec!["CIDR=10.1.0.0/24;EXCLUDE_FIRST=4;EXCLUDE_LAST=1"]);

    // the container link actually exists in the target namespace
    let link = net.link(NETNS, "eth0").unwrap();
    assert_eq!(link.addrs, vec!["10.1.0.5/24".parse().unwrap()]);
    assert!(net.link(HOST_NS, "vx_app").is_some());
}

#[tokio::test]
async fn requested_address_overrides_the_candidate_when_in_subnet() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.7/24"));
    let net = Arc::new(FakeNetState::new());
    net.add_namespace(NETNS);

    let extra = r#", "args": {"annotations": {"vxlan.cni.io/RequestedAddress": "10.1.0.7"}}"#;
    let plugin = plugin_for(test_config("app", extra), test_args(dir.path()), net);
    plugin.execute(Command::Add).await.unwrap();

    let calls = ipam_calls(dir.path());
    assert_eq!(calls, vec!["CIDR=10.1.0.7/24;EXCLUDE_FIRST=4;EXCLUDE_LAST=1"]);
}

#[tokio::test]
async fn requested_address_outside_the_subnet_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.5/24"));
    let net = Arc::new(FakeNetState::new());
    net.add_namespace(NETNS);

    let extra = r#", "args": {"annotations": {"vxlan.cni.io/RequestedAddress": "192.168.9.9"}}"#;
    let plugin = plugin_for(test_config("app", extra), test_args(dir.path()), net);
    plugin.execute(Command::Add).await.unwrap();

    assert_eq!(
        ipam_calls(dir.path()),
        vec!["CIDR=10.1.0.0/24;EXCLUDE_FIRST=4;EXCLUDE_LAST=1"]
    );
}

#[tokio::test]
async fn failed_attach_releases_the_allocation_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.7/24"));
    let net = Arc::new(FakeNetState::new());
    net.add_namespace(NETNS);
    net.fail_on("link_rename");

    let plugin = plugin_for(test_config("app", ""), test_args(dir.path()), net.clone());
    let err = plugin.execute(Command::Add).await.unwrap_err();

    // the attach error is the one surfaced, not a release error
    assert!(matches!(err, CniError::Interface(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 11);

    let calls = ipam_calls(dir.path());
    let releases: Vec<_> = calls.iter().filter(|c| *c == "CIDR=10.1.0.7/24").collect();
    assert_eq!(releases.len(), 1, "release must run exactly once: {calls:?}");
    assert_eq!(net.current_namespace(), HOST_NS);
}

#[tokio::test]
async fn del_with_no_prior_state_succeeds_without_an_ipam_call() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.5/24"));
    let net = Arc::new(FakeNetState::new());
    // namespace deliberately absent, nothing was ever added

    let plugin = plugin_for(test_config("app", ""), test_args(dir.path()), net);
    let output = plugin.execute(Command::Del).await.unwrap();
    let report = match output {
        CommandOutput::Del(report) => report,
        _ => panic!("expected a DEL report"),
    };

    assert!(!report.is_clean(), "the detach step had nothing to detach");
    assert!(report.failures.iter().any(|f| f.step == "detach container link"));
    assert!(ipam_calls(dir.path()).is_empty(), "no address was recorded, none may be released");
}

#[tokio::test]
async fn del_releases_the_previously_recorded_address() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.5/24"));
    let net = Arc::new(FakeNetState::new());
    net.add_namespace(NETNS);

    let extra = r#", "prevResult": {"cniVersion": "1.0.0", "ips": [{"address": "10.1.0.9/24"}]}"#;
    let plugin = plugin_for(test_config("app", extra), test_args(dir.path()), net);
    let output = plugin.execute(Command::Del).await.unwrap();
    assert!(matches!(output, CommandOutput::Del(_)));

    assert_eq!(ipam_calls(dir.path()), vec!["CIDR=10.1.0.9/24"]);
}

#[tokio::test]
async fn check_is_a_noop_success() {
    let dir = tempfile::tempdir().unwrap();
    write_ipam_stub(dir.path(), &stub_response("10.1.0.5/24"));
    let net = Arc::new(FakeNetState::new());

    let plugin = plugin_for(test_config("app", ""), test_args(dir.path()), net.clone());
    let output = plugin.execute(Command::Check).await.unwrap();
    assert!(matches!(output, CommandOutput::Check));
    assert_eq!(net.mutation_count(), 0);
}

#[test]
fn network_resolution_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNetState::new());

    // annotation beats namespace and default
    let extra = r#", "networkFromNamespace": true, "args": {"annotations": {"vxlan.cni.io/NetworkName": "batch"}}"#;
    let mut args = test_args(dir.path());
    args.args.insert("K8S_POD_NAMESPACE".to_string(), "app".to_string());
    let plugin = plugin_for(test_config("app", extra), args, net.clone());
    assert_eq!(plugin.resolve_network().unwrap().name, "batch");

    // namespace beats default when enabled
    let extra = r#", "networkFromNamespace": true"#;
    let mut args = test_args(dir.path());
    args.args.insert("K8S_POD_NAMESPACE".to_string(), "batch".to_string());
    let plugin = plugin_for(test_config("app", extra), args, net.clone());
    assert_eq!(plugin.resolve_network().unwrap().name, "batch");

    // namespace is ignored when the flag is off
    let mut args = test_args(dir.path());
    args.args.insert("K8S_POD_NAMESPACE".to_string(), "batch".to_string());
    let plugin = plugin_for(test_config("app", ""), args, net.clone());
    assert_eq!(plugin.resolve_network().unwrap().name, "app");

    // default is the fallback
    let plugin = plugin_for(test_config("batch", ""), test_args(dir.path()), net);
    assert_eq!(plugin.resolve_network().unwrap().name, "batch");
}

#[test]
fn unresolvable_or_unconfigured_networks_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(FakeNetState::new());

    let plugin = plugin_for(test_config("", ""), test_args(dir.path()), net.clone());
    let err = plugin.resolve_network().unwrap_err();
    assert!(matches!(err, CniError::NoNetwork));
    assert_eq!(err.exit_code(), 7);

    let plugin = plugin_for(test_config("nosuch", ""), test_args(dir.path()), net);
    let err = plugin.resolve_network().unwrap_err();
    assert!(matches!(err, CniError::NoMatchingNetwork(_)));
    assert_eq!(err.exit_code(), 7);
}
