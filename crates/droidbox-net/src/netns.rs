//! Network namespace lifecycle and per-address filtering.
//!
//! One namespace per sandbox, joined to the host through a veth pair. The
//! host side carries the gateway address; the sandbox side carries the
//! allocated address with a default route back through the gateway. Filter
//! rules are scoped to the sandbox address and recorded as they are applied,
//! so teardown can remove exactly what creation added even when creation
//! stopped halfway.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use droidbox_error::CommonError;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::runner::{CommandOutput, CommandRunner};

/// Interface names are capped at 15 bytes by the kernel; `veth-h-` plus an
/// 8-char suffix fits exactly.
const VETH_SUFFIX_LEN: usize = 8;

/// Isolator settings.
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    /// Subnet sandbox addresses are drawn from.
    pub subnet: Ipv4Network,
    /// Gateway address assigned to every host-side veth.
    pub gateway: Ipv4Addr,
    /// Resolver addresses written into each namespace.
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        // Matches the default address pool; both are configurable together
        // from the daemon config.
        let subnet = Ipv4Network::new(Ipv4Addr::new(172, 20, 0, 0), 24)
            .unwrap_or_else(|_| unreachable!("static /24 literal"));
        Self {
            subnet,
            gateway: Ipv4Addr::new(172, 20, 0, 1),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
        }
    }
}

/// Registered namespace state.
#[derive(Debug, Clone)]
struct NamespaceRecord {
    ip: Ipv4Addr,
    veth_host: String,
    veth_ns: String,
    /// iptables argument vectors applied so far, in add form.
    scoped_rules: Vec<Vec<String>>,
}

/// Independent, non-fatal connectivity checks for one namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub namespace_exists: bool,
    pub interface_up: bool,
    pub address_assigned: bool,
    pub default_route: bool,
    pub dns_resolves: bool,
    pub external_reachable: bool,
    /// Source address the outside world observed, when reachable.
    pub egress_ip: Option<String>,
}

/// Creates and destroys isolated network namespaces.
///
/// The namespace registry is mutex-guarded; concurrent provisioning and
/// teardown see a consistent view and destroy is idempotent.
pub struct NetworkIsolator {
    runner: Arc<dyn CommandRunner>,
    config: IsolatorConfig,
    namespaces: Mutex<HashMap<String, NamespaceRecord>>,
}

impl NetworkIsolator {
    /// Creates an isolator driving host tools through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: IsolatorConfig) -> Self {
        Self {
            runner,
            config,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured gateway address.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.config.gateway
    }

    /// Returns the configured default DNS servers.
    #[must_use]
    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.config.dns_servers
    }

    /// Returns true if `name` is currently registered.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.namespaces
            .lock()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    /// Enables IPv4 forwarding on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysctl cannot be written.
    pub fn enable_ip_forward(&self) -> Result<()> {
        self.runner
            .write_file(std::path::Path::new("/proc/sys/net/ipv4/ip_forward"), "1")
            .map_err(|e| NetError::Firewall(format!("failed to enable IP forwarding: {e}")))?;
        debug!("IP forwarding enabled");
        Ok(())
    }

    /// Creates the namespace `name` and wires `ip` into it.
    ///
    /// Steps run strictly in sequence: namespace, veth pair, addressing,
    /// routes, scoped filter rules. On any failure the namespace is destroyed
    /// before the error returns; nothing partial stays registered.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a duplicate name, an address error for an
    /// `ip` outside the subnet, or a namespace/firewall error from the failed
    /// step.
    pub fn create_namespace(&self, name: &str, ip: Ipv4Addr) -> Result<()> {
        if !self.config.subnet.contains(ip) {
            return Err(NetError::Address(format!(
                "{ip} is outside subnet {}",
                self.config.subnet
            )));
        }
        if ip == self.config.gateway {
            return Err(NetError::Address(format!("{ip} is the gateway address")));
        }

        let (veth_host, veth_ns) = veth_names(name);
        {
            let mut namespaces = self.lock_registry()?;
            if namespaces.contains_key(name) {
                return Err(NetError::Common(CommonError::already_exists(format!(
                    "namespace {name}"
                ))));
            }
            namespaces.insert(
                name.to_string(),
                NamespaceRecord {
                    ip,
                    veth_host: veth_host.clone(),
                    veth_ns: veth_ns.clone(),
                    scoped_rules: Vec::new(),
                },
            );
        }

        match self.build_namespace(name, ip, &veth_host, &veth_ns) {
            Ok(()) => {
                info!(namespace = name, %ip, "namespace created");
                Ok(())
            }
            Err(e) => {
                warn!(namespace = name, error = %e, "namespace setup failed, rolling back");
                self.destroy_namespace(name);
                Err(e)
            }
        }
    }

    fn build_namespace(
        &self,
        name: &str,
        ip: Ipv4Addr,
        veth_host: &str,
        veth_ns: &str,
    ) -> Result<()> {
        let prefix = self.config.subnet.prefix().to_string();
        let gateway = self.config.gateway.to_string();
        let host_addr = format!("{gateway}/{prefix}");
        let ns_addr = format!("{ip}/{prefix}");

        self.run_ip(&["netns", "add", name])?;
        self.run_ip(&["link", "add", veth_host, "type", "veth", "peer", "name", veth_ns])?;
        self.run_ip(&["link", "set", veth_ns, "netns", name])?;
        self.run_ip(&["addr", "add", &host_addr, "dev", veth_host])?;
        self.run_ip(&["link", "set", veth_host, "up"])?;
        self.run_ip(&["netns", "exec", name, "ip", "link", "set", "lo", "up"])?;
        self.run_ip(&["netns", "exec", name, "ip", "addr", "add", &ns_addr, "dev", veth_ns])?;
        self.run_ip(&["netns", "exec", name, "ip", "link", "set", veth_ns, "up"])?;
        self.run_ip(&["netns", "exec", name, "ip", "route", "add", "default", "via", &gateway])?;

        for rule in scoped_rules(ip) {
            let args: Vec<&str> = rule.iter().map(String::as_str).collect();
            self.run_iptables(&args)?;
            // Record immediately so a later step failure still tears this
            // rule down.
            if let Some(record) = self.lock_registry()?.get_mut(name) {
                record.scoped_rules.push(rule);
            }
        }

        Ok(())
    }

    /// Destroys the namespace `name`, removing its filter rules, veth pair,
    /// and resolver configuration.
    ///
    /// Idempotent and best-effort: unknown names are a no-op, and each
    /// teardown step runs even if earlier ones fail.
    pub fn destroy_namespace(&self, name: &str) {
        let record = match self.namespaces.lock() {
            Ok(mut map) => map.remove(name),
            Err(_) => {
                warn!(namespace = name, "namespace registry lock poisoned");
                None
            }
        };

        let Some(record) = record else {
            debug!(namespace = name, "destroy on unknown namespace, nothing to do");
            return;
        };

        for rule in &record.scoped_rules {
            let del = deletion_args(rule);
            let args: Vec<&str> = del.iter().map(String::as_str).collect();
            self.run_quiet("iptables", &args);
        }
        // Deleting the host side removes the in-namespace peer as well.
        self.run_quiet("ip", &["link", "del", &record.veth_host]);
        self.run_quiet("ip", &["netns", "del", name]);
        if let Err(e) = self.runner.remove_path(&resolver_dir(name)) {
            debug!(namespace = name, error = %e, "resolver cleanup failed");
        }

        info!(namespace = name, ip = %record.ip, "namespace destroyed");
    }

    /// Writes the resolver configuration for `name`.
    ///
    /// Uses the `/etc/netns/<name>/resolv.conf` convention picked up by
    /// `ip netns exec`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unregistered namespace or an I/O error from
    /// the write.
    pub fn configure_dns(&self, name: &str, servers: &[Ipv4Addr]) -> Result<()> {
        if !self.is_registered(name) {
            return Err(NetError::Common(CommonError::not_found(format!(
                "namespace {name}"
            ))));
        }

        let servers = if servers.is_empty() {
            &self.config.dns_servers
        } else {
            servers
        };
        let mut contents = String::new();
        for server in servers {
            contents.push_str(&format!("nameserver {server}\n"));
        }
        contents.push_str("options ndots:0\n");

        self.runner
            .write_file(&resolver_dir(name).join("resolv.conf"), &contents)?;
        debug!(namespace = name, servers = servers.len(), "DNS configured");
        Ok(())
    }

    /// Probes the namespace from the inside and reports what works.
    ///
    /// Every check is independent; a failing probe marks its field false and
    /// never aborts the rest.
    #[must_use]
    pub fn verify_connectivity(&self, name: &str) -> ConnectivityReport {
        let mut report = ConnectivityReport::default();

        let record = match self.namespaces.lock() {
            Ok(map) => map.get(name).cloned(),
            Err(_) => None,
        };
        let Some(record) = record else {
            return report;
        };

        report.namespace_exists = self
            .probe("ip", &["netns", "list"])
            .map(|out| {
                out.stdout
                    .lines()
                    .any(|line| line.split_whitespace().next() == Some(name))
            })
            .unwrap_or(false);

        report.interface_up = self
            .probe_in_ns(name, &["ip", "link", "show", &record.veth_ns])
            .map(|out| out.stdout.contains("state UP"))
            .unwrap_or(false);

        report.address_assigned = self
            .probe_in_ns(name, &["ip", "addr", "show", &record.veth_ns])
            .map(|out| out.stdout.contains(&record.ip.to_string()))
            .unwrap_or(false);

        report.default_route = self
            .probe_in_ns(name, &["ip", "route", "show"])
            .map(|out| out.stdout.contains("default via"))
            .unwrap_or(false);

        report.dns_resolves = self
            .probe_in_ns(name, &["nslookup", "google.com"])
            .is_some();

        if let Some(out) = self.probe_in_ns(
            name,
            &["curl", "-s", "--max-time", "10", "http://httpbin.org/ip"],
        ) {
            report.external_reachable = true;
            report.egress_ip = parse_egress_ip(&out.stdout);
        }

        report
    }

    /// Runs a probe command, returning `None` on spawn failure or non-zero
    /// exit.
    fn probe(&self, program: &str, args: &[&str]) -> Option<CommandOutput> {
        match self.runner.run(program, args) {
            Ok(out) if out.success => Some(out),
            Ok(_) | Err(_) => None,
        }
    }

    fn probe_in_ns(&self, name: &str, command: &[&str]) -> Option<CommandOutput> {
        let mut args = vec!["netns", "exec", name];
        args.extend_from_slice(command);
        self.probe("ip", &args)
    }

    fn run_ip(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self
            .runner
            .run("ip", args)
            .map_err(|e| NetError::Namespace(format!("failed to run ip: {e}")))?;
        if !output.success {
            return Err(NetError::Namespace(format!(
                "ip {} failed: {}",
                args.join(" "),
                output.stderr
            )));
        }
        Ok(output)
    }

    fn run_iptables(&self, args: &[&str]) -> Result<()> {
        let output = self
            .runner
            .run("iptables", args)
            .map_err(|e| NetError::Firewall(format!("failed to run iptables: {e}")))?;
        if !output.success {
            return Err(NetError::Firewall(format!(
                "iptables {} failed: {}",
                args.join(" "),
                output.stderr
            )));
        }
        Ok(())
    }

    /// Teardown helper: failures are logged, never propagated.
    fn run_quiet(&self, program: &str, args: &[&str]) {
        match self.runner.run(program, args) {
            Ok(out) if !out.success => {
                debug!(program, args = args.join(" "), stderr = %out.stderr.trim(), "cleanup command failed");
            }
            Err(e) => {
                debug!(program, args = args.join(" "), error = %e, "cleanup command did not run");
            }
            Ok(_) => {}
        }
    }

    fn lock_registry(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, NamespaceRecord>>> {
        self.namespaces
            .lock()
            .map_err(|_| NetError::Common(CommonError::internal("namespace registry lock poisoned")))
    }
}

/// Host-side filter rules scoped to one sandbox address, in add form.
fn scoped_rules(ip: Ipv4Addr) -> Vec<Vec<String>> {
    let ip = ip.to_string();
    vec![
        vec!["-A".into(), "FORWARD".into(), "-s".into(), ip.clone(), "-j".into(), "ACCEPT".into()],
        vec!["-A".into(), "FORWARD".into(), "-d".into(), ip.clone(), "-j".into(), "ACCEPT".into()],
        vec![
            "-t".into(),
            "nat".into(),
            "-A".into(),
            "POSTROUTING".into(),
            "-s".into(),
            ip,
            "-j".into(),
            "MASQUERADE".into(),
        ],
    ]
}

/// Converts an add-form iptables argument vector into its delete form.
pub(crate) fn deletion_args(add: &[String]) -> Vec<String> {
    add.iter()
        .map(|arg| {
            if arg == "-A" || arg == "-I" {
                "-D".to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Derives the veth pair names from a namespace name.
fn veth_names(namespace: &str) -> (String, String) {
    let suffix: String = namespace
        .rsplit('-')
        .next()
        .unwrap_or(namespace)
        .chars()
        .take(VETH_SUFFIX_LEN)
        .collect();
    (format!("veth-h-{suffix}"), format!("veth-s-{suffix}"))
}

fn resolver_dir(namespace: &str) -> PathBuf {
    PathBuf::from("/etc/netns").join(namespace)
}

fn parse_egress_ip(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("origin")
        .and_then(|origin| origin.as_str())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::RecordingRunner;

    fn isolator() -> (Arc<RecordingRunner>, NetworkIsolator) {
        let runner = Arc::new(RecordingRunner::new());
        let isolator = NetworkIsolator::new(runner.clone(), IsolatorConfig::default());
        (runner, isolator)
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(172, 20, 0, last)
    }

    #[test]
    fn create_runs_setup_sequence_in_order() {
        let (runner, isolator) = isolator();
        isolator.create_namespace("netns-4f2a9c1b", ip(57)).unwrap();

        let calls = runner.call_lines();
        assert_eq!(calls[0], "ip netns add netns-4f2a9c1b");
        assert_eq!(
            calls[1],
            "ip link add veth-h-4f2a9c1b type veth peer name veth-s-4f2a9c1b"
        );
        assert!(calls.iter().any(|c| c == "ip addr add 172.20.0.1/24 dev veth-h-4f2a9c1b"));
        assert!(calls
            .iter()
            .any(|c| c == "ip netns exec netns-4f2a9c1b ip addr add 172.20.0.57/24 dev veth-s-4f2a9c1b"));
        assert!(calls
            .iter()
            .any(|c| c == "ip netns exec netns-4f2a9c1b ip route add default via 172.20.0.1"));
        assert_eq!(runner.calls_containing("iptables").len(), 3);
        assert!(isolator.is_registered("netns-4f2a9c1b"));
    }

    #[test]
    fn create_rejects_duplicate_namespace() {
        let (_runner, isolator) = isolator();
        isolator.create_namespace("netns-aa", ip(10)).unwrap();
        let err = isolator.create_namespace("netns-aa", ip(11)).unwrap_err();
        match err {
            NetError::Common(common) => assert!(common.is_already_exists()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn create_rejects_address_outside_subnet() {
        let (_runner, isolator) = isolator();
        let err = isolator
            .create_namespace("netns-bb", Ipv4Addr::new(10, 0, 0, 5))
            .unwrap_err();
        assert!(matches!(err, NetError::Address(_)));
    }

    #[test]
    fn failed_rule_application_rolls_back_applied_rules() {
        let (runner, isolator) = isolator();
        runner.fail_matching("MASQUERADE");

        let err = isolator.create_namespace("netns-cc", ip(20)).unwrap_err();
        assert!(matches!(err, NetError::Firewall(_)));
        assert!(!isolator.is_registered("netns-cc"));

        // The two FORWARD rules that made it in were each deleted; the
        // masquerade rule never applied, so no delete for it.
        let adds = runner
            .calls_containing("iptables -A FORWARD")
            .len();
        let dels = runner.calls_containing("iptables -D FORWARD").len();
        assert_eq!(adds, 2);
        assert_eq!(dels, 2);
        assert!(runner.calls_containing("-D POSTROUTING").is_empty());
        assert!(runner.calls_containing("ip netns del netns-cc").len() == 1);
    }

    #[test]
    fn destroy_removes_every_scoped_rule() {
        let (runner, isolator) = isolator();
        isolator.create_namespace("netns-dd", ip(30)).unwrap();
        isolator.destroy_namespace("netns-dd");

        assert!(!isolator.is_registered("netns-dd"));
        let adds: Vec<String> = runner
            .calls_containing("iptables")
            .into_iter()
            .filter(|c| c.contains("-A"))
            .collect();
        for add in adds {
            let expected = add.replace("-A", "-D");
            assert!(
                runner.call_lines().contains(&expected),
                "missing deletion for rule: {add}"
            );
        }
        assert_eq!(runner.calls_containing("ip link del veth-h-dd").len(), 1);
        assert_eq!(runner.calls_containing("ip netns del netns-dd").len(), 1);
        assert!(runner
            .removals
            .lock()
            .unwrap()
            .contains(&"/etc/netns/netns-dd".to_string()));
    }

    #[test]
    fn destroy_unknown_namespace_is_silent_noop() {
        let (runner, isolator) = isolator();
        isolator.destroy_namespace("netns-missing");
        assert!(runner.call_lines().is_empty());
    }

    #[test]
    fn configure_dns_writes_resolver_file() {
        let (runner, isolator) = isolator();
        isolator.create_namespace("netns-ee", ip(40)).unwrap();
        isolator
            .configure_dns("netns-ee", &[Ipv4Addr::new(9, 9, 9, 9)])
            .unwrap();

        let writes = runner.writes.lock().unwrap();
        let (path, contents) = writes.last().unwrap();
        assert_eq!(path, "/etc/netns/netns-ee/resolv.conf");
        assert_eq!(contents, "nameserver 9.9.9.9\noptions ndots:0\n");
    }

    #[test]
    fn configure_dns_uses_defaults_when_no_servers_given() {
        let (runner, isolator) = isolator();
        isolator.create_namespace("netns-ff", ip(41)).unwrap();
        isolator.configure_dns("netns-ff", &[]).unwrap();

        let writes = runner.writes.lock().unwrap();
        let (_, contents) = writes.last().unwrap();
        assert!(contents.contains("nameserver 8.8.8.8"));
        assert!(contents.contains("nameserver 1.1.1.1"));
    }

    #[test]
    fn configure_dns_unknown_namespace_is_not_found() {
        let (_runner, isolator) = isolator();
        let err = isolator.configure_dns("netns-zz", &[]).unwrap_err();
        match err {
            NetError::Common(common) => assert!(common.is_not_found()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn connectivity_report_reads_probe_output() {
        let (runner, isolator) = isolator();
        isolator.create_namespace("netns-gg", ip(50)).unwrap();

        runner.stdout_matching("netns list", "netns-gg (id: 0)\nother\n");
        runner.stdout_matching("ip link show veth-s-gg", "4: veth-s-gg ... state UP mode DEFAULT");
        runner.stdout_matching("ip addr show veth-s-gg", "inet 172.20.0.50/24 scope global");
        runner.stdout_matching("ip route show", "default via 172.20.0.1 dev veth-s-gg");
        runner.fail_matching("nslookup");
        runner.stdout_matching("httpbin.org/ip", "{\"origin\": \"198.51.100.7\"}");

        let report = isolator.verify_connectivity("netns-gg");
        assert!(report.namespace_exists);
        assert!(report.interface_up);
        assert!(report.address_assigned);
        assert!(report.default_route);
        assert!(!report.dns_resolves);
        assert!(report.external_reachable);
        assert_eq!(report.egress_ip.as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn connectivity_for_unknown_namespace_is_all_false() {
        let (_runner, isolator) = isolator();
        let report = isolator.verify_connectivity("netns-none");
        assert!(!report.namespace_exists);
        assert!(!report.external_reachable);
        assert!(report.egress_ip.is_none());
    }

    #[test]
    fn deletion_args_flip_append_and_insert() {
        let add: Vec<String> = ["-t", "nat", "-A", "POSTROUTING", "-j", "MASQUERADE"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            deletion_args(&add),
            vec!["-t", "nat", "-D", "POSTROUTING", "-j", "MASQUERADE"]
        );
        let insert: Vec<String> = ["-I", "OUTPUT", "-j", "ACCEPT"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(deletion_args(&insert), vec!["-D", "OUTPUT", "-j", "ACCEPT"]);
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        let (host, ns) = veth_names("netns-4f2a9c1b77d0");
        assert!(host.len() <= 15, "{host} exceeds IFNAMSIZ");
        assert!(ns.len() <= 15, "{ns} exceeds IFNAMSIZ");
        assert_eq!(host, "veth-h-4f2a9c1b");
        assert_eq!(ns, "veth-s-4f2a9c1b");
    }
}
