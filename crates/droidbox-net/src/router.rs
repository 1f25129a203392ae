//! Egress routing for sandbox namespaces.
//!
//! Routing is applied per namespace according to a [`RoutingPolicy`]:
//! HTTP proxies get destination-NAT of web ports, SOCKS proxies get a
//! transparent redirect through a local redsocks process, and custom rule
//! sets cover blocking, rate limiting, and bandwidth shaping. Reconfiguring
//! always tears the previous redirect down first.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::runner::CommandRunner;

/// Local port the transparent SOCKS redirect listens on inside a namespace.
const REDSOCKS_PORT: u16 = 12345;

/// nat chain holding the transparent-redirect rules.
const PROXY_CHAIN: &str = "DBX_PROXY";

/// Destinations exempt from transparent redirection.
const REDIRECT_EXEMPT: [&str; 4] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

/// Upstream proxy descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// `host:port` form used in NAT targets.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Custom egress rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRules {
    /// Domains dropped at the DNS layer via payload string match.
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Destination addresses dropped outright.
    #[serde(default)]
    pub blocked_ips: Vec<IpAddr>,
    /// Outbound packet rate cap, per second.
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
    /// When non-empty, only these destination ports may originate traffic;
    /// everything else is denied by default.
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
    /// Bandwidth cap for the namespace interface, e.g. `"1mbit"`.
    #[serde(default)]
    pub bandwidth: Option<String>,
}

/// Egress redirection strategy for one namespace.
///
/// A closed set: unsupported kinds cannot exist past deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RoutingPolicy {
    /// Default container networking, no namespace isolation.
    #[default]
    None,
    /// Destination-NAT web traffic through an HTTP proxy.
    Http { endpoint: ProxyEndpoint },
    /// Transparent redirect of all TCP through a SOCKS proxy.
    Socks { endpoint: ProxyEndpoint },
    /// Site-defined block/rate/bandwidth rules.
    Custom { rules: CustomRules },
}

impl RoutingPolicy {
    /// Whether this policy needs a private namespace wired up.
    #[must_use]
    pub const fn requires_isolation(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Http { .. } => "http",
            Self::Socks { .. } => "socks",
            Self::Custom { .. } => "custom",
        }
    }
}

/// Per-namespace routing state needed for precise teardown.
#[derive(Debug, Default)]
struct RouteState {
    /// Host-side rules in add form; namespace-side rules are flushed wholesale.
    host_rules: Vec<Vec<String>>,
    redsocks_conf: Option<PathBuf>,
    shaped_iface: Option<String>,
}

/// Applies and removes egress routing for namespaces.
pub struct TrafficRouter {
    runner: Arc<dyn CommandRunner>,
    state_dir: PathBuf,
    routes: Mutex<HashMap<String, RouteState>>,
}

impl TrafficRouter {
    /// Creates a router; `state_dir` holds redsocks configuration files.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, state_dir: PathBuf) -> Self {
        Self {
            runner,
            state_dir,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Applies `policy` to `namespace`, tearing down any previous routing
    /// first.
    ///
    /// # Errors
    ///
    /// Returns a routing error if a rule or the redirect process cannot be
    /// set up. Partial state is removed before the error returns.
    pub fn configure(&self, namespace: &str, policy: &RoutingPolicy) -> Result<()> {
        self.remove_routing(namespace);

        let state = match policy {
            RoutingPolicy::None => {
                debug!(namespace, "no egress routing requested");
                return Ok(());
            }
            RoutingPolicy::Http { endpoint } => self.apply_http(namespace, endpoint),
            RoutingPolicy::Socks { endpoint } => self.apply_socks(namespace, endpoint),
            RoutingPolicy::Custom { rules } => self.apply_custom(namespace, rules),
        };

        match state {
            Ok(state) => {
                self.register(namespace, state)?;
                info!(namespace, kind = policy.kind(), "egress routing configured");
                Ok(())
            }
            Err(e) => {
                warn!(namespace, kind = policy.kind(), error = %e, "routing setup failed, rolling back");
                self.remove_routing(namespace);
                Err(e)
            }
        }
    }

    /// Replaces the namespace's routing with `policy`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::configure`].
    pub fn update_routing(&self, namespace: &str, policy: &RoutingPolicy) -> Result<()> {
        self.configure(namespace, policy)
    }

    /// Removes all routing state for `namespace`.
    ///
    /// Safe to call whether or not anything was configured; every step is
    /// attempted and failures are logged, not raised.
    pub fn remove_routing(&self, namespace: &str) {
        let state = match self.routes.lock() {
            Ok(mut map) => map.remove(namespace),
            Err(_) => {
                warn!(namespace, "route registry lock poisoned");
                None
            }
        };

        // Flush namespace tables wholesale; rules only ever exist inside a
        // namespace this router populated.
        self.ns_quiet(namespace, &["iptables", "-F"]);
        self.ns_quiet(namespace, &["iptables", "-t", "nat", "-F"]);
        self.ns_quiet(namespace, &["iptables", "-t", "nat", "-X", PROXY_CHAIN]);
        self.ns_quiet(namespace, &["pkill", "-f", "redsocks"]);

        if let Some(state) = state {
            for rule in &state.host_rules {
                let del = crate::netns::deletion_args(rule);
                let args: Vec<&str> = del.iter().map(String::as_str).collect();
                self.quiet("iptables", &args);
            }
            if let Some(iface) = &state.shaped_iface {
                self.ns_quiet(namespace, &["tc", "qdisc", "del", "dev", iface, "root"]);
            }
            if let Some(conf) = &state.redsocks_conf {
                if let Err(e) = self.runner.remove_path(conf) {
                    debug!(namespace, error = %e, "redsocks config removal failed");
                }
            }
            debug!(namespace, "egress routing removed");
        }
    }

    fn apply_http(&self, namespace: &str, endpoint: &ProxyEndpoint) -> Result<RouteState> {
        let mut state = RouteState::default();

        // Direct traffic to the proxy itself must not be caught by any
        // default-deny policy on the host.
        let proxy_port = endpoint.port.to_string();
        let allow: Vec<String> = [
            "-A", "OUTPUT", "-p", "tcp", "-d", endpoint.host.as_str(), "--dport",
            proxy_port.as_str(), "-j", "ACCEPT",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        {
            let args: Vec<&str> = allow.iter().map(String::as_str).collect();
            self.host_iptables(&args)?;
        }
        state.host_rules.push(allow);

        let target = endpoint.address();
        for port in ["80", "443"] {
            self.ns_iptables(
                namespace,
                &[
                    "-t", "nat", "-A", "OUTPUT", "-p", "tcp", "--dport", port, "-j", "DNAT",
                    "--to-destination", &target,
                ],
            )?;
        }

        Ok(state)
    }

    fn apply_socks(&self, namespace: &str, endpoint: &ProxyEndpoint) -> Result<RouteState> {
        if !self.redsocks_available() {
            warn!(
                namespace,
                "redsocks not found, falling back to HTTP-style routing"
            );
            return self.apply_http(namespace, endpoint);
        }

        let conf_path = self.state_dir.join(format!("redsocks-{namespace}.conf"));
        self.runner
            .write_file(&conf_path, &redsocks_config(endpoint))
            .map_err(|e| NetError::Routing(format!("failed to write redsocks config: {e}")))?;

        let conf = conf_path.display().to_string();
        self.ns_checked(namespace, &["redsocks", "-c", &conf])?;

        self.ns_iptables(namespace, &["-t", "nat", "-N", PROXY_CHAIN])?;
        for exempt in REDIRECT_EXEMPT {
            self.ns_iptables(
                namespace,
                &["-t", "nat", "-A", PROXY_CHAIN, "-d", exempt, "-j", "RETURN"],
            )?;
        }
        let redirect_port = REDSOCKS_PORT.to_string();
        self.ns_iptables(
            namespace,
            &[
                "-t", "nat", "-A", PROXY_CHAIN, "-p", "tcp", "-j", "REDIRECT", "--to-ports",
                &redirect_port,
            ],
        )?;
        self.ns_iptables(
            namespace,
            &["-t", "nat", "-A", "OUTPUT", "-p", "tcp", "-j", PROXY_CHAIN],
        )?;

        Ok(RouteState {
            host_rules: Vec::new(),
            redsocks_conf: Some(conf_path),
            shaped_iface: None,
        })
    }

    fn apply_custom(&self, namespace: &str, rules: &CustomRules) -> Result<RouteState> {
        let mut state = RouteState::default();

        for domain in &rules.blocked_domains {
            self.ns_iptables(
                namespace,
                &[
                    "-A", "OUTPUT", "-p", "udp", "--dport", "53", "-m", "string", "--string",
                    domain, "--algo", "bm", "-j", "DROP",
                ],
            )?;
        }

        for ip in &rules.blocked_ips {
            let ip = ip.to_string();
            self.ns_iptables(namespace, &["-A", "OUTPUT", "-d", &ip, "-j", "DROP"])?;
        }

        if let Some(rate) = rules.rate_limit_per_sec {
            let limit = format!("{rate}/s");
            self.ns_iptables(
                namespace,
                &["-A", "OUTPUT", "-m", "limit", "--limit", &limit, "-j", "ACCEPT"],
            )?;
        }

        if !rules.allowed_ports.is_empty() {
            // Default deny appended first; allows inserted ahead of it.
            self.ns_iptables(namespace, &["-A", "OUTPUT", "-j", "DROP"])?;
            for port in &rules.allowed_ports {
                let port = port.to_string();
                self.ns_iptables(
                    namespace,
                    &["-I", "OUTPUT", "-p", "tcp", "--dport", &port, "-j", "ACCEPT"],
                )?;
                self.ns_iptables(
                    namespace,
                    &["-I", "OUTPUT", "-p", "udp", "--dport", &port, "-j", "ACCEPT"],
                )?;
            }
            self.ns_iptables(
                namespace,
                &[
                    "-I", "OUTPUT", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j",
                    "ACCEPT",
                ],
            )?;
        }

        if let Some(bandwidth) = &rules.bandwidth {
            let listing = self.ns_checked(namespace, &["ip", "link", "show"])?;
            if let Some(iface) = find_sandbox_iface(&listing) {
                self.ns_checked(
                    namespace,
                    &[
                        "tc", "qdisc", "add", "dev", &iface, "root", "tbf", "rate", bandwidth,
                        "latency", "50ms", "burst", "1540",
                    ],
                )?;
                state.shaped_iface = Some(iface);
            } else {
                warn!(namespace, "no sandbox interface found for bandwidth shaping");
            }
        }

        Ok(state)
    }

    fn redsocks_available(&self) -> bool {
        self.runner
            .run("which", &["redsocks"])
            .map(|out| out.success)
            .unwrap_or(false)
    }

    fn register(&self, namespace: &str, state: RouteState) -> Result<()> {
        self.routes
            .lock()
            .map_err(|_| {
                NetError::Common(droidbox_error::CommonError::internal(
                    "route registry lock poisoned",
                ))
            })?
            .insert(namespace.to_string(), state);
        Ok(())
    }

    fn host_iptables(&self, args: &[&str]) -> Result<()> {
        let output = self
            .runner
            .run("iptables", args)
            .map_err(|e| NetError::Routing(format!("failed to run iptables: {e}")))?;
        if !output.success {
            return Err(NetError::Routing(format!(
                "iptables {} failed: {}",
                args.join(" "),
                output.stderr
            )));
        }
        Ok(())
    }

    fn ns_iptables(&self, namespace: &str, args: &[&str]) -> Result<()> {
        let mut full = vec!["iptables"];
        full.extend_from_slice(args);
        self.ns_checked(namespace, &full).map(|_| ())
    }

    /// Runs a command inside the namespace, mapping failure to a routing
    /// error and returning stdout.
    fn ns_checked(&self, namespace: &str, command: &[&str]) -> Result<String> {
        let mut args = vec!["netns", "exec", namespace];
        args.extend_from_slice(command);
        let output = self
            .runner
            .run("ip", &args)
            .map_err(|e| NetError::Routing(format!("failed to enter {namespace}: {e}")))?;
        if !output.success {
            return Err(NetError::Routing(format!(
                "{} failed in {namespace}: {}",
                command.join(" "),
                output.stderr
            )));
        }
        Ok(output.stdout)
    }

    fn ns_quiet(&self, namespace: &str, command: &[&str]) {
        let mut args = vec!["netns", "exec", namespace];
        args.extend_from_slice(command);
        self.quiet("ip", &args);
    }

    fn quiet(&self, program: &str, args: &[&str]) {
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
}

/// Renders the redsocks configuration for a SOCKS upstream.
fn redsocks_config(endpoint: &ProxyEndpoint) -> String {
    let mut conf = String::from(
        "base {\n    log_debug = off;\n    log_info = on;\n    log = stderr;\n    daemon = on;\n    redirector = iptables;\n}\n\nredsocks {\n    local_ip = 127.0.0.1;\n",
    );
    conf.push_str(&format!("    local_port = {REDSOCKS_PORT};\n"));
    conf.push_str(&format!("    ip = {};\n", endpoint.host));
    conf.push_str(&format!("    port = {};\n", endpoint.port));
    conf.push_str("    type = socks5;\n");
    if let Some(username) = &endpoint.username {
        conf.push_str(&format!("    login = \"{username}\";\n"));
    }
    if let Some(password) = &endpoint.password {
        conf.push_str(&format!("    password = \"{password}\";\n"));
    }
    conf.push_str("}\n");
    conf
}

/// Picks the sandbox-side veth out of an `ip link show` listing.
fn find_sandbox_iface(listing: &str) -> Option<String> {
    for line in listing.lines() {
        if let Some(start) = line.find("veth-s-") {
            let rest = &line[start..];
            let end = rest
                .find(|c: char| c == '@' || c == ':' || c.is_whitespace())
                .unwrap_or(rest.len());
            return Some(rest[..end].to_string());
        }
    }
    None
}
