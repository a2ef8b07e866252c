//! Device-side virtual networking.
//!
//! Every guest's TAP interface hangs off one shared bridge whose address is
//! the guests' gateway. Traffic leaves through the uplink via NAT. This
//! module parses `ip link` output and renders the command sets used by stop,
//! fix and diagnose; it never executes anything itself.

use crate::options::NetworkOptions;
use crate::service::ServiceDescriptor;

/// Parsed state of one interface from `ip link show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub lower_up: bool,
    pub no_carrier: bool,
    pub master: Option<String>,
}

impl LinkState {
    /// Parse the first interface in `ip link show <iface>` output.
    pub fn parse(output: &str) -> Option<Self> {
        let header = output.lines().find(|l| !l.trim().is_empty())?;
        let flags = header
            .split_once('<')
            .and_then(|(_, rest)| rest.split_once('>'))
            .map(|(flags, _)| flags)?;

        let mut state = LinkState::default();
        for flag in flags.split(',') {
            match flag {
                "UP" => state.up = true,
                "LOWER_UP" => state.lower_up = true,
                "NO-CARRIER" => state.no_carrier = true,
                _ => {}
            }
        }

        let mut words = header.split_whitespace();
        while let Some(word) = words.next() {
            if word == "master" {
                state.master = words.next().map(str::to_string);
            }
        }
        Some(state)
    }

    /// Administratively up with a working link.
    pub fn is_healthy(&self) -> bool {
        self.up && !self.no_carrier
    }

    /// One-line summary for reports.
    pub fn describe(&self) -> String {
        let mut parts = vec![if self.up { "UP" } else { "DOWN" }];
        if self.lower_up {
            parts.push("LOWER_UP");
        }
        if self.no_carrier {
            parts.push("NO-CARRIER");
        }
        let mut summary = parts.join(",");
        if let Some(master) = &self.master {
            summary.push_str(&format!(" master {}", master));
        }
        summary
    }
}

/// Interface names from `ip link show` output (`12: vm_sql@if3: <...>`).
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| !l.starts_with(' ') && !l.starts_with('\t'))
        .filter_map(|l| {
            let mut fields = l.splitn(3, ':');
            let index = fields.next()?.trim();
            index.parse::<u32>().ok()?;
            let name = fields.next()?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Address of the bridge without prefix length.
pub fn gateway_address(net: &NetworkOptions) -> &str {
    net.gateway_cidr
        .split('/')
        .next()
        .unwrap_or(&net.gateway_cidr)
}

pub fn create_bridge(net: &NetworkOptions) -> String {
    format!("ip link add name {} type bridge", net.bridge)
}

pub fn assign_bridge_address(net: &NetworkOptions) -> String {
    format!(
        "ip addr add {} dev {} 2>/dev/null || true",
        net.gateway_cidr, net.bridge
    )
}

pub fn link_up(iface: &str) -> String {
    format!("ip link set {} up", iface)
}

pub fn attach_to_bridge(iface: &str, net: &NetworkOptions) -> String {
    format!("ip link set {} master {}", iface, net.bridge)
}

pub fn show_bridge_address(net: &NetworkOptions) -> String {
    format!("ip addr show {} 2>/dev/null || true", net.bridge)
}

pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

pub fn enable_forwarding() -> String {
    format!("echo 1 > {}", IP_FORWARD_PATH)
}

pub fn read_forwarding() -> String {
    format!("cat {}", IP_FORWARD_PATH)
}

/// Give the main table precedence over the per-uplink tables.
pub fn ensure_main_route_rule() -> String {
    "ip rule del from all lookup main pref 1 2>/dev/null; ip rule add from all lookup main pref 1"
        .to_string()
}

fn nat_rule(net: &NetworkOptions) -> String {
    format!(
        "POSTROUTING -s {} -o {} -j MASQUERADE",
        net.subnet, net.uplink
    )
}

fn forward_out_rule(iface: &str, net: &NetworkOptions) -> String {
    format!("FORWARD -i {} -o {} -j ACCEPT", iface, net.uplink)
}

fn forward_in_rule(iface: &str, net: &NetworkOptions) -> String {
    format!(
        "FORWARD -i {} -o {} -m state --state RELATED,ESTABLISHED -j ACCEPT",
        net.uplink, iface
    )
}

/// Idempotent `-C || -A` form of an iptables rule.
fn ensure_rule(table: Option<&str>, rule: &str) -> String {
    let table = table.map(|t| format!("-t {} ", t)).unwrap_or_default();
    format!(
        "iptables {t}-C {r} 2>/dev/null || iptables {t}-A {r}",
        t = table,
        r = rule
    )
}

fn delete_rule(table: Option<&str>, rule: &str) -> String {
    let table = table.map(|t| format!("-t {} ", t)).unwrap_or_default();
    format!("iptables {}-D {} 2>/dev/null || true", table, rule)
}

/// NAT and bridge forwarding rules for the shared subnet.
pub fn ensure_nat_and_forwarding(net: &NetworkOptions) -> Vec<String> {
    vec![
        ensure_rule(Some("nat"), &nat_rule(net)),
        ensure_rule(None, &forward_out_rule(&net.bridge, net)),
        ensure_rule(None, &forward_in_rule(&net.bridge, net)),
    ]
}

/// Commands that undo everything a guest's start set up on the host side.
///
/// Each command is independent and delete-if-exists.
pub fn teardown_commands(service: &ServiceDescriptor, net: &NetworkOptions) -> Vec<String> {
    let tap = &service.network().tap;
    let subnet = &service.network().subnet;
    let mut commands = vec![
        format!("ip link del {} 2>/dev/null || true", tap),
        delete_rule(Some("nat"), &nat_rule(net)),
        delete_rule(None, &forward_out_rule(tap, net)),
        delete_rule(None, &forward_in_rule(tap, net)),
    ];
    if service.policy_routing() {
        commands.push("ip rule del from all lookup main pref 1 2>/dev/null || true".to_string());
        commands.push(format!(
            "ip rule del from {} lookup {} 2>/dev/null || true",
            subnet, net.uplink
        ));
        commands.push(format!(
            "ip rule del from {} lookup main 2>/dev/null || true",
            subnet
        ));
    }
    commands
}
