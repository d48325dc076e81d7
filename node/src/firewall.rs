//! iptables-based traffic counters for tunnels.
//!
//! A dedicated `SMITE_TRACK` chain is jumped to from INPUT and OUTPUT; each
//! tunnel gets four ACCEPT rules (tcp/udp × in/out) tagged with a
//! `smite-<tunnel_id>` comment. The rules only count — they never drop,
//! reject, or mangle. IPv6 is handled on a best-effort basis: ip6tables
//! failures are logged and never fatal.

use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, warn};

pub const CHAIN_NAME: &str = "SMITE_TRACK";

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to run {binary}: {source}")]
    Exec {
        binary: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} {args} failed: {stderr}")]
    CommandFailed {
        binary: &'static str,
        args: String,
        stderr: String,
    },
}

fn binary_for(ipv6: bool) -> &'static str {
    if ipv6 {
        "ip6tables"
    } else {
        "iptables"
    }
}

fn run(ipv6: bool, args: &[&str]) -> Result<std::process::Output, FirewallError> {
    let binary = binary_for(ipv6);
    Command::new(binary)
        .args(args)
        .output()
        .map_err(|source| FirewallError::Exec { binary, source })
}

fn run_checked(ipv6: bool, args: &[&str]) -> Result<(), FirewallError> {
    let output = run(ipv6, args)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(FirewallError::CommandFailed {
            binary: binary_for(ipv6),
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Create the tracking chain and hook it into INPUT/OUTPUT if it is not
/// there yet. Idempotent; safe to call before every rule insertion.
fn ensure_chain(ipv6: bool) -> Result<(), FirewallError> {
    let exists = run(ipv6, &["-L", CHAIN_NAME])?.status.success();
    if exists {
        return Ok(());
    }

    run_checked(ipv6, &["-N", CHAIN_NAME])?;
    info!(chain = CHAIN_NAME, ipv6, "created firewall tracking chain");

    for hook in ["INPUT", "OUTPUT"] {
        let jump_present = run(ipv6, &["-C", hook, "-j", CHAIN_NAME])?.status.success();
        if !jump_present {
            let _ = run(ipv6, &["-I", hook, "-j", CHAIN_NAME]);
        }
    }

    Ok(())
}

fn rule_comment(tunnel_id: &str) -> String {
    format!("smite-{}", tunnel_id)
}

/// Install the four counting rules for a locally-bound port.
pub fn add_port_rules(tunnel_id: &str, port: u16, ipv6: bool) -> Result<(), FirewallError> {
    ensure_chain(ipv6)?;

    let comment = rule_comment(tunnel_id);
    let listing = run(ipv6, &["-L", CHAIN_NAME, "-n", "-v", "--line-numbers"])?;
    if String::from_utf8_lossy(&listing.stdout).contains(&comment) {
        debug!(tunnel_id, port, "tracking rules already present");
        return Ok(());
    }

    let port = port.to_string();
    for (proto, flag, suffix) in [
        ("tcp", "--dport", "tcp-in"),
        ("tcp", "--sport", "tcp-out"),
        ("udp", "--dport", "udp-in"),
        ("udp", "--sport", "udp-out"),
    ] {
        let tag = format!("{}-{}", comment, suffix);
        run_checked(
            ipv6,
            &[
                "-A", CHAIN_NAME, "-p", proto, flag, &port, "-m", "comment", "--comment", &tag,
                "-j", "ACCEPT",
            ],
        )?;
    }

    info!(tunnel_id, port = %port, ipv6, "added traffic counting rules");
    Ok(())
}

/// Install counting rules keyed on a remote host+port. Used for backhaul
/// clients, where the interesting traffic is outbound to the relay.
pub fn add_remote_rules(
    tunnel_id: &str,
    remote_host: &str,
    remote_port: u16,
    ipv6: bool,
) -> Result<(), FirewallError> {
    ensure_chain(ipv6)?;

    let comment = rule_comment(tunnel_id);
    let listing = run(ipv6, &["-L", CHAIN_NAME, "-n", "-v", "--line-numbers"])?;
    if String::from_utf8_lossy(&listing.stdout).contains(&comment) {
        debug!(tunnel_id, "tracking rules already present");
        return Ok(());
    }

    let port = remote_port.to_string();
    for (proto, addr_flag, port_flag, suffix) in [
        ("tcp", "-d", "--dport", "tcp-out"),
        ("tcp", "-s", "--sport", "tcp-in"),
        ("udp", "-d", "--dport", "udp-out"),
        ("udp", "-s", "--sport", "udp-in"),
    ] {
        let tag = format!("{}-{}", comment, suffix);
        run_checked(
            ipv6,
            &[
                "-A", CHAIN_NAME, "-p", proto, addr_flag, remote_host, port_flag, &port, "-m",
                "comment", "--comment", &tag, "-j", "ACCEPT",
            ],
        )?;
    }

    info!(tunnel_id, remote = %format!("{}:{}", remote_host, port), ipv6, "added remote traffic counting rules");
    Ok(())
}

/// Delete every rule tagged for this tunnel. Line numbers are collected
/// first and deleted in descending order so the remaining indices stay
/// stable.
pub fn remove_rules(tunnel_id: &str, ipv6: bool) -> Result<(), FirewallError> {
    let comment = rule_comment(tunnel_id);
    let listing = run(ipv6, &["-L", CHAIN_NAME, "-n", "-v", "--line-numbers"])?;
    let stdout = String::from_utf8_lossy(&listing.stdout);

    let mut line_numbers: Vec<u32> = stdout
        .lines()
        .filter(|line| line.contains(&comment))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|first| first.parse().ok())
        .collect();
    line_numbers.sort_unstable_by(|a, b| b.cmp(a));

    let removed = !line_numbers.is_empty();
    for line in line_numbers {
        let _ = run(ipv6, &["-D", CHAIN_NAME, &line.to_string()]);
    }

    if removed {
        info!(tunnel_id, ipv6, "removed traffic counting rules");
    }
    Ok(())
}

/// Sum the byte columns of every rule carrying this tunnel's comment.
pub fn traffic_bytes(tunnel_id: &str, ipv6: bool) -> Result<u64, FirewallError> {
    let comment = rule_comment(tunnel_id);
    let listing = run(ipv6, &["-L", CHAIN_NAME, "-n", "-v", "-x"])?;
    let stdout = String::from_utf8_lossy(&listing.stdout);

    let mut total = 0u64;
    let mut matched = 0usize;
    for line in stdout.lines() {
        if !line.contains(&comment) {
            continue;
        }
        matched += 1;
        // In `-x` output bytes is the second column, after pkts.
        if let Some(bytes) = line
            .split_whitespace()
            .nth(1)
            .and_then(|field| field.parse::<u64>().ok())
        {
            total += bytes;
        }
    }

    if matched == 0 {
        debug!(tunnel_id, ipv6, "no counting rules found");
    }
    Ok(total)
}

/// Install rules for both families; an ip6tables failure is demoted to a
/// warning because many hosts run without IPv6 netfilter.
pub fn track_port(tunnel_id: &str, port: u16) {
    if let Err(err) = add_port_rules(tunnel_id, port, false) {
        warn!(tunnel_id, port, error = %err, "failed to add IPv4 counting rules");
    }
    if let Err(err) = add_port_rules(tunnel_id, port, true) {
        warn!(tunnel_id, port, error = %err, "failed to add IPv6 counting rules");
    }
}

pub fn track_remote(tunnel_id: &str, remote_host: &str, remote_port: u16, ipv6: bool) {
    if let Err(err) = add_remote_rules(tunnel_id, remote_host, remote_port, ipv6) {
        warn!(tunnel_id, error = %err, "failed to add remote counting rules");
    }
}

pub fn untrack(tunnel_id: &str) {
    if let Err(err) = remove_rules(tunnel_id, false) {
        warn!(tunnel_id, error = %err, "failed to remove IPv4 counting rules");
    }
    if let Err(err) = remove_rules(tunnel_id, true) {
        warn!(tunnel_id, error = %err, "failed to remove IPv6 counting rules");
    }
}

/// Total bytes across both families.
pub fn total_traffic_bytes(tunnel_id: &str) -> u64 {
    let v4 = traffic_bytes(tunnel_id, false).unwrap_or(0);
    let v6 = traffic_bytes(tunnel_id, true).unwrap_or(0);
    v4 + v6
}
