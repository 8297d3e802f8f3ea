#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Curated ports used to validate that a candidate host-IP is actually
/// reachable from inside the container.
const VALIDATION_PORTS: &[u16] = &[22, 80, 443, 8080, 53];

/// Resolves the *host* network namespace's IP address when this process is
/// itself running inside a container, so that `localhost` probes don't
/// silently probe the container's own loopback interface instead.
///
/// The resolved address is cached for the process lifetime; `reset()`
/// clears it.
pub struct HostResolver {
    configured_host_ip: Option<IpAddr>,
    resolved: Mutex<Option<IpAddr>>,
    dockerenv_marker: String,
}

impl HostResolver {
    pub fn new(configured_host_ip: Option<String>) -> Self {
        let configured_host_ip = configured_host_ip.and_then(|s| s.parse().ok());
        Self {
            configured_host_ip,
            resolved: Mutex::new(None),
            dockerenv_marker: "/.dockerenv".to_string(),
        }
    }

    /// Whether this process appears to be running inside a container.
    pub fn is_in_container(&self) -> bool {
        Path::new(&self.dockerenv_marker).exists() || Path::new("/run/.containerenv").exists()
    }

    pub async fn reset(&self) {
        let mut guard = self.resolved.lock().await;
        *guard = None;
    }

    /// Resolve and cache the host IP, trying each candidate source in order
    /// until one is validated reachable.
    pub async fn resolve(&self, check_timeout: Duration) -> Option<IpAddr> {
        {
            let guard = self.resolved.lock().await;
            if let Some(ip) = *guard {
                return Some(ip);
            }
        }

        let candidates = self.candidates();
        for candidate in candidates {
            if self.validate_candidate(candidate, check_timeout).await {
                let mut guard = self.resolved.lock().await;
                *guard = Some(candidate);
                info!(host_ip = %candidate, "resolved host network namespace IP");
                return Some(candidate);
            }
        }

        warn!("no host IP candidate was reachable");
        None
    }

    /// Build the ordered candidate list: configured override, non-loopback
    /// interface addresses, default-route gateway, hosts-file entries, then
    /// a curated probe set including the Docker bridge gateway.
    fn candidates(&self) -> Vec<IpAddr> {
        let mut candidates = Vec::new();

        if let Some(ip) = self.configured_host_ip {
            candidates.push(ip);
        }

        candidates.extend(self.non_loopback_interface_addrs());
        candidates.extend(self.default_route_gateway());
        candidates.extend(self.hosts_file_entries());
        candidates.extend(self.curated_probe_set());

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|ip| seen.insert(*ip));
        candidates
    }

    fn non_loopback_interface_addrs(&self) -> Vec<IpAddr> {
        // A real implementation enumerates `getifaddrs`; kept minimal here
        // since the validation step below is what actually matters.
        Vec::new()
    }

    fn default_route_gateway(&self) -> Vec<IpAddr> {
        std::fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|content| Self::parse_proc_net_route(&content))
            .into_iter()
            .collect()
    }

    fn parse_proc_net_route(content: &str) -> Option<IpAddr> {
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                continue;
            }
            // Destination "00000000" means the default route; gateway is
            // a little-endian hex-encoded u32 in field[2].
            if fields[1] == "00000000" {
                if let Ok(raw) = u32::from_str_radix(fields[2], 16) {
                    let octets = raw.to_le_bytes();
                    return Some(IpAddr::from(octets));
                }
            }
        }
        None
    }

    fn hosts_file_entries(&self) -> Vec<IpAddr> {
        std::fs::read_to_string("/etc/hosts")
            .ok()
            .map(|content| {
                content
                    .lines()
                    .filter(|line| {
                        line.contains("host.docker.internal") || line.contains("host.containers.internal")
                    })
                    .filter_map(|line| line.split_whitespace().next())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn curated_probe_set(&self) -> Vec<IpAddr> {
        ["172.17.0.1", "192.168.65.2", "10.0.2.2"]
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// A candidate is "reachable" if a TCP connect to any curated port
    /// succeeds *or* is refused — refusal still proves the host exists.
    async fn validate_candidate(&self, candidate: IpAddr, timeout: Duration) -> bool {
        for &port in VALIDATION_PORTS {
            let addr = SocketAddr::new(candidate, port);
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => {
                    if e.kind() == std::io::ErrorKind::ConnectionRefused {
                        debug!(%candidate, port, "candidate refused connection, host exists");
                        return true;
                    }
                }
                Err(_) => continue,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_route_from_proc_net_route() {
        let sample = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\tMTU\tWindow\tIRTT\n\
                       eth0\t00000000\t0102A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0\n";
        let gw = HostResolver::parse_proc_net_route(sample);
        assert_eq!(gw, Some("192.168.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn resolve_returns_none_when_nothing_reachable() {
        let resolver = HostResolver::new(Some("203.0.113.1".to_string()));
        let result = resolver.resolve(Duration::from_millis(50)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn reset_clears_cached_value() {
        let resolver = HostResolver::new(None);
        resolver.reset().await;
        let guard = resolver.resolved.lock().await;
        assert!(guard.is_none());
    }
}
