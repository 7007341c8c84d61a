use pullmesh_core::cluster::advertise;
use pullmesh_core::{PullError, Result};
use std::path::PathBuf;

/// Runtime settings for one proxy agent node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the HTTP listener binds to.
    pub bind_addr: String,
    /// Port the HTTP listener binds to (0 picks an ephemeral port).
    pub port: u16,
    /// Seed peer (`host:port`) to join; `None` bootstraps a standalone mesh.
    pub peer: Option<String>,
    /// Address advertised to peers, `host` or `host:port`. Autodetected
    /// from the network interfaces when omitted.
    pub advertise_addr: Option<String>,
    /// Directory layer files are cached under.
    pub data_dir: PathBuf,
}

impl AgentConfig {
    /// Resolves the `host:port` address peers reach this node at. `port` is
    /// the actually bound listener port and is appended unless the
    /// configured address already carries one. A node nobody can reach back
    /// is useless, so autodetection failure is fatal.
    pub fn resolved_advertise_addr(&self, port: u16) -> Result<String> {
        if let Some(configured) = self.advertise_addr.as_deref() {
            let configured = configured.trim();
            if !configured.is_empty() {
                if configured.contains(':') {
                    return Ok(configured.to_string());
                }
                return Ok(format!("{}:{}", configured, port));
            }
        }

        match advertise::advertise_ip() {
            Some(ip) => Ok(format!("{}:{}", ip, port)),
            None => Err(PullError::Config(
                "no non-loopback address available for advertising; pass --advertise-addr"
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(advertise_addr: Option<&str>) -> AgentConfig {
        AgentConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 5000,
            peer: None,
            advertise_addr: advertise_addr.map(str::to_string),
            data_dir: PathBuf::from("/tmp/pullmesh"),
        }
    }

    #[test]
    fn test_configured_host_gets_listener_port_appended() {
        let resolved = config(Some("10.1.2.3")).resolved_advertise_addr(5000).unwrap();
        assert_eq!(resolved, "10.1.2.3:5000");
    }

    #[test]
    fn test_configured_host_port_is_used_verbatim() {
        let resolved = config(Some("10.1.2.3:9999"))
            .resolved_advertise_addr(5000)
            .unwrap();
        assert_eq!(resolved, "10.1.2.3:9999");
    }
}
