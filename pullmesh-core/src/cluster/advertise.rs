//! Advertise-address autodetection.
//!
//! Peers must be able to reach this node back, so loopback addresses are
//! useless. Among the remaining IPv4 candidates a `10.0.0.0/8` address wins
//! immediately (the usual cluster-internal range); otherwise the last
//! candidate seen is used.

use std::net::IpAddr;

/// Returns the IPv4 address this node should advertise, or `None` when no
/// non-loopback candidate exists.
pub fn advertise_ip() -> Option<String> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(error) => {
            tracing::warn!(error = %error, "failed to enumerate network interfaces");
            return None;
        }
    };

    let candidates: Vec<IpAddr> = interfaces.iter().map(|interface| interface.ip()).collect();
    pick_advertise_ip(&candidates).map(|ip| ip.to_string())
}

fn pick_advertise_ip(candidates: &[IpAddr]) -> Option<IpAddr> {
    let mut chosen = None;
    for candidate in candidates {
        let v4 = match candidate {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => continue,
        };
        if v4.is_loopback() {
            continue;
        }
        chosen = Some(*candidate);
        if v4.octets()[0] == 10 {
            break;
        }
    }
    chosen
}
