//! Network interface address resolution.
//!
//! The daemon binds its TCP listener to the address of a named interface
//! (`--listen eth0`) rather than a literal address, and the discovery beacon
//! needs that interface's broadcast address.  Both come from one `getifaddrs`
//! walk.

use std::net::Ipv4Addr;

use anyhow::{anyhow, Context};

/// IPv4 address and derived broadcast address of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddrs {
    pub addr: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

/// Computes the directed broadcast address for `addr` under `mask`.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
/// use cangate_daemon::infrastructure::network::addr::broadcast_for;
///
/// let b = broadcast_for(Ipv4Addr::new(192, 168, 1, 42), Ipv4Addr::new(255, 255, 255, 0));
/// assert_eq!(b, Ipv4Addr::new(192, 168, 1, 255));
/// ```
pub fn broadcast_for(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(mask))
}

/// Resolves the first IPv4 address (and its broadcast address) of the named
/// interface.
///
/// # Errors
///
/// Fails when the interface list cannot be enumerated or the interface has no
/// IPv4 address.
#[cfg(unix)]
pub fn resolve_interface(name: &str) -> anyhow::Result<InterfaceAddrs> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(std::io::Error::last_os_error())
            .context("failed to enumerate network interfaces");
    }

    let mut found = None;
    let mut cursor = ifap;
    while !cursor.is_null() {
        // Safety: getifaddrs returned 0, so the list is valid until freed.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_netmask.is_null() {
            continue;
        }
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if family != libc::AF_INET as libc::sa_family_t {
            continue;
        }
        let ifname = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
        if ifname.to_bytes() != name.as_bytes() {
            continue;
        }

        let addr = ipv4_from_sockaddr(entry.ifa_addr);
        let mask = ipv4_from_sockaddr(entry.ifa_netmask);
        found = Some(InterfaceAddrs {
            addr,
            broadcast: broadcast_for(addr, mask),
        });
        break;
    }
    unsafe { libc::freeifaddrs(ifap) };

    found.ok_or_else(|| anyhow!("network interface '{name}' has no IPv4 address"))
}

#[cfg(not(unix))]
pub fn resolve_interface(name: &str) -> anyhow::Result<InterfaceAddrs> {
    Err(anyhow!(
        "interface address resolution for '{name}' is only supported on Unix platforms"
    ))
}

/// Extracts the IPv4 address from an `AF_INET` sockaddr pointer.
#[cfg(unix)]
fn ipv4_from_sockaddr(sa: *const libc::sockaddr) -> Ipv4Addr {
    // Safety: caller checked sa_family == AF_INET, so this is a sockaddr_in.
    let sin = unsafe { &*(sa as *const libc::sockaddr_in) };
    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_for_class_c_network() {
        let b = broadcast_for(
            Ipv4Addr::new(192, 168, 1, 42),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert_eq!(b, Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_broadcast_for_narrow_subnet() {
        let b = broadcast_for(
            Ipv4Addr::new(10, 0, 4, 17),
            Ipv4Addr::new(255, 255, 255, 240),
        );
        assert_eq!(b, Ipv4Addr::new(10, 0, 4, 31));
    }

    #[test]
    fn test_broadcast_for_zero_mask_is_limited_broadcast() {
        let b = broadcast_for(Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(b, Ipv4Addr::new(255, 255, 255, 255));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_loopback_interface() {
        // "lo" exists on Linux; macOS calls it "lo0".  Accept either, and
        // tolerate exotic environments where neither resolves.
        let lo = resolve_interface("lo").or_else(|_| resolve_interface("lo0"));
        if let Ok(addrs) = lo {
            assert_eq!(addrs.addr, Ipv4Addr::new(127, 0, 0, 1));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_unknown_interface_fails() {
        let result = resolve_interface("does-not-exist0");
        assert!(result.is_err());
    }
}
