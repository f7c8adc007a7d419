//! Privilege detection for link and route mutation.

/// Capability number of `CAP_NET_ADMIN`.
const CAP_NET_ADMIN: u32 = 12;

/// Whether the current process may mutate links and routes.
///
/// True when running as root or when `CAP_NET_ADMIN` is in the effective set.
pub fn has_net_admin() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid takes no arguments and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            return true;
        }
    }

    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| effective_caps(&status))
        .map(|caps| caps & (1u64 << CAP_NET_ADMIN) != 0)
        .unwrap_or(false)
}

/// Parse the `CapEff` mask out of `/proc/<pid>/status`.
fn effective_caps(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}
