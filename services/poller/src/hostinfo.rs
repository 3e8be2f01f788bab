//! Host facts collected for `host_info.get`.

use zp_protocol::{now_timestamp_millis, HostInfoResult};

/// Collect the current host facts.
///
/// Everything comes from the standard library; absence of a fact (hostname)
/// is reported as null rather than an error.
pub fn collect(process_version: &str) -> HostInfoResult {
    HostInfoResult {
        hostname: hostname(),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        cpus: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        pid: std::process::id(),
        process_version: process_version.to_owned(),
        timestamp: now_timestamp_millis(),
    }
}

fn hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return Some(name);
        }
    }
    // Linux fallback; other platforms just report null.
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_reports_platform_facts() {
        let info = collect("1.2.3");
        assert_eq!(info.process_version, "1.2.3");
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert!(info.cpus >= 1);
        assert!(info.pid > 0);
        assert!(info.timestamp > 0);
    }
}
