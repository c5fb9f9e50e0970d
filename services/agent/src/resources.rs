//! Host capacity measurement.
//!
//! Totals come from the kernel unless overridden in config; reserved
//! sums are derived by the registry from currently-allocated containers.

use convoy_types::HostResources;

use crate::config::Config;

/// Measure this host's resources, applying config overrides and the
/// configured volume set.
pub fn measure(config: &Config) -> HostResources {
    let memory_total_mb = config
        .memory_total_mb
        .unwrap_or_else(|| get_memory_total_bytes() as u64 / (1024 * 1024));
    let cpus_total = config.cpus_total.unwrap_or_else(|| get_cpu_count() as f64);

    HostResources {
        memory_total_mb,
        cpus_total,
        memory_reserved_mb: 0,
        cpus_reserved: 0.0,
        volumes: config.volumes.keys().cloned().collect(),
    }
}

fn get_cpu_count() -> i64 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as i64)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_total_bytes() -> i64 {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let total = parse_meminfo_total(&meminfo);
        if total > 0 {
            return total;
        }
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size > 0 && total_pages > 0 {
        return page_size * total_pages;
    }

    16 * 1024 * 1024 * 1024
}

#[cfg(not(target_os = "linux"))]
fn get_memory_total_bytes() -> i64 {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && total_pages > 0 {
            return page_size * total_pages;
        }
    }

    16 * 1024 * 1024 * 1024
}

#[cfg(target_os = "linux")]
fn parse_meminfo_total(content: &str) -> i64 {
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 && parts[0] == "MemTotal:" {
            const KB_TO_BYTES: i64 = 1024;
            return parts[1].parse().unwrap_or(0) * KB_TO_BYTES;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            run_root: "/tmp/convoy-test/run".to_string(),
            artifact_root: "/tmp/convoy-test/artifacts".to_string(),
            volumes: BTreeMap::from([("data".to_string(), "/srv/data".to_string())]),
            port_range: (20000, 20010),
            no_update_timeout: std::time::Duration::from_secs(30),
            restart_backoff_base: std::time::Duration::from_millis(100),
            restart_backoff_max: std::time::Duration::from_secs(5),
            memory_total_mb: None,
            cpus_total: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_measure_reports_positive_totals() {
        let r = measure(&test_config());
        assert!(r.memory_total_mb > 0);
        assert!(r.cpus_total >= 1.0);
        assert!(r.volumes.contains("data"));
        assert_eq!(r.memory_reserved_mb, 0);
    }

    #[test]
    fn test_overrides_win() {
        let mut config = test_config();
        config.memory_total_mb = Some(2048);
        config.cpus_total = Some(3.5);
        let r = measure(&config);
        assert_eq!(r.memory_total_mb, 2048);
        assert_eq!(r.cpus_total, 3.5);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_meminfo_total() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1234567 kB\n";
        assert_eq!(parse_meminfo_total(sample), 16384000 * 1024);
    }
}
