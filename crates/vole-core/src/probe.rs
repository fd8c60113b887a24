// Availability probes — how many cores and how much memory we may use
//
// Inside a container the hardware numbers lie: a pod limited to 2 CPUs on a
// 64-core host must not spin up 64 workers. On Linux, when we detect a
// container, the cgroup limits take precedence:
//
//   cores:  cgroup v1  cpu.cfs_quota_us / cpu.cfs_period_us  (rounded up)
//           cgroup v2  cpu.max = "<quota> <period>" or "max <period>"
//           then the thread's CPU affinity (cpuset), via available_parallelism
//           a quota never yields more cores than the affinity allows
//   memory: cgroup v1  memory.limit_in_bytes - memory.usage_in_bytes
//           cgroup v2  memory.max - memory.current
//
// Nothing here fails: an unreadable or malformed file means "no
// information", never an error. Elsewhere the answers are the OS-reported
// parallelism (minimum 1) and "unlimited" (usize::MAX).

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Number of CPU cores this process may use, at least 1.
///
/// Computed once and cached for the lifetime of the process.
pub fn available_cpu_cores() -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    *CORES.get_or_init(|| {
        let cores = detect_cpu_cores(Path::new(CGROUP_ROOT), is_in_container());
        log::debug!("available cpu cores: {cores}");
        cores
    })
}

/// Bytes of memory this process may still allocate; `usize::MAX` when no
/// limit is known.
pub fn ram_limit() -> usize {
    detect_ram_limit(Path::new(CGROUP_ROOT), is_in_container())
}

/// Whether we are running inside docker, podman or kubernetes.
pub fn is_in_container() -> bool {
    static IN_CONTAINER: OnceLock<bool> = OnceLock::new();
    *IN_CONTAINER.get_or_init(|| {
        if !cfg!(target_os = "linux") {
            return false;
        }
        if Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists() {
            return true;
        }
        std::fs::read_to_string("/proc/self/cgroup")
            .map(|s| cgroup_mentions_container(&s))
            .unwrap_or(false)
    })
}

fn cgroup_mentions_container(content: &str) -> bool {
    ["docker", "kubepods", "containerd", "libpod"]
        .iter()
        .any(|marker| content.contains(marker))
}

/// Core count for a given cgroup mount point.
pub fn detect_cpu_cores(cgroup_root: &Path, in_container: bool) -> usize {
    if in_container {
        if let Some(n) = cgroup_cpu_quota(cgroup_root) {
            return n.min(hardware_concurrency());
        }
    }
    hardware_concurrency()
}

/// Memory headroom for a given cgroup mount point.
pub fn detect_ram_limit(cgroup_root: &Path, in_container: bool) -> usize {
    if in_container {
        if let Some(bytes) = cgroup_memory_headroom(cgroup_root) {
            return bytes;
        }
    }
    usize::MAX
}

/// OS-reported parallelism (affinity-aware on Linux), at least 1.
fn hardware_concurrency() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            log::warn!("cannot query available parallelism ({e}), assuming 1 core");
            1
        }
    }
}

fn cgroup_cpu_quota(root: &Path) -> Option<usize> {
    // cgroup v1
    let quota: i64 = read_value_from_file(&root.join("cpu/cpu.cfs_quota_us"), -1);
    let period: i64 = read_value_from_file(&root.join("cpu/cpu.cfs_period_us"), -1);
    if let Some(n) = cores_from_quota(quota, period) {
        return Some(n);
    }
    // cgroup v2
    std::fs::read_to_string(root.join("cpu.max"))
        .ok()
        .and_then(|s| parse_cpu_max(&s))
}

fn cgroup_memory_headroom(root: &Path) -> Option<usize> {
    // cgroup v1
    let limit: u64 = read_value_from_file(&root.join("memory/memory.limit_in_bytes"), 0);
    let used: u64 = read_value_from_file(&root.join("memory/memory.usage_in_bytes"), 0);
    if let Some(bytes) = memory_headroom(limit, used) {
        return Some(bytes);
    }
    // cgroup v2: memory.max is "max" when unlimited, which fails to parse
    let limit: u64 = read_value_from_file(&root.join("memory.max"), 0);
    let used: u64 = read_value_from_file(&root.join("memory.current"), 0);
    memory_headroom(limit, used)
}

/// Cores granted by a CFS quota. Rounds up: `--cpus 0.1` still gets 1 core.
/// Non-positive values mean "no quota". Saturates at `usize::MAX`.
pub fn cores_from_quota(quota: i64, period: i64) -> Option<usize> {
    if quota > 0 && period > 0 {
        let cores = quota.unsigned_abs().div_ceil(period.unsigned_abs());
        Some(usize::try_from(cores).unwrap_or(usize::MAX))
    } else {
        None
    }
}

/// Parse a cgroup v2 `cpu.max` line: `"200000 100000"` → 2, `"max 100000"` → None.
pub fn parse_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?.parse::<i64>().ok()?;
    let period = parts
        .next()
        .map(|p| p.parse::<i64>().ok())
        .unwrap_or(Some(100_000))?;
    cores_from_quota(quota, period)
}

/// Remaining bytes under a limit, `None` when the limit is unknown or exhausted.
pub fn memory_headroom(limit: u64, used: u64) -> Option<usize> {
    if limit > used {
        Some(usize::try_from(limit - used).unwrap_or(usize::MAX))
    } else {
        None
    }
}

/// Read one whitespace-trimmed value from a file, `default` on any failure.
fn read_value_from_file<T: FromStr>(path: &Path, default: T) -> T {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}
