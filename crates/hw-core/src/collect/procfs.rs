//! Linux procfs/sysfs sampler.
//!
//! # Files Read
//! - `/proc/stat` - aggregate CPU times
//! - `/proc/meminfo` - memory totals
//! - `/proc/loadavg` - load average
//! - `/proc/[pid]/stat` - per-process ticks, threads, RSS
//! - `/sys/class/thermal/thermal_zone*/{type,temp}` - CPU temperature
//!
//! CPU percentages are deltas between consecutive samples, so the first
//! cycle after start reports the since-boot system average and zero for
//! processes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use hw_common::{CpuTemperature, ProcessInfo, SampleCycle, SystemSnapshot};
use tracing::{debug, trace};

use super::{CollectError, Sampler};

/// Aggregate CPU times from the first line of `/proc/stat`, in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Fields of interest from `/proc/[pid]/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidStat {
    pub pid: u32,
    pub comm: String,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    pub rss_pages: u64,
}

/// Memory totals from `/proc/meminfo`, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_times_content(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if values.len() < 4 {
        return None;
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user
    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Parse `/proc/meminfo`. Used memory is `MemTotal - MemAvailable`.
pub fn parse_meminfo_content(content: &str) -> Option<MemInfo> {
    let mut fields: HashMap<&str, u64> = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(kb) = value.parse::<u64>() {
            fields.insert(key.trim_end_matches(':'), kb * 1024);
        }
    }

    let total = *fields.get("MemTotal")?;
    let available = match fields.get("MemAvailable") {
        Some(v) => *v,
        None => {
            fields.get("MemFree").copied().unwrap_or(0)
                + fields.get("Buffers").copied().unwrap_or(0)
                + fields.get("Cached").copied().unwrap_or(0)
        }
    };
    Some(MemInfo {
        total_bytes: total,
        used_bytes: total.saturating_sub(available),
    })
}

/// Parse the one-minute load average from `/proc/loadavg`.
pub fn parse_loadavg_content(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Parse `/proc/[pid]/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub fn parse_pid_stat_content(content: &str) -> Option<PidStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_string();

    // Index 0 is field 3 (state)
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let field = |idx: usize| rest.get(idx).and_then(|v| v.parse::<u64>().ok());

    Some(PidStat {
        pid,
        comm,
        utime: field(11)?,
        stime: field(12)?,
        num_threads: field(17)? as u32,
        rss_pages: field(21)?,
    })
}

/// Parse a thermal zone `temp` file (millidegrees Celsius).
pub fn parse_thermal_content(content: &str) -> Option<f32> {
    let millis: i64 = content.trim().parse().ok()?;
    Some(millis as f32 / 1000.0)
}

/// System clock ticks per second.
#[cfg(unix)]
pub fn clk_tck() -> u64 {
    static CLK_TCK: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            tck as u64
        } else {
            100
        }
    })
}

#[cfg(not(unix))]
pub fn clk_tck() -> u64 {
    100
}

/// Memory page size in bytes.
#[cfg(unix)]
pub fn page_size() -> u64 {
    static PAGE_SIZE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    })
}

#[cfg(not(unix))]
pub fn page_size() -> u64 {
    4096
}

/// Thermal zone types treated as the CPU package sensor, best first.
const CPU_SENSOR_TYPES: &[&str] = &["x86_pkg_temp", "cpu-thermal", "cpu_thermal", "soc_thermal"];

/// Samples a Linux host through procfs and sysfs.
pub struct ProcfsSampler {
    proc_root: PathBuf,
    sys_root: PathBuf,
    max_processes: usize,
    clk_tck: u64,
    page_size: u64,
    last_cpu: Option<CpuTimes>,
    last_ticks: HashMap<u32, u64>,
    last_sample: Option<Instant>,
}

impl ProcfsSampler {
    pub fn new(max_processes: usize) -> Self {
        Self::with_roots("/proc", "/sys", max_processes)
    }

    /// Sample from alternative roots (containers with a bind-mounted host /proc, tests).
    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
        max_processes: usize,
    ) -> Self {
        ProcfsSampler {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            max_processes,
            clk_tck: clk_tck(),
            page_size: page_size(),
            last_cpu: None,
            last_ticks: HashMap::new(),
            last_sample: None,
        }
    }

    fn read(&self, path: &Path) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                trace!(path = %path.display(), error = %e, "procfs read failed");
                None
            }
        }
    }

    fn sample_system(&mut self) -> Option<SystemSnapshot> {
        let cpu = parse_cpu_times_content(&self.read(&self.proc_root.join("stat"))?)?;
        let mem = parse_meminfo_content(&self.read(&self.proc_root.join("meminfo"))?)?;
        let load = self
            .read(&self.proc_root.join("loadavg"))
            .and_then(|c| parse_loadavg_content(&c))
            .unwrap_or(0.0);

        let (busy, total) = match self.last_cpu {
            Some(prev) if cpu.total > prev.total => (
                cpu.busy.saturating_sub(prev.busy),
                cpu.total - prev.total,
            ),
            _ => (cpu.busy, cpu.total),
        };
        self.last_cpu = Some(cpu);

        let cpu_percent = if total == 0 {
            0.0
        } else {
            (busy as f64 / total as f64 * 100.0) as f32
        };

        Some(SystemSnapshot {
            cpu_percent,
            memory_used_bytes: mem.used_bytes,
            memory_total_bytes: mem.total_bytes,
            load_avg_1: load,
        })
    }

    fn sample_processes(&mut self, elapsed_secs: Option<f64>) -> Vec<ProcessInfo> {
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return Vec::new();
        };

        let mut ticks = HashMap::new();
        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes exit between listing and reading; skip them
            let Some(stat) = self
                .read(&entry.path().join("stat"))
                .and_then(|c| parse_pid_stat_content(&c))
            else {
                continue;
            };

            let total_ticks = stat.utime + stat.stime;
            let cpu_percent = match (elapsed_secs, self.last_ticks.get(&pid)) {
                (Some(secs), Some(prev)) if secs > 0.0 => {
                    let delta = total_ticks.saturating_sub(*prev) as f64;
                    (delta / (secs * self.clk_tck as f64) * 100.0) as f32
                }
                _ => 0.0,
            };
            ticks.insert(pid, total_ticks);

            processes.push(ProcessInfo {
                pid,
                name: stat.comm,
                cpu_percent,
                memory_bytes: stat.rss_pages * self.page_size,
                thread_count: stat.num_threads,
            });
        }
        self.last_ticks = ticks;

        processes.sort_by(|a, b| {
            b.cpu_percent
                .total_cmp(&a.cpu_percent)
                .then(b.memory_bytes.cmp(&a.memory_bytes))
                .then(a.pid.cmp(&b.pid))
        });
        processes.truncate(self.max_processes);
        processes
    }

    fn sample_temperature(&self) -> Option<CpuTemperature> {
        let thermal = self.sys_root.join("class").join("thermal");
        let mut zones: Vec<PathBuf> = fs::read_dir(&thermal)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("thermal_zone"))
            })
            .collect();
        zones.sort();

        let mut readings = Vec::new();
        for zone in zones {
            let sensor = self
                .read(&zone.join("type"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            if let Some(celsius) = self
                .read(&zone.join("temp"))
                .and_then(|c| parse_thermal_content(&c))
            {
                readings.push(CpuTemperature { celsius, sensor });
            }
        }

        let preferred = CPU_SENSOR_TYPES
            .iter()
            .find_map(|ty| readings.iter().position(|r| r.sensor == *ty));
        match preferred {
            Some(idx) => Some(readings.swap_remove(idx)),
            None => readings.into_iter().next(),
        }
    }
}

impl Sampler for ProcfsSampler {
    fn sample(&mut self) -> Result<SampleCycle, CollectError> {
        if !self.proc_root.is_dir() {
            return Err(CollectError::Unavailable(format!(
                "{} is not mounted",
                self.proc_root.display()
            )));
        }

        let now = Instant::now();
        let elapsed_secs = self
            .last_sample
            .map(|prev| now.duration_since(prev).as_secs_f64());
        self.last_sample = Some(now);

        let cycle = SampleCycle {
            system: self.sample_system(),
            processes: self.sample_processes(elapsed_secs),
            temperature: self.sample_temperature(),
        };
        debug!(
            processes = cycle.processes.len(),
            has_system = cycle.system.is_some(),
            has_temperature = cycle.temperature.is_some(),
            "sampled host telemetry"
        );
        Ok(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STAT: &str = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 100 0 50 800 50 0 0 0 0 0\n";
    const MEMINFO: &str = "MemTotal:        8000 kB\nMemFree:         1000 kB\nMemAvailable:    6000 kB\n";
    const PID_STAT: &str = "42 (my (odd) proc) S 1 42 42 0 -1 4194560 100 0 0 0 30 20 0 0 20 0 3 0 1000 123456 250 18446744073709551615";

    #[test]
    fn test_parse_cpu_times() {
        let cpu = parse_cpu_times_content(STAT).unwrap();
        assert_eq!(cpu.total, 1000);
        assert_eq!(cpu.busy, 150);
        assert!(parse_cpu_times_content("intr 1 2 3").is_none());
    }

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let mem = parse_meminfo_content(MEMINFO).unwrap();
        assert_eq!(mem.total_bytes, 8000 * 1024);
        assert_eq!(mem.used_bytes, 2000 * 1024);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let mem = parse_meminfo_content(
            "MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 300 kB\n",
        )
        .unwrap();
        assert_eq!(mem.used_bytes, 400 * 1024);
        assert!(parse_meminfo_content("MemFree: 1 kB\n").is_none());
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg_content("0.52 0.40 0.33 1/123 4567\n"), Some(0.52));
        assert_eq!(parse_loadavg_content(""), None);
    }

    #[test]
    fn test_parse_pid_stat_with_parens_in_comm() {
        let stat = parse_pid_stat_content(PID_STAT).unwrap();
        assert_eq!(stat.pid, 42);
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.utime, 30);
        assert_eq!(stat.stime, 20);
        assert_eq!(stat.num_threads, 3);
        assert_eq!(stat.rss_pages, 250);
    }

    #[test]
    fn test_parse_thermal() {
        assert_eq!(parse_thermal_content("47500\n"), Some(47.5));
        assert_eq!(parse_thermal_content("n/a"), None);
    }

    fn fake_host(dir: &TempDir) -> (PathBuf, PathBuf) {
        let proc_root = dir.path().join("proc");
        let sys_root = dir.path().join("sys");
        fs::create_dir_all(proc_root.join("42")).unwrap();
        fs::create_dir_all(proc_root.join("self")).unwrap();
        fs::write(proc_root.join("stat"), STAT).unwrap();
        fs::write(proc_root.join("meminfo"), MEMINFO).unwrap();
        fs::write(proc_root.join("loadavg"), "1.25 1.00 0.75 2/100 999\n").unwrap();
        fs::write(proc_root.join("42").join("stat"), PID_STAT).unwrap();

        let zone0 = sys_root.join("class/thermal/thermal_zone0");
        let zone1 = sys_root.join("class/thermal/thermal_zone1");
        fs::create_dir_all(&zone0).unwrap();
        fs::create_dir_all(&zone1).unwrap();
        fs::write(zone0.join("type"), "acpitz\n").unwrap();
        fs::write(zone0.join("temp"), "30000\n").unwrap();
        fs::write(zone1.join("type"), "x86_pkg_temp\n").unwrap();
        fs::write(zone1.join("temp"), "55000\n").unwrap();
        (proc_root, sys_root)
    }

    #[test]
    fn test_sampler_reads_fake_host() {
        let dir = TempDir::new().unwrap();
        let (proc_root, sys_root) = fake_host(&dir);
        let mut sampler = ProcfsSampler::with_roots(&proc_root, &sys_root, 10);

        let cycle = sampler.sample().unwrap();
        let system = cycle.system.unwrap();
        assert!((system.cpu_percent - 15.0).abs() < 0.01);
        assert_eq!(system.load_avg_1, 1.25);
        assert_eq!(cycle.processes.len(), 1);
        assert_eq!(cycle.processes[0].name, "my (odd) proc");
        assert_eq!(cycle.processes[0].cpu_percent, 0.0);
        let temp = cycle.temperature.unwrap();
        assert_eq!(temp.sensor, "x86_pkg_temp");
        assert_eq!(temp.celsius, 55.0);
    }

    #[test]
    fn test_second_sample_uses_deltas() {
        let dir = TempDir::new().unwrap();
        let (proc_root, sys_root) = fake_host(&dir);
        let mut sampler = ProcfsSampler::with_roots(&proc_root, &sys_root, 10);
        sampler.sample().unwrap();

        // 100 more ticks, all busy
        fs::write(proc_root.join("stat"), "cpu  200 0 50 800 50 0 0 0 0 0\n").unwrap();
        let cycle = sampler.sample().unwrap();
        assert!((cycle.system.unwrap().cpu_percent - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_missing_sensors_yield_partial_sample() {
        let dir = TempDir::new().unwrap();
        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();
        let mut sampler = ProcfsSampler::with_roots(&proc_root, dir.path().join("sys"), 10);

        let cycle = sampler.sample().unwrap();
        assert!(cycle.system.is_none());
        assert!(cycle.processes.is_empty());
        assert!(cycle.temperature.is_none());
    }

    #[test]
    fn test_missing_proc_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut sampler = ProcfsSampler::with_roots(dir.path().join("nope"), dir.path(), 10);
        assert!(matches!(
            sampler.sample(),
            Err(CollectError::Unavailable(_))
        ));
    }
}
