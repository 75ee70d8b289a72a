//! Host resource snapshot shown next to the task list.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: Option<f64>,
    pub cpu_count: usize,
    pub memory_total_kb: u64,
    pub memory_used_kb: u64,
    pub disk_total_kb: Option<u64>,
    pub disk_used_kb: Option<u64>,
    pub gpus: Vec<GpuInfo>,
}

pub trait ResourceSampler {
    fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Linux sampler backed by `/proc`, `df` and `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct ProcResourceSampler {
    proc_root: PathBuf,
    disk_path: PathBuf,
    cpu_interval: Duration,
}

impl ProcResourceSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            disk_path: disk_path.into(),
            cpu_interval: Duration::from_millis(200),
        }
    }

    fn read_proc(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn cpu_percent(&self) -> Result<f64> {
        let first = parse_cpu_times(&self.read_proc("stat")?)?;
        thread::sleep(self.cpu_interval);
        let second = parse_cpu_times(&self.read_proc("stat")?)?;
        Ok(cpu_busy_percent(first, second))
    }
}

impl ResourceSampler for ProcResourceSampler {
    fn sample(&self) -> Result<ResourceSnapshot> {
        let (memory_total_kb, memory_used_kb) = parse_meminfo(&self.read_proc("meminfo")?)?;
        let cpu_percent = match self.cpu_percent() {
            Ok(percent) => Some(percent),
            Err(err) => {
                tracing::debug!(error = %err, "cpu sampling failed");
                None
            }
        };
        let disk = disk_usage(&self.disk_path);
        if let Err(err) = &disk {
            tracing::debug!(error = %err, "disk usage unavailable");
        }
        let (disk_total_kb, disk_used_kb) = match disk {
            Ok((total, used)) => (Some(total), Some(used)),
            Err(_) => (None, None),
        };

        Ok(ResourceSnapshot {
            cpu_percent,
            cpu_count: thread::available_parallelism().map_or(1, |n| n.get()),
            memory_total_kb,
            memory_used_kb,
            disk_total_kb,
            disk_used_kb,
            gpus: gpu_info(),
        })
    }
}

/// `(idle, total)` jiffies from the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_times(stat: &str) -> Result<(u64, u64)> {
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| anyhow!("no aggregate cpu line in /proc/stat"))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .context("malformed cpu line in /proc/stat")?;
    if fields.len() < 4 {
        bail!("cpu line in /proc/stat has {} fields", fields.len());
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok((idle, fields.iter().sum()))
}

pub fn cpu_busy_percent(first: (u64, u64), second: (u64, u64)) -> f64 {
    let total = second.1.saturating_sub(first.1);
    if total == 0 {
        return 0.0;
    }
    let idle = second.0.saturating_sub(first.0).min(total);
    (total - idle) as f64 * 100.0 / total as f64
}

/// `(total, used)` in KiB, where used excludes reclaimable memory.
pub fn parse_meminfo(meminfo: &str) -> Result<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse().ok())
    };
    let total = field("MemTotal").ok_or_else(|| anyhow!("MemTotal missing from /proc/meminfo"))?;
    let available = match field("MemAvailable") {
        Some(available) => available,
        None => field("MemFree").unwrap_or(0) + field("Cached").unwrap_or(0),
    };
    Ok((total, total.saturating_sub(available)))
}

/// `(total, used)` in KiB from `df -Pk` output.
pub fn parse_df(output: &str) -> Result<(u64, u64)> {
    let row = output
        .lines()
        .nth(1)
        .ok_or_else(|| anyhow!("df printed no filesystem row"))?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 6 {
        bail!("unexpected df row: {row}");
    }
    let total = fields[1].parse().context("df total")?;
    let used = fields[2].parse().context("df used")?;
    Ok((total, used))
}

fn disk_usage(path: &Path) -> Result<(u64, u64)> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .context("failed to run df")?;
    if !output.status.success() {
        bail!(
            "df exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_df(&String::from_utf8_lossy(&output.stdout))
}

/// One row per GPU from `nvidia-smi --format=csv,noheader,nounits`.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [name, total, used, util] = fields.as_slice() else {
                return None;
            };
            Some(GpuInfo {
                name: name.to_string(),
                memory_total_mb: total.parse().ok()?,
                memory_used_mb: used.parse().ok()?,
                utilization_percent: util.parse().ok()?,
            })
        })
        .collect()
}

fn gpu_info() -> Vec<GpuInfo> {
    Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)))
        .unwrap_or_default()
}

fn gib(kb: u64) -> f64 {
    kb as f64 / (1024.0 * 1024.0)
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

pub fn render_resources(snapshot: &ResourceSnapshot) -> String {
    let mut out = String::from("System resources:\n");
    match snapshot.cpu_percent {
        Some(cpu) => out.push_str(&format!(
            "  CPU:    {cpu:5.1}% ({} cores)\n",
            snapshot.cpu_count
        )),
        None => out.push_str(&format!("  CPU:    N/A ({} cores)\n", snapshot.cpu_count)),
    }
    out.push_str(&format!(
        "  Memory: {:.1}/{:.1} GiB ({:.1}%)\n",
        gib(snapshot.memory_used_kb),
        gib(snapshot.memory_total_kb),
        percent(snapshot.memory_used_kb, snapshot.memory_total_kb)
    ));
    match (snapshot.disk_used_kb, snapshot.disk_total_kb) {
        (Some(used), Some(total)) => out.push_str(&format!(
            "  Disk:   {:.1}/{:.1} GiB ({:.1}%)\n",
            gib(used),
            gib(total),
            percent(used, total)
        )),
        _ => out.push_str("  Disk:   N/A\n"),
    }
    for (index, gpu) in snapshot.gpus.iter().enumerate() {
        out.push_str(&format!(
            "  GPU {index}:  {} | {}/{} MiB | {:.0}% util\n",
            gpu.name, gpu.memory_used_mb, gpu.memory_total_mb, gpu.utilization_percent
        ));
    }
    out
}
