/// Live metrics for the TUI visualizer.
///
/// A launch with a metrics path writes a JSON snapshot when it starts, after
/// every completed group and when it finishes. The viz binary polls the file
/// and re-renders the dashboard. Writes are atomic (write to .tmp then rename)
/// to avoid torn reads.
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_METRICS_PATH: &str = "/tmp/gridsim_live.json";

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LaunchSnapshot {
    /// "running" | "complete" | "failed"
    pub status: String,
    pub kernel_name: String,
    /// "pipelined" | "debug"
    pub mode: String,
    /// Grid dimensions [x, y, z]
    pub grid: [u32; 3],
    /// Group dimensions [x, y, z]
    pub group: [u32; 3],
    /// Groups in flight at once
    pub resident_slots: u32,
    /// OS threads backing the launch
    pub pool_threads: u32,
    /// Which bound limited the resident slot count
    pub limiter: String,
    /// Pool threads over the parallel-thread limit [0.0, 1.0]
    pub thread_utilization: f32,
    pub groups_total: u32,
    pub groups_executed: u32,
    pub work_items_executed: u64,
    /// Groups completed per resident slot, index = slot
    pub slot_groups_executed: Vec<u32>,
    pub barrier_releases: u64,
    pub named_barrier_generations: u64,
    /// Set when status is "failed"
    #[serde(default)]
    pub error: Option<String>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write a snapshot to `path`.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_snapshot(path: &Path, snapshot: &LaunchSnapshot) {
    if let Ok(json) = serde_json::to_string(snapshot) {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if std::fs::write(&tmp, &json).is_ok() {
            if let Err(e) = std::fs::rename(&tmp, path) {
                log::warn!("metrics snapshot not published to {}: {}", path.display(), e);
            }
        }
    }
}

/// Read the latest snapshot. Returns None if the file doesn't exist or can't
/// be parsed (e.g. no launch has run yet).
pub fn read_snapshot(path: &Path) -> Option<LaunchSnapshot> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serializes snapshot writes from concurrent lanes onto one file.
#[derive(Debug)]
pub struct MetricsSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetricsSink {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(&self, snapshot: &LaunchSnapshot) {
        let _guard = self.lock.lock();
        write_snapshot(&self.path, snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        assert!(read_snapshot(&path).is_none());

        let sink = MetricsSink::new(&path);
        sink.publish(&LaunchSnapshot {
            status: "running".into(),
            kernel_name: "reduce".into(),
            groups_total: 8,
            groups_executed: 3,
            slot_groups_executed: vec![2, 1],
            timestamp_ms: now_ms(),
            ..Default::default()
        });

        let back = read_snapshot(&path).unwrap();
        assert_eq!(back.kernel_name, "reduce");
        assert_eq!(back.groups_executed, 3);
        assert_eq!(back.slot_groups_executed, vec![2, 1]);
        assert!(!dir.path().join("live.json.tmp").exists());
    }

    #[test]
    fn garbage_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_snapshot(&path).is_none());
    }
}
