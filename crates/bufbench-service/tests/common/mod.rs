//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bufbench_core::{
    BenchError, BenchResult, CapacityChanger, CapacitySchedule, CapacitySequence, CpuProbe,
    DatasetProvisioner, TestCase, TestCaseKind, WorkloadSettings,
};
use bufbench_service::{
    OrchestratorConfig, ProbeFactory, ProgressStream, WorkloadCommand, WorkloadLauncher,
};
use parking_lot::Mutex;

/// Provisioner that records calls and can refuse chosen test cases.
#[derive(Default)]
pub struct FakeProvisioner {
    pub unreachable: bool,
    pub refuse: Vec<TestCaseKind>,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl DatasetProvisioner for FakeProvisioner {
    async fn ping(&self) -> BenchResult<()> {
        self.calls.lock().push("ping".to_string());
        if self.unreachable {
            return Err(BenchError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn create_dataset(&self, test_case: &TestCase) -> BenchResult<()> {
        self.calls.lock().push(format!("create {}", test_case.kind));
        if self.refuse.contains(&test_case.kind) {
            return Err(BenchError::dataset(test_case.kind, "disk full"));
        }
        Ok(())
    }

    async fn drop_dataset(&self, test_case: &TestCase) -> BenchResult<()> {
        self.calls.lock().push(format!("drop {}", test_case.kind));
        Ok(())
    }
}

/// Capacity changer with a per-target number of failures before success.
pub struct FakeChanger {
    current: Mutex<u32>,
    failures: Mutex<HashMap<u32, usize>>,
    delay: Duration,
    restart_marker: Option<PathBuf>,
    pub attempts: Mutex<Vec<u32>>,
}

impl FakeChanger {
    pub fn new(start_gb: u32) -> Self {
        Self {
            current: Mutex::new(start_gb),
            failures: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(50),
            restart_marker: None,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(self, target_gb: u32, times: usize) -> Self {
        self.failures.lock().insert(target_gb, times);
        self
    }

    /// Every resize creates `marker` and takes long enough for a workload
    /// watching it to exit mid-resize, the way a server restart ends it.
    pub fn restarting(mut self, marker: PathBuf) -> Self {
        self.restart_marker = Some(marker);
        self.delay = Duration::from_millis(800);
        self
    }
}

#[async_trait]
impl CapacityChanger for FakeChanger {
    async fn set_capacity(&self, target_gb: u32) -> BenchResult<()> {
        self.attempts.lock().push(target_gb);
        if let Some(marker) = &self.restart_marker {
            std::fs::write(marker, b"restart").expect("write restart marker");
        }
        tokio::time::sleep(self.delay).await;

        let mut failures = self.failures.lock();
        if let Some(left) = failures.get_mut(&target_gb) {
            if *left > 0 {
                *left -= 1;
                return Err(BenchError::capacity(target_gb, "resize rejected"));
            }
        }
        *self.current.lock() = target_gb;
        Ok(())
    }

    async fn current_capacity(&self) -> BenchResult<u32> {
        Ok(*self.current.lock())
    }
}

/// CPU probe returning a constant.
pub struct FixedProbe(pub f64);

#[async_trait]
impl CpuProbe for FixedProbe {
    async fn cpu_percent(&mut self) -> BenchResult<f64> {
        Ok(self.0)
    }
}

pub fn fixed_probes(cpu: f64) -> ProbeFactory {
    Arc::new(move || Box::new(FixedProbe(cpu)) as Box<dyn CpuProbe>)
}

/// Runs a shell script in place of the workload generator.
pub struct ShellLauncher {
    pub script: String,
    pub progress: ProgressStream,
}

impl ShellLauncher {
    pub fn stderr(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            progress: ProgressStream::Stderr,
        }
    }
}

impl WorkloadLauncher for ShellLauncher {
    fn command(&self, _test_case: &TestCase, _duration: Duration) -> WorkloadCommand {
        WorkloadCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), self.script.clone()],
            progress: self.progress,
        }
    }
}

/// Emits a well-formed progress line every `cadence` seconds, forever.
pub fn progress_forever(cadence: &str) -> String {
    format!(
        r#"i=1
while true; do
  echo "progress: $i.0 s, 1200.5 tps, lat 1.650 ms stddev 0.400" >&2
  i=$((i+1))
  sleep {cadence}
done"#
    )
}

/// Emits progress until `marker` appears, then removes it and exits 2.
pub fn progress_until_restart(marker: &std::path::Path) -> String {
    format!(
        r#"i=1
while true; do
  if [ -e {marker} ]; then rm -f {marker}; exit 2; fi
  echo "progress: $i.0 s, 800.0 tps, lat 1.000 ms stddev 0.100" >&2
  i=$((i+1))
  sleep 0.1
done"#,
        marker = marker.display()
    )
}

pub fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

pub fn orchestrator_config(
    kinds: &[TestCaseKind],
    sequence: Vec<u32>,
    warmup: f64,
    hold: f64,
    settle: f64,
    overrun: f64,
) -> OrchestratorConfig {
    let settings = WorkloadSettings::default();
    OrchestratorConfig {
        test_cases: kinds
            .iter()
            .map(|kind| TestCase::resolve(*kind, &settings))
            .collect(),
        schedule: CapacitySchedule {
            sequence: CapacitySequence::new(sequence).expect("valid sequence"),
            warmup: secs(warmup),
            hold: secs(hold),
            settle: secs(settle),
        },
        sample_period: secs(1.0),
        overrun_allowance: secs(overrun),
        retry_backoff: secs(0.2),
        terminate_grace: secs(1.0),
        relaunch_during_resize: false,
    }
}

/// True while `pid` exists and is not a zombie.
#[cfg(unix)]
pub fn is_running(pid: i32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        return match stat.rfind(')').and_then(|i| stat[i + 1..].split_whitespace().next()) {
            Some(state) => state != "Z" && state != "X",
            None => false,
        };
    }
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Polls until `pid` is gone or `limit` elapses; returns whether it is gone.
#[cfg(unix)]
pub async fn wait_gone(pid: i32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !is_running(pid)
}
