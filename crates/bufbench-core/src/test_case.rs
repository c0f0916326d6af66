use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a benchmark test case.
///
/// Serialized names match the labels written into the metric stream, so
/// downstream tooling can group rows without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestCaseKind {
    /// `SELECT 1` latency probe with a single client.
    Select1,
    /// `SELECT 1` throughput with the full client count.
    #[serde(rename = "Select1NPPS")]
    Select1Npps,
    /// Read-only workload sized to fit in shared buffers.
    #[serde(rename = "RO_FullyCached")]
    ReadOnlyFullyCached,
    /// Read-only workload sized around the shared-buffer boundary.
    #[serde(rename = "RO_Borderline")]
    ReadOnlyBorderline,
    /// Read-write workload sized to fit in shared buffers.
    #[serde(rename = "RW_FullyCached")]
    ReadWriteFullyCached,
    /// Read-only workload with a fixed scale factor.
    #[serde(rename = "RO_FixedSF")]
    ReadOnlyFixedScale,
    /// Read-write workload with a fixed scale factor.
    #[serde(rename = "RW_FixedSF")]
    ReadWriteFixedScale,
}

impl TestCaseKind {
    /// All known test cases, in the default execution order.
    pub const ALL: [Self; 7] = [
        Self::Select1,
        Self::Select1Npps,
        Self::ReadOnlyBorderline,
        Self::ReadOnlyFullyCached,
        Self::ReadWriteFullyCached,
        Self::ReadOnlyFixedScale,
        Self::ReadWriteFixedScale,
    ];

    /// Returns the canonical label used in output streams and configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Select1 => "Select1",
            Self::Select1Npps => "Select1NPPS",
            Self::ReadOnlyFullyCached => "RO_FullyCached",
            Self::ReadOnlyBorderline => "RO_Borderline",
            Self::ReadWriteFullyCached => "RW_FullyCached",
            Self::ReadOnlyFixedScale => "RO_FixedSF",
            Self::ReadWriteFixedScale => "RW_FixedSF",
        }
    }

    /// Read-only cases run the built-in select-only script.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyFullyCached | Self::ReadOnlyBorderline | Self::ReadOnlyFixedScale
        )
    }

    /// Read-write cases initialise their tables with a lowered fillfactor.
    #[must_use]
    pub const fn is_read_write(&self) -> bool {
        matches!(self, Self::ReadWriteFullyCached | Self::ReadWriteFixedScale)
    }

    /// Select cases run the custom `SELECT 1` script instead of a built-in.
    #[must_use]
    pub const fn uses_script(&self) -> bool {
        matches!(self, Self::Select1 | Self::Select1Npps)
    }
}

impl fmt::Display for TestCaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestCaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown test case `{s}`"))
    }
}

/// Query protocol used by the workload generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Simple query protocol.
    Simple,
    /// Extended query protocol without statement reuse.
    Extended,
    /// Extended protocol with prepared statements.
    #[default]
    Prepared,
}

impl QueryMode {
    /// Returns the value passed to the generator's protocol flag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Extended => "extended",
            Self::Prepared => "prepared",
        }
    }
}

/// Inputs needed to size a test case for the host it runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSettings {
    /// Virtual cores available to the database server.
    #[serde(default = "default_vcore")]
    pub vcore: u32,

    /// Clients per vcore.
    #[serde(default = "default_client_multiplier")]
    pub client_multiplier: f64,

    /// Generator threads per vcore.
    #[serde(default = "default_thread_multiplier")]
    pub thread_multiplier: f64,

    /// Query protocol for every test case.
    #[serde(default)]
    pub query_mode: QueryMode,

    /// Scale multiplier for `RO_FullyCached`.
    #[serde(default = "default_ro_fullcache_sf")]
    pub ro_fullcache_sf: f64,

    /// Scale multiplier for `RO_Borderline`.
    #[serde(default = "default_ro_borderline_sf")]
    pub ro_borderline_sf: f64,

    /// Scale multiplier for `RW_FullyCached`.
    #[serde(default = "default_rw_fullcache_sf")]
    pub rw_fullcache_sf: f64,

    /// Scale factor for `RO_FixedSF`.
    #[serde(default = "default_ro_fixed_sf")]
    pub ro_fixed_sf: u32,

    /// Scale factor for `RW_FixedSF`.
    #[serde(default = "default_rw_fixed_sf")]
    pub rw_fixed_sf: u32,

    /// Scale used to initialise datasets for cases without their own factor.
    #[serde(default = "default_scale")]
    pub default_scale: u32,

    /// Script run by the `Select1*` cases.
    #[serde(default = "default_select1_script")]
    pub select1_script: PathBuf,
}

fn default_vcore() -> u32 {
    2
}

fn default_client_multiplier() -> f64 {
    2.0
}

fn default_thread_multiplier() -> f64 {
    1.0
}

fn default_ro_fullcache_sf() -> f64 {
    10.0
}

fn default_ro_borderline_sf() -> f64 {
    20.0
}

fn default_rw_fullcache_sf() -> f64 {
    5.0
}

fn default_ro_fixed_sf() -> u32 {
    100
}

fn default_rw_fixed_sf() -> u32 {
    50
}

fn default_scale() -> u32 {
    128
}

fn default_select1_script() -> PathBuf {
    PathBuf::from("select1.sql")
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            vcore: default_vcore(),
            client_multiplier: default_client_multiplier(),
            thread_multiplier: default_thread_multiplier(),
            query_mode: QueryMode::default(),
            ro_fullcache_sf: default_ro_fullcache_sf(),
            ro_borderline_sf: default_ro_borderline_sf(),
            rw_fullcache_sf: default_rw_fullcache_sf(),
            ro_fixed_sf: default_ro_fixed_sf(),
            rw_fixed_sf: default_rw_fixed_sf(),
            default_scale: default_scale(),
            select1_script: default_select1_script(),
        }
    }
}

/// Fully resolved, immutable description of one test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCase {
    /// Which test case this is.
    pub kind: TestCaseKind,
    /// Dataset scale factor; `None` for cases that don't size a dataset.
    pub scale_factor: Option<u32>,
    /// Concurrent client connections.
    pub clients: u32,
    /// Generator worker threads.
    pub threads: u32,
    /// Query protocol.
    pub query_mode: QueryMode,
    /// Custom script, if the case runs one.
    pub script: Option<PathBuf>,
}

impl TestCase {
    /// Resolves sizing for `kind` from the host settings.
    #[must_use]
    pub fn resolve(kind: TestCaseKind, settings: &WorkloadSettings) -> Self {
        let vcore = f64::from(settings.vcore);
        let clients = ((settings.client_multiplier * vcore) as u32).max(1);
        let threads = ((settings.thread_multiplier * vcore) as u32).max(1);

        let (scale_factor, clients, threads) = match kind {
            TestCaseKind::Select1 => (None, 1, 1),
            TestCaseKind::Select1Npps => (None, clients, threads),
            TestCaseKind::ReadOnlyFullyCached => (
                Some(scale_for(settings.ro_fullcache_sf, settings.vcore)),
                clients,
                threads,
            ),
            TestCaseKind::ReadOnlyBorderline => (
                Some(scale_for(settings.ro_borderline_sf, settings.vcore)),
                clients,
                threads,
            ),
            TestCaseKind::ReadWriteFullyCached => (
                Some(scale_for(settings.rw_fullcache_sf, settings.vcore)),
                clients,
                threads,
            ),
            TestCaseKind::ReadOnlyFixedScale => (Some(settings.ro_fixed_sf), clients, threads),
            TestCaseKind::ReadWriteFixedScale => (Some(settings.rw_fixed_sf), clients, threads),
        };

        Self {
            kind,
            scale_factor,
            clients,
            threads,
            query_mode: settings.query_mode,
            script: kind.uses_script().then(|| settings.select1_script.clone()),
        }
    }

    /// Scale used when initialising this case's dataset.
    #[must_use]
    pub fn dataset_scale(&self, settings: &WorkloadSettings) -> u32 {
        self.scale_factor.unwrap_or(settings.default_scale)
    }
}

/// Scale factor derived from a per-vcore multiplier: `⌊multiplier × vcores / 2⌋`, at least 1.
#[must_use]
pub fn scale_for(multiplier: f64, vcore: u32) -> u32 {
    ((multiplier * f64::from(vcore) / 2.0) as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_factor_from_multiplier() {
        assert_eq!(scale_for(10.0, 4), 20);
        assert_eq!(scale_for(20.0, 2), 20);
        assert_eq!(scale_for(5.0, 3), 7);
        assert_eq!(scale_for(0.1, 1), 1);
    }

    #[test]
    fn test_select1_runs_single_client() {
        let settings = WorkloadSettings {
            vcore: 8,
            ..Default::default()
        };
        let case = TestCase::resolve(TestCaseKind::Select1, &settings);

        assert_eq!(case.clients, 1);
        assert_eq!(case.threads, 1);
        assert_eq!(case.scale_factor, None);
        assert_eq!(case.script, Some(PathBuf::from("select1.sql")));
        assert_eq!(case.dataset_scale(&settings), 128);
    }

    #[test]
    fn test_cached_cases_scale_with_vcores() {
        let settings = WorkloadSettings {
            vcore: 4,
            ..Default::default()
        };

        let ro = TestCase::resolve(TestCaseKind::ReadOnlyFullyCached, &settings);
        assert_eq!(ro.scale_factor, Some(20));
        assert_eq!(ro.clients, 8);
        assert_eq!(ro.threads, 4);
        assert!(ro.script.is_none());

        let border = TestCase::resolve(TestCaseKind::ReadOnlyBorderline, &settings);
        assert_eq!(border.scale_factor, Some(40));

        let rw = TestCase::resolve(TestCaseKind::ReadWriteFixedScale, &settings);
        assert_eq!(rw.scale_factor, Some(50));
    }

    #[test]
    fn test_kind_round_trips_through_label() {
        for kind in TestCaseKind::ALL {
            assert_eq!(kind.as_str().parse::<TestCaseKind>().unwrap(), kind);
        }
        assert_eq!(
            "ro_borderline".parse::<TestCaseKind>().unwrap(),
            TestCaseKind::ReadOnlyBorderline
        );
        assert!("RO_Unknown".parse::<TestCaseKind>().is_err());
    }

    #[test]
    fn test_kind_flags() {
        assert!(TestCaseKind::ReadOnlyBorderline.is_read_only());
        assert!(!TestCaseKind::ReadOnlyBorderline.is_read_write());
        assert!(TestCaseKind::ReadWriteFullyCached.is_read_write());
        assert!(TestCaseKind::Select1Npps.uses_script());
        assert!(!TestCaseKind::ReadWriteFixedScale.uses_script());
    }
}
