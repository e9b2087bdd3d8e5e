//! Request unit cost configuration and controller tuning constants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::RequestUnit;

/// RU budget pre-filled into every bucket before the first server grant.
pub const INITIAL_REQUEST_UNITS: f64 = 10_000.0;
/// Extra RUs requested on top of the estimated demand.
pub(crate) const BUFFER_RUS: f64 = 2_000.0;
/// Weight kept from the previous average when folding in a new RU usage
/// sample (one sample per state-update tick).
///
/// For a factor of 0.5 per second this should be
/// `0.5^(1 second / GROUP_STATE_UPDATE_INTERVAL)`.
pub(crate) const MOVING_AVG_FACTOR: f64 = 0.5;
/// Fraction of a grant below which the low-token notification fires.
pub(crate) const NOTIFY_FRACTION: f64 = 0.1;
/// Minimum RU delta that makes a group worth reporting.
pub(crate) const CONSUMPTION_REPORTING_THRESHOLD: f64 = 100.0;
/// After this many target periods without a report, report unconditionally.
pub(crate) const EXTENDED_REPORTING_PERIOD_FACTOR: u32 = 4;
/// Interval between scans for resource groups deleted on the server.
pub(crate) const GROUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Interval between state snapshots and demand estimation updates.
pub(crate) const GROUP_STATE_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
/// How long one full token grant is expected to last.
pub(crate) const TARGET_PERIOD: Duration = Duration::from_secs(10);
/// Longest a single reservation is allowed to wait for tokens.
pub(crate) const DEFAULT_MAX_WAIT_DURATION: Duration = Duration::from_secs(1);
/// Admission attempts before giving up with a throttled error.
pub(crate) const MAX_RETRY: usize = 3;
/// Pause between admission attempts.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_READ_BASE_COST: f64 = 0.25;
const DEFAULT_WRITE_BASE_COST: f64 = 1.0;
// 1 RU = 64 KiB read bytes
const DEFAULT_READ_COST_PER_BYTE: f64 = 1.0 / (64.0 * 1024.0);
// 1 RU = 1 KiB written bytes
const DEFAULT_WRITE_COST_PER_BYTE: f64 = 1.0 / 1024.0;
// 1 RU = 3 millisecond CPU time
const DEFAULT_CPU_MS_COST: f64 = 1.0 / 3.0;

/// Configuration of the request units, which determines the coefficients of
/// the RRU and WRU cost. This configuration should be modified carefully.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RequestUnitConfig {
    /// Base cost for a read request, charged regardless of the bytes read or
    /// the CPU time taken.
    #[serde(rename = "read-base-cost", default = "default_read_base_cost")]
    pub read_base_cost: f64,
    /// Cost for each byte read. 1 RU = 64 KiB by default.
    #[serde(rename = "read-cost-per-byte", default = "default_read_cost_per_byte")]
    pub read_cost_per_byte: f64,
    /// Base cost for a write request, charged regardless of the bytes
    /// written.
    #[serde(rename = "write-base-cost", default = "default_write_base_cost")]
    pub write_base_cost: f64,
    /// Cost for each byte written. 1 RU = 1 KiB by default.
    #[serde(rename = "write-cost-per-byte", default = "default_write_cost_per_byte")]
    pub write_cost_per_byte: f64,
    /// Cost for each millisecond of CPU time. 1 RU = 3 ms by default.
    #[serde(rename = "read-cpu-ms-cost", default = "default_cpu_ms_cost")]
    pub cpu_ms_cost: f64,
}

fn default_read_base_cost() -> f64 {
    DEFAULT_READ_BASE_COST
}
fn default_read_cost_per_byte() -> f64 {
    DEFAULT_READ_COST_PER_BYTE
}
fn default_write_base_cost() -> f64 {
    DEFAULT_WRITE_BASE_COST
}
fn default_write_cost_per_byte() -> f64 {
    DEFAULT_WRITE_COST_PER_BYTE
}
fn default_cpu_ms_cost() -> f64 {
    DEFAULT_CPU_MS_COST
}

impl Default for RequestUnitConfig {
    fn default() -> Self {
        Self {
            read_base_cost: DEFAULT_READ_BASE_COST,
            read_cost_per_byte: DEFAULT_READ_COST_PER_BYTE,
            write_base_cost: DEFAULT_WRITE_BASE_COST,
            write_cost_per_byte: DEFAULT_WRITE_COST_PER_BYTE,
            cpu_ms_cost: DEFAULT_CPU_MS_COST,
        }
    }
}

/// Resolved cost coefficients used by the calculators. Generated from a
/// [`RequestUnitConfig`] and immutable after controller construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub read_base_cost: RequestUnit,
    pub read_bytes_cost: RequestUnit,
    pub write_base_cost: RequestUnit,
    pub write_bytes_cost: RequestUnit,
    pub cpu_ms_cost: RequestUnit,
    /// Whether SQL-layer CPU statistics are attributed to the single
    /// resource group served by this process.
    pub(crate) single_group_by_keyspace: bool,
}

impl Config {
    /// Generates the resolved configuration from a request unit config.
    pub fn generate(ru_config: &RequestUnitConfig) -> Self {
        Self {
            read_base_cost: ru_config.read_base_cost,
            read_bytes_cost: ru_config.read_cost_per_byte,
            write_base_cost: ru_config.write_base_cost,
            write_bytes_cost: ru_config.write_cost_per_byte,
            cpu_ms_cost: ru_config.cpu_ms_cost,
            single_group_by_keyspace: false,
        }
    }

    /// The default configuration with the built-in coefficients.
    pub fn default_generated() -> Self {
        Self::generate(&RequestUnitConfig::default())
    }
}
