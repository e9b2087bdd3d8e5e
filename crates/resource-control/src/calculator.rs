//! Translation of request and response metadata into consumption deltas.

use std::sync::Arc;

use crate::config::Config;
use crate::types::{Consumption, RequestInfo, ResponseInfo};

/// A clock returning the SQL-layer process CPU time in milliseconds.
/// Injected because probing the process or its cgroup is environment
/// specific.
pub type SqlCpuSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Derives consumption deltas around a request. Implementations are
/// consulted in a fixed order: `before_kv_request` on admission,
/// `after_kv_request` on settlement, `trickle` from the periodic state
/// update.
pub trait ResourceCalculator: Send + Sync {
    /// Periodic accounting that is not tied to a single request.
    fn trickle(&self, consumption: &mut Consumption);
    /// Pre-charges the request before it is sent.
    fn before_kv_request(&self, delta: &mut Consumption, req: &dyn RequestInfo);
    /// Post-charges the request once its response arrived.
    fn after_kv_request(
        &self,
        delta: &mut Consumption,
        req: &dyn RequestInfo,
        resp: &dyn ResponseInfo,
    );
}

/// Charges the KV side of a request: base cost and written bytes up front,
/// read bytes and storage CPU after the response.
pub struct KvCalculator {
    cfg: Arc<Config>,
}

impl KvCalculator {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self { cfg }
    }
}

impl ResourceCalculator for KvCalculator {
    fn trickle(&self, _consumption: &mut Consumption) {}

    fn before_kv_request(&self, delta: &mut Consumption, req: &dyn RequestInfo) {
        if req.is_write() {
            delta.kv_write_rpc_count += 1.0;
            let write_bytes = req.write_bytes() as f64;
            delta.write_bytes += write_bytes;
            delta.wru += self.cfg.write_base_cost + self.cfg.write_bytes_cost * write_bytes;
        } else {
            delta.kv_read_rpc_count += 1.0;
            delta.rru += self.cfg.read_base_cost;
        }
    }

    fn after_kv_request(
        &self,
        delta: &mut Consumption,
        _req: &dyn RequestInfo,
        resp: &dyn ResponseInfo,
    ) {
        let read_bytes = resp.read_bytes() as f64;
        delta.read_bytes += read_bytes;
        delta.rru += self.cfg.read_bytes_cost * read_bytes;
        let kv_cpu_ms = resp.kv_cpu_ms() as f64;
        delta.total_cpu_time_ms += kv_cpu_ms;
        delta.rru += self.cfg.cpu_ms_cost * kv_cpu_ms;
    }
}

/// Attributes SQL-layer CPU time to the group. Only meaningful when the
/// process serves a single group per keyspace; otherwise the process-wide
/// clock cannot be attributed and the calculator stays inert.
pub struct SqlCalculator {
    cfg: Arc<Config>,
    cpu_source: SqlCpuSource,
}

impl SqlCalculator {
    pub fn new(cfg: Arc<Config>, cpu_source: SqlCpuSource) -> Self {
        Self { cfg, cpu_source }
    }
}

impl ResourceCalculator for SqlCalculator {
    fn trickle(&self, consumption: &mut Consumption) {
        if !self.cfg.single_group_by_keyspace {
            return;
        }
        let delta = (self.cpu_source)() - consumption.sql_layer_cpu_time_ms;
        if delta <= 0.0 {
            return;
        }
        consumption.total_cpu_time_ms += delta;
        consumption.sql_layer_cpu_time_ms += delta;
    }

    fn before_kv_request(&self, _delta: &mut Consumption, _req: &dyn RequestInfo) {}

    fn after_kv_request(
        &self,
        _delta: &mut Consumption,
        _req: &dyn RequestInfo,
        _resp: &dyn ResponseInfo,
    ) {
    }
}
