//! Value types exchanged with the resource manager.

use serde::{Deserialize, Serialize};

/// Abstract cost unit. Linear in bytes and CPU milliseconds.
pub type RequestUnit = f64;

/// The request unit dimensions a group can be limited on.
pub(crate) const REQUEST_UNIT_LIMIT_TYPES: &[RequestUnitType] = &[RequestUnitType::Ru];

/// The raw resource dimensions a group can be limited on.
pub(crate) const RAW_RESOURCE_LIMIT_TYPES: &[RawResourceType] = &[
    RawResourceType::IoReadFlow,
    RawResourceType::IoWriteFlow,
    RawResourceType::Cpu,
];

/// Metadata of an outgoing request, consulted before it is sent.
pub trait RequestInfo: Send + Sync {
    /// Whether the request writes data.
    fn is_write(&self) -> bool;
    /// Bytes the request is going to write.
    fn write_bytes(&self) -> u64;
}

/// Metadata of a finished request, consulted for settlement.
pub trait ResponseInfo: Send + Sync {
    /// Bytes the response carried back.
    fn read_bytes(&self) -> u64;
    /// CPU milliseconds the storage layer spent serving the request.
    fn kv_cpu_ms(&self) -> u64;
}

/// Per-group consumption counters reported to the resource manager.
///
/// All fields are non-negative and non-decreasing over a group's lifetime.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Consumption {
    pub rru: f64,
    pub wru: f64,
    pub read_bytes: f64,
    pub write_bytes: f64,
    pub total_cpu_time_ms: f64,
    pub sql_layer_cpu_time_ms: f64,
    pub kv_read_rpc_count: f64,
    pub kv_write_rpc_count: f64,
}

impl Consumption {
    /// Field-wise addition.
    pub fn add(&mut self, other: &Consumption) {
        self.rru += other.rru;
        self.wru += other.wru;
        self.read_bytes += other.read_bytes;
        self.write_bytes += other.write_bytes;
        self.total_cpu_time_ms += other.total_cpu_time_ms;
        self.sql_layer_cpu_time_ms += other.sql_layer_cpu_time_ms;
        self.kv_read_rpc_count += other.kv_read_rpc_count;
        self.kv_write_rpc_count += other.kv_write_rpc_count;
    }

    /// Field-wise subtraction.
    pub fn sub(&mut self, other: &Consumption) {
        self.rru -= other.rru;
        self.wru -= other.wru;
        self.read_bytes -= other.read_bytes;
        self.write_bytes -= other.write_bytes;
        self.total_cpu_time_ms -= other.total_cpu_time_ms;
        self.sql_layer_cpu_time_ms -= other.sql_layer_cpu_time_ms;
        self.kv_read_rpc_count -= other.kv_read_rpc_count;
        self.kv_write_rpc_count -= other.kv_write_rpc_count;
    }

    /// The RU value counted against the given request unit dimension.
    pub fn ru_value(&self, typ: RequestUnitType) -> f64 {
        match typ {
            RequestUnitType::Ru => self.rru + self.wru,
        }
    }

    /// The value counted against the given raw resource dimension.
    pub fn raw_value(&self, typ: RawResourceType) -> f64 {
        match typ {
            RawResourceType::IoReadFlow => self.read_bytes,
            RawResourceType::IoWriteFlow => self.write_bytes,
            RawResourceType::Cpu => self.total_cpu_time_ms,
        }
    }

    /// Whether the RU counters of two records are identical. Used by the
    /// cleanup scan to detect stale groups.
    pub fn equal_ru(&self, other: &Consumption) -> bool {
        self.rru == other.rru && self.wru == other.wru
    }
}

/// Accounting mode of a resource group.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum GroupMode {
    #[default]
    Unknown,
    Ru,
    Raw,
}

/// Request unit dimension identifiers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RequestUnitType {
    Ru,
}

/// Raw resource dimension identifiers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RawResourceType {
    IoReadFlow,
    IoWriteFlow,
    Cpu,
}

/// Static refill parameters of one server-side token bucket.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketSettings {
    /// Sustained refill rate in tokens per second.
    pub fill_rate: u64,
    /// Token ceiling. Negative means unlimited burst.
    pub burst_limit: i64,
}

/// One token bucket as described or granted by the server.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucket {
    pub settings: BucketSettings,
    /// Initial or granted token amount.
    pub tokens: f64,
}

/// Bucket settings for the single RU dimension of an RU-mode group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequestUnitSettings {
    pub ru: TokenBucket,
}

/// Bucket settings for the raw resource dimensions of a raw-mode group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRawResourceSettings {
    pub io_read: TokenBucket,
    pub io_write: TokenBucket,
    pub cpu: TokenBucket,
}

/// Server-side spec of one resource group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub name: String,
    pub mode: GroupMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ru_settings: Option<GroupRequestUnitSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_resource_settings: Option<GroupRawResourceSettings>,
}

impl ResourceGroup {
    /// Bucket settings for a request unit dimension, if configured.
    pub fn ru_bucket_setting(&self, typ: RequestUnitType) -> Option<&TokenBucket> {
        match typ {
            RequestUnitType::Ru => self.ru_settings.as_ref().map(|s| &s.ru),
        }
    }

    /// Bucket settings for a raw resource dimension, if configured.
    pub fn raw_bucket_setting(&self, typ: RawResourceType) -> Option<&TokenBucket> {
        let settings = self.raw_resource_settings.as_ref()?;
        Some(match typ {
            RawResourceType::IoReadFlow => &settings.io_read,
            RawResourceType::IoWriteFlow => &settings.io_write,
            RawResourceType::Cpu => &settings.cpu,
        })
    }
}

/// Requested RUs for one request unit dimension.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestUnitItem {
    #[serde(rename = "type")]
    pub kind: RequestUnitType,
    pub value: f64,
}

/// Requested amount for one raw resource dimension.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawResourceItem {
    #[serde(rename = "type")]
    pub kind: RawResourceType,
    pub value: f64,
}

/// Per-dimension token demand of one group, matching its mode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RequestItems {
    RequestUnits(Vec<RequestUnitItem>),
    RawResources(Vec<RawResourceItem>),
}

/// Token demand and consumption report for one group.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketRequest {
    pub resource_group_name: String,
    pub request: RequestItems,
    pub consumption_since_last_request: Consumption,
}

/// The batched request sent to the resource manager, carrying every group
/// that had something to report this tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketsRequest {
    pub requests: Vec<TokenBucketRequest>,
    pub target_request_period_ms: u64,
    pub client_unique_id: u64,
}

/// Tokens granted for one request unit dimension.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantedRuTokenBucket {
    #[serde(rename = "type")]
    pub kind: RequestUnitType,
    pub granted_tokens: TokenBucket,
    pub trickle_time_ms: i64,
}

/// Tokens granted for one raw resource dimension.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantedRawResourceTokenBucket {
    #[serde(rename = "type")]
    pub kind: RawResourceType,
    pub granted_tokens: TokenBucket,
    pub trickle_time_ms: i64,
}

/// Per-group slice of the batched token response.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketResponse {
    pub resource_group_name: String,
    #[serde(default)]
    pub granted_ru_tokens: Vec<GrantedRuTokenBucket>,
    #[serde(default)]
    pub granted_resource_tokens: Vec<GrantedRawResourceTokenBucket>,
}
