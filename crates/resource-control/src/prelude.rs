//! Convenience re-exports for the common use of the crate.

pub use crate::calculator::{KvCalculator, ResourceCalculator, SqlCalculator, SqlCpuSource};
pub use crate::config::{Config, INITIAL_REQUEST_UNITS, RequestUnitConfig};
pub use crate::controller::{
    ControllerBuilder, ResourceGroupKvInterceptor, ResourceGroupsController,
};
pub use crate::error::{ControllerError, Result};
pub use crate::limiter::{
    AdmissionContext, Limiter, LimiterConfig, Reservation, wait_reservations,
};
pub use crate::provider::{GlobalConfigItem, ResourceGroupProvider};
pub use crate::types::{
    BucketSettings, Consumption, GrantedRawResourceTokenBucket, GrantedRuTokenBucket, GroupMode,
    GroupRawResourceSettings, GroupRequestUnitSettings, RawResourceItem, RawResourceType,
    RequestInfo, RequestItems, RequestUnit, RequestUnitItem, RequestUnitType, ResourceGroup,
    ResponseInfo, TokenBucket, TokenBucketRequest, TokenBucketResponse, TokenBucketsRequest,
};
