//! The injected resource manager client contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ResourceGroup, TokenBucketResponse, TokenBucketsRequest};

/// One item from the server's global configuration store.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfigItem {
    pub name: String,
    /// Raw JSON payload of the item.
    pub payload: Vec<u8>,
}

/// Client-side access to the resource manager, injected into the
/// controller. Implementations wrap the actual wire protocol.
#[async_trait]
pub trait ResourceGroupProvider: Send + Sync {
    /// Lists every resource group known to the server.
    async fn list_resource_groups(&self) -> Result<Vec<ResourceGroup>>;

    /// Fetches the spec of a single resource group.
    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup>;

    /// Exchanges consumption reports for token grants, for all groups in
    /// one round trip.
    async fn acquire_token_buckets(
        &self,
        request: &TokenBucketsRequest,
    ) -> Result<Vec<TokenBucketResponse>>;

    /// Loads items from the global configuration store under `config_path`.
    async fn load_global_config(
        &self,
        names: &[String],
        config_path: &str,
    ) -> Result<Vec<GlobalConfigItem>>;
}
