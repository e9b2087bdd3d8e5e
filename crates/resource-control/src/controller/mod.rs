//! The resource group controller: group registry, admission entry points
//! and the aggregating main loop.
//!
//! One controller serves a whole client process. It keeps a cost
//! controller per resource group in a concurrent map, periodically reports
//! consumption to the resource manager in a single batched RPC, and feeds
//! the granted tokens back into the per-group limiters.

mod group;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calculator::{KvCalculator, ResourceCalculator, SqlCalculator, SqlCpuSource};
use crate::config::{
    Config, EXTENDED_REPORTING_PERIOD_FACTOR, GROUP_CLEANUP_INTERVAL, GROUP_STATE_UPDATE_INTERVAL,
    RequestUnitConfig, TARGET_PERIOD,
};
use crate::error::{ControllerError, Result};
use crate::limiter::AdmissionContext;
use crate::provider::ResourceGroupProvider;
use crate::types::{Consumption, RequestInfo, ResponseInfo, TokenBucketResponse, TokenBucketsRequest};

use group::GroupCostController;

/// Global-config path of the request unit coefficients.
const REQUEST_UNIT_CONFIG_PATH: &str = "resource_group/ru_config";
/// Capacity of the token-bucket-update channel.
const MAX_NOTIFICATION_CHAN_LEN: usize = 200;

/// Why a token bucket request is being sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestSource {
    PeriodReport,
    LowRu,
}

/// Quota interception points for a KV client: admission before a request
/// is sent and settlement after its response arrived.
#[async_trait]
pub trait ResourceGroupKvInterceptor: Send + Sync {
    /// Checks whether the resource group has enough tokens, waiting for
    /// them if needed. Returns the pre-charged consumption delta.
    async fn on_request_wait(
        &self,
        ctx: &AdmissionContext,
        resource_group_name: &str,
        info: &dyn RequestInfo,
    ) -> Result<Consumption>;

    /// Records the actual consumption of a finished request.
    fn on_response(
        &self,
        resource_group_name: &str,
        req: &dyn RequestInfo,
        resp: &dyn ResponseInfo,
    ) -> Result<Consumption>;
}

/// Builder for [`ResourceGroupsController`].
pub struct ControllerBuilder {
    client_unique_id: Option<u64>,
    provider: Arc<dyn ResourceGroupProvider>,
    request_unit_config: Option<RequestUnitConfig>,
    single_group_by_keyspace: bool,
    sql_cpu_source: Option<SqlCpuSource>,
}

impl ControllerBuilder {
    pub fn new(provider: Arc<dyn ResourceGroupProvider>) -> Self {
        Self {
            client_unique_id: None,
            provider,
            request_unit_config: None,
            single_group_by_keyspace: false,
            sql_cpu_source: None,
        }
    }

    /// Identifies this client instance towards the server. A random id is
    /// generated when not set.
    pub fn client_unique_id(mut self, id: u64) -> Self {
        self.client_unique_id = Some(id);
        self
    }

    /// Uses the given RU coefficients instead of loading them from the
    /// server's global configuration.
    pub fn request_unit_config(mut self, config: RequestUnitConfig) -> Self {
        self.request_unit_config = Some(config);
        self
    }

    /// Attributes SQL-layer CPU time to the single group served by this
    /// process.
    pub fn single_group_by_keyspace(mut self) -> Self {
        self.single_group_by_keyspace = true;
        self
    }

    /// Clock for the SQL-layer CPU attribution.
    pub fn sql_cpu_source(mut self, source: SqlCpuSource) -> Self {
        self.sql_cpu_source = Some(source);
        self
    }

    /// Builds the controller, loading the RU coefficients from the server
    /// when none were supplied.
    pub async fn build(self) -> Result<ResourceGroupsController> {
        let ru_config = match self.request_unit_config {
            Some(config) => config,
            None => load_request_unit_config(self.provider.as_ref()).await?,
        };
        let mut config = Config::generate(&ru_config);
        config.single_group_by_keyspace = self.single_group_by_keyspace;
        let config = Arc::new(config);
        let sql_cpu_source: SqlCpuSource =
            self.sql_cpu_source.unwrap_or_else(|| Arc::new(|| 0.0));
        let calculators: Vec<Arc<dyn ResourceCalculator>> = vec![
            Arc::new(KvCalculator::new(Arc::clone(&config))),
            Arc::new(SqlCalculator::new(
                Arc::clone(&config),
                Arc::clone(&sql_cpu_source),
            )),
        ];
        let (low_tokens_tx, low_tokens_rx) = mpsc::channel(1);
        let (token_response_tx, token_response_rx) = mpsc::channel(1);
        let (bucket_update_tx, bucket_update_rx) = mpsc::channel(MAX_NOTIFICATION_CHAN_LEN);
        Ok(ResourceGroupsController {
            inner: Arc::new(ControllerInner {
                client_unique_id: self.client_unique_id.unwrap_or_else(rand::random),
                provider: self.provider,
                config,
                calculators,
                sql_cpu_source,
                groups: DashMap::new(),
                low_tokens_tx,
                token_response_tx,
                bucket_update_tx,
                receivers: Mutex::new(Some(LoopReceivers {
                    low_tokens_rx,
                    token_response_rx,
                    bucket_update_rx,
                })),
                loop_cancel: Mutex::new(None),
            }),
        })
    }
}

async fn load_request_unit_config(
    provider: &dyn ResourceGroupProvider,
) -> Result<RequestUnitConfig> {
    let items = provider
        .load_global_config(&[], REQUEST_UNIT_CONFIG_PATH)
        .await?;
    let Some(item) = items.first() else {
        return Err(ControllerError::ConfigUnavailable(
            "failed to load the ru config from remote server".to_string(),
        ));
    };
    Ok(serde_json::from_slice(&item.payload)?)
}

/// Receivers handed to the main loop on start.
struct LoopReceivers {
    low_tokens_rx: mpsc::Receiver<()>,
    token_response_rx: mpsc::Receiver<Option<Vec<TokenBucketResponse>>>,
    bucket_update_rx: mpsc::Receiver<Arc<GroupCostController>>,
}

/// Loop-local timing bookkeeping.
struct LoopState {
    now: Instant,
    last_request_time: Instant,
    last_request_time_low_ru: Instant,
    /// True while a token bucket RPC is in flight. Cleared when the
    /// response lands in the main loop, also on failure.
    request_in_progress: bool,
    /// Set when the last request failed, triggering a retry on the next
    /// tick. Never true together with `request_in_progress`.
    request_needs_retry: bool,
}

struct ControllerInner {
    client_unique_id: u64,
    provider: Arc<dyn ResourceGroupProvider>,
    config: Arc<Config>,
    calculators: Vec<Arc<dyn ResourceCalculator>>,
    sql_cpu_source: SqlCpuSource,
    groups: DashMap<String, Arc<GroupCostController>>,
    low_tokens_tx: mpsc::Sender<()>,
    token_response_tx: mpsc::Sender<Option<Vec<TokenBucketResponse>>>,
    bucket_update_tx: mpsc::Sender<Arc<GroupCostController>>,
    receivers: Mutex<Option<LoopReceivers>>,
    loop_cancel: Mutex<Option<CancellationToken>>,
}

/// Client-side quota controller for all resource groups of one process.
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ResourceGroupsController {
    inner: Arc<ControllerInner>,
}

impl ResourceGroupsController {
    /// Builds a controller with the given client id and provider, loading
    /// the RU coefficients from the server when `ru_config` is `None`.
    pub async fn new(
        client_unique_id: u64,
        provider: Arc<dyn ResourceGroupProvider>,
        ru_config: Option<RequestUnitConfig>,
    ) -> Result<Self> {
        let mut builder = ControllerBuilder::new(provider).client_unique_id(client_unique_id);
        if let Some(config) = ru_config {
            builder = builder.request_unit_config(config);
        }
        builder.build().await
    }

    pub fn builder(provider: Arc<dyn ResourceGroupProvider>) -> ControllerBuilder {
        ControllerBuilder::new(provider)
    }

    /// The resolved cost configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether a cost controller exists locally for the group.
    pub fn resource_group_exists(&self, name: &str) -> bool {
        self.inner.groups.contains_key(name)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .loop_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the main loop. Subsequent calls are no-ops.
    pub fn start(&self) {
        let receivers = self
            .inner
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(receivers) = receivers else {
            warn!("resource group controller already started");
            return;
        };
        let cancel = CancellationToken::new();
        *self.lock_cancel() = Some(cancel.clone());
        let controller = self.clone();
        tokio::spawn(async move {
            controller.run_loop(cancel, receivers).await;
        });
    }

    /// Stops the main loop. Fails if the controller was never started.
    pub fn stop(&self) -> Result<()> {
        match self.lock_cancel().take() {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => Err(ControllerError::NotStarted),
        }
    }

    async fn run_loop(self, cancel: CancellationToken, mut rx: LoopReceivers) {
        let now = Instant::now();
        let mut state = LoopState {
            now,
            last_request_time: now,
            last_request_time_low_ru: now,
            request_in_progress: false,
            request_needs_retry: false,
        };
        let mut cleanup_ticker =
            tokio::time::interval_at(now + GROUP_CLEANUP_INTERVAL, GROUP_CLEANUP_INTERVAL);
        cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state_ticker = tokio::time::interval_at(
            now + GROUP_STATE_UPDATE_INTERVAL,
            GROUP_STATE_UPDATE_INTERVAL,
        );
        state_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("resource group controller main loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("resource group controller main loop stopped");
                    return;
                }
                resp = rx.token_response_rx.recv() => {
                    let Some(resp) = resp else { return };
                    state.request_in_progress = false;
                    match resp {
                        Some(resp) => {
                            self.update_run_state(&mut state);
                            self.handle_token_bucket_response(&resp);
                        }
                        // The failure itself was logged by the sender task.
                        None => state.request_needs_retry = true,
                    }
                }
                _ = cleanup_ticker.tick() => {
                    if let Err(err) = self.cleanup_resource_groups().await {
                        error!(error = %err, "clean up resource groups failed");
                    }
                }
                _ = state_ticker.tick() => {
                    self.update_run_state(&mut state);
                    self.update_avg_request_resource_per_sec();
                    if state.request_needs_retry || self.should_report_consumption(&state) {
                        state.request_needs_retry = false;
                        self.collect_token_bucket_requests(
                            &cancel,
                            &mut state,
                            RequestSource::PeriodReport,
                            false,
                        );
                    }
                }
                notified = rx.low_tokens_rx.recv() => {
                    if notified.is_none() { return }
                    self.update_run_state(&mut state);
                    self.update_avg_request_resource_per_sec();
                    if !state.request_in_progress {
                        self.collect_token_bucket_requests(
                            &cancel,
                            &mut state,
                            RequestSource::LowRu,
                            true,
                        );
                    }
                }
                gc = rx.bucket_update_rx.recv() => {
                    if let Some(gc) = gc {
                        tokio::spawn(gc.handle_token_bucket_update_event(cancel.clone()));
                    }
                }
            }
        }
    }

    fn update_run_state(&self, state: &mut LoopState) {
        state.now = Instant::now();
        for entry in self.inner.groups.iter() {
            entry.value().update_run_state(state.now);
        }
    }

    fn update_avg_request_resource_per_sec(&self) {
        for entry in self.inner.groups.iter() {
            entry.value().update_avg_request_resource_per_sec();
        }
    }

    fn should_report_consumption(&self, state: &LoopState) -> bool {
        if state.request_in_progress {
            return false;
        }
        let since_report = state.now.saturating_duration_since(state.last_request_time);
        let since_low = state
            .now
            .saturating_duration_since(state.last_request_time_low_ru);
        let since = since_report.max(since_low);
        if since < TARGET_PERIOD {
            return false;
        }
        if since >= TARGET_PERIOD * EXTENDED_REPORTING_PERIOD_FACTOR {
            return true;
        }
        self.inner
            .groups
            .iter()
            .any(|entry| entry.value().should_report_consumption())
    }

    fn handle_token_bucket_response(&self, resp: &[TokenBucketResponse]) {
        for group_resp in resp {
            let name = &group_resp.resource_group_name;
            match self.inner.groups.get(name) {
                Some(gc) => gc.value().handle_token_bucket_response(group_resp),
                None => warn!(
                    group = %name,
                    "token response for a non-existent resource group"
                ),
            }
        }
    }

    fn collect_token_bucket_requests(
        &self,
        cancel: &CancellationToken,
        state: &mut LoopState,
        source: RequestSource,
        only_low: bool,
    ) {
        let mut requests = Vec::new();
        for entry in self.inner.groups.iter() {
            if let Some(request) = entry.value().collect_request_and_consumption(only_low) {
                requests.push(request);
            }
        }
        if requests.is_empty() {
            return;
        }
        self.send_token_bucket_requests(cancel, state, requests, source);
    }

    /// Fires the batched RPC in a detached task so the main loop keeps
    /// multiplexing; the result comes back through the response channel.
    fn send_token_bucket_requests(
        &self,
        cancel: &CancellationToken,
        state: &mut LoopState,
        requests: Vec<crate::types::TokenBucketRequest>,
        source: RequestSource,
    ) {
        let now = Instant::now();
        match source {
            RequestSource::LowRu => state.last_request_time_low_ru = now,
            RequestSource::PeriodReport => state.last_request_time = now,
        }
        state.request_in_progress = true;
        let request = TokenBucketsRequest {
            requests,
            target_request_period_ms: TARGET_PERIOD.as_millis() as u64,
            client_unique_id: self.inner.client_unique_id,
        };
        let provider = Arc::clone(&self.inner.provider);
        let response_tx = self.inner.token_response_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            debug!(
                source = ?source,
                groups = request.requests.len(),
                "sending token bucket request"
            );
            let resp = match provider.acquire_token_buckets(&request).await {
                Ok(resp) => Some(resp),
                Err(err) => {
                    // Errors caused by shutdown are expected noise.
                    if !cancel.is_cancelled() {
                        info!(error = %err, "token bucket rpc failed");
                    }
                    None
                }
            };
            let _ = response_tx.send(resp).await;
        });
    }

    /// Drops local controllers for groups deleted on the server, and runs
    /// the two-scan tombstone protocol for groups whose consumption has
    /// stopped changing.
    async fn cleanup_resource_groups(&self) -> Result<()> {
        let groups = self.inner.provider.list_resource_groups().await?;
        let latest: HashSet<String> = groups.into_iter().map(|g| g.name).collect();
        self.inner.groups.retain(|name, gc| {
            if !latest.contains(name) {
                info!(group = %name, "deleting resource group absent on the server");
                return false;
            }
            if gc.advance_tombstone() {
                debug!(group = %name, "deleting stale resource group");
                return false;
            }
            true
        });
        Ok(())
    }

    /// Checks whether the resource group has enough tokens, waiting for
    /// them if needed. Returns the pre-charged consumption delta.
    #[tracing::instrument(skip(self, ctx, info))]
    pub async fn on_request_wait(
        &self,
        ctx: &AdmissionContext,
        resource_group_name: &str,
        info: &dyn RequestInfo,
    ) -> Result<Consumption> {
        let gc = self.try_get_resource_group(resource_group_name).await?;
        gc.on_request_wait(ctx, info).await
    }

    /// Records the actual consumption of a finished request. An unknown
    /// group name yields an empty consumption, not an error.
    pub fn on_response(
        &self,
        resource_group_name: &str,
        req: &dyn RequestInfo,
        resp: &dyn ResponseInfo,
    ) -> Result<Consumption> {
        match self.inner.groups.get(resource_group_name) {
            Some(gc) => gc.value().on_response(req, resp),
            None => {
                warn!(group = %resource_group_name, "resource group name does not exist");
                Ok(Consumption::default())
            }
        }
    }

    /// Returns the local cost controller for the group, fetching its spec
    /// from the server on first use. A concurrent first use of the same
    /// group keeps whichever controller landed in the map first.
    async fn try_get_resource_group(&self, name: &str) -> Result<Arc<GroupCostController>> {
        if let Some(gc) = self.inner.groups.get(name) {
            return Ok(Arc::clone(gc.value()));
        }
        let group = self.inner.provider.get_resource_group(name).await?;
        if let Some(gc) = self.inner.groups.get(name) {
            return Ok(Arc::clone(gc.value()));
        }
        let gc = Arc::new(GroupCostController::new(
            group,
            &self.inner.config,
            self.inner.calculators.clone(),
            Arc::clone(&self.inner.sql_cpu_source),
            self.inner.low_tokens_tx.clone(),
            self.inner.bucket_update_tx.clone(),
        )?);
        gc.init_run_state(Instant::now());
        let entry = self
            .inner
            .groups
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(group = %name, "create resource group cost controller");
                Arc::clone(&gc)
            });
        Ok(Arc::clone(entry.value()))
    }
}

#[async_trait]
impl ResourceGroupKvInterceptor for ResourceGroupsController {
    async fn on_request_wait(
        &self,
        ctx: &AdmissionContext,
        resource_group_name: &str,
        info: &dyn RequestInfo,
    ) -> Result<Consumption> {
        ResourceGroupsController::on_request_wait(self, ctx, resource_group_name, info).await
    }

    fn on_response(
        &self,
        resource_group_name: &str,
        req: &dyn RequestInfo,
        resp: &dyn ResponseInfo,
    ) -> Result<Consumption> {
        ResourceGroupsController::on_response(self, resource_group_name, req, resp)
    }
}
