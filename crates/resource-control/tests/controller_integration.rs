//! Integration tests for the resource group controller.
//!
//! These tests drive the full admission loop against a mock resource
//! manager provider under paused tokio time: group creation on first use,
//! periodic consumption reporting, low-token refill requests, RPC
//! batching, failure retries and the cleanup tombstone protocol.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use resource_control::prelude::*;

struct TestRequest {
    is_write: bool,
    write_bytes: u64,
}

impl TestRequest {
    fn write(write_bytes: u64) -> Self {
        Self {
            is_write: true,
            write_bytes,
        }
    }

    fn read() -> Self {
        Self {
            is_write: false,
            write_bytes: 0,
        }
    }
}

impl RequestInfo for TestRequest {
    fn is_write(&self) -> bool {
        self.is_write
    }
    fn write_bytes(&self) -> u64 {
        self.write_bytes
    }
}

struct TestResponse {
    read_bytes: u64,
    kv_cpu_ms: u64,
}

impl ResponseInfo for TestResponse {
    fn read_bytes(&self) -> u64 {
        self.read_bytes
    }
    fn kv_cpu_ms(&self) -> u64 {
        self.kv_cpu_ms
    }
}

/// In-memory resource manager. Grants whatever is asked for, records every
/// batched request, and can be scripted to delay or fail.
struct MockProvider {
    groups: Mutex<HashMap<String, ResourceGroup>>,
    acquired: Mutex<Vec<TokenBucketsRequest>>,
    acquire_delay: Mutex<Duration>,
    fail_next_acquires: AtomicUsize,
    ru_config_payload: Vec<u8>,
}

impl MockProvider {
    fn new(groups: Vec<ResourceGroup>) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(groups.into_iter().map(|g| (g.name.clone(), g)).collect()),
            acquired: Mutex::new(Vec::new()),
            acquire_delay: Mutex::new(Duration::ZERO),
            fail_next_acquires: AtomicUsize::new(0),
            ru_config_payload: br#"{"read-base-cost": 0.25}"#.to_vec(),
        })
    }

    fn acquired(&self) -> Vec<TokenBucketsRequest> {
        self.acquired.lock().unwrap().clone()
    }

    fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = delay;
    }

    fn remove_group(&self, name: &str) {
        self.groups.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl ResourceGroupProvider for MockProvider {
    async fn list_resource_groups(&self) -> Result<Vec<ResourceGroup>> {
        Ok(self.groups.lock().unwrap().values().cloned().collect())
    }

    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup> {
        self.groups
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::Provider(format!("resource group {name} not found")))
    }

    async fn acquire_token_buckets(
        &self,
        request: &TokenBucketsRequest,
    ) -> Result<Vec<TokenBucketResponse>> {
        self.acquired.lock().unwrap().push(request.clone());
        let delay = *self.acquire_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_acquires.load(Ordering::Relaxed) > 0 {
            self.fail_next_acquires.fetch_sub(1, Ordering::Relaxed);
            return Err(ControllerError::Provider("rpc failed".to_string()));
        }
        // Grant generously: the asked-for amount plus enough to cover the
        // retired initial budget, so the client does not stay low.
        Ok(request
            .requests
            .iter()
            .map(|r| TokenBucketResponse {
                resource_group_name: r.resource_group_name.clone(),
                granted_ru_tokens: match &r.request {
                    RequestItems::RequestUnits(items) => items
                        .iter()
                        .map(|item| GrantedRuTokenBucket {
                            kind: item.kind,
                            granted_tokens: TokenBucket {
                                settings: BucketSettings {
                                    fill_rate: 100,
                                    burst_limit: 0,
                                },
                                tokens: item.value.max(0.0) + 20_000.0,
                            },
                            trickle_time_ms: 0,
                        })
                        .collect(),
                    RequestItems::RawResources(_) => Vec::new(),
                },
                granted_resource_tokens: Vec::new(),
            })
            .collect())
    }

    async fn load_global_config(
        &self,
        _names: &[String],
        config_path: &str,
    ) -> Result<Vec<GlobalConfigItem>> {
        Ok(vec![GlobalConfigItem {
            name: config_path.to_string(),
            payload: self.ru_config_payload.clone(),
        }])
    }
}

fn ru_group_with(name: &str, fill_rate: u64) -> ResourceGroup {
    ResourceGroup {
        name: name.to_string(),
        mode: GroupMode::Ru,
        ru_settings: Some(GroupRequestUnitSettings {
            ru: TokenBucket {
                settings: BucketSettings {
                    fill_rate,
                    burst_limit: 0,
                },
                tokens: 0.0,
            },
        }),
        raw_resource_settings: None,
    }
}

fn ru_group(name: &str) -> ResourceGroup {
    ru_group_with(name, 100)
}

async fn build_controller(provider: Arc<MockProvider>) -> ResourceGroupsController {
    ResourceGroupsController::builder(provider)
        .client_unique_id(42)
        .request_unit_config(RequestUnitConfig::default())
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_group_created_on_first_use() {
    let provider = MockProvider::new(vec![ru_group("tenant-a")]);
    let controller = build_controller(Arc::clone(&provider)).await;

    assert!(!controller.resource_group_exists("tenant-a"));
    let delta = controller
        .on_request_wait(&AdmissionContext::new(), "tenant-a", &TestRequest::write(1024))
        .await
        .unwrap();
    // 1 RU base plus 1 RU for 1 KiB written.
    assert_eq!(delta.wru, 2.0);
    assert!(controller.resource_group_exists("tenant-a"));

    let delta = controller
        .on_response(
            "tenant-a",
            &TestRequest::write(1024),
            &TestResponse {
                read_bytes: 0,
                kv_cpu_ms: 3,
            },
        )
        .unwrap();
    assert!((delta.rru - 1.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_group_errors_surface() {
    let provider = MockProvider::new(vec![]);
    let controller = build_controller(provider).await;

    let err = controller
        .on_request_wait(&AdmissionContext::new(), "ghost", &TestRequest::read())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Provider(_)));

    // Settlement for an unknown group is a warning, not an error.
    let delta = controller
        .on_response(
            "ghost",
            &TestRequest::read(),
            &TestResponse {
                read_bytes: 1,
                kv_cpu_ms: 0,
            },
        )
        .unwrap();
    assert_eq!(delta, Consumption::default());
}

#[tokio::test(start_paused = true)]
async fn test_ru_config_loaded_from_global_config() {
    let provider = MockProvider::new(vec![]);
    let controller = ResourceGroupsController::builder(provider)
        .client_unique_id(1)
        .build()
        .await
        .unwrap();
    // Missing fields fall back to the defaults.
    assert_eq!(controller.config().read_base_cost, 0.25);
    assert_eq!(controller.config().write_base_cost, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_report_carries_consumption() {
    // The high fill rate keeps the initial notify threshold low, so the
    // consumption below crosses the reporting threshold without also
    // tripping the low-token path.
    let provider = MockProvider::new(vec![ru_group_with("tenant-a", 49_000)]);
    let controller = build_controller(Arc::clone(&provider)).await;
    controller.start();

    // 150 KiB written costs 151 RU, above the reporting threshold.
    controller
        .on_request_wait(
            &AdmissionContext::new(),
            "tenant-a",
            &TestRequest::write(150 * 1024),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(provider.acquired().is_empty(), "reported before the target period");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let requests = provider.acquired();
    assert!(!requests.is_empty(), "no report within the target period");
    let report = &requests[0];
    assert_eq!(report.client_unique_id, 42);
    assert_eq!(report.target_request_period_ms, 10_000);
    assert_eq!(report.requests.len(), 1);
    assert_eq!(report.requests[0].resource_group_name, "tenant-a");
    assert!(report.requests[0].consumption_since_last_request.wru >= 151.0);

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_small_consumption_waits_for_extended_period() {
    let provider = MockProvider::new(vec![ru_group("tenant-a")]);
    let controller = build_controller(Arc::clone(&provider)).await;
    controller.start();

    // 2 RU stays below the reporting threshold.
    controller
        .on_request_wait(&AdmissionContext::new(), "tenant-a", &TestRequest::write(1024))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert!(provider.acquired().is_empty());

    // After four target periods the report is forced regardless.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!provider.acquired().is_empty());

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_low_tokens_trigger_single_batched_rpc() {
    let provider = MockProvider::new(vec![ru_group("tenant-a"), ru_group("tenant-b")]);
    let controller = build_controller(Arc::clone(&provider)).await;

    // Instantiate both groups with cheap traffic before the loop runs.
    for name in ["tenant-a", "tenant-b"] {
        controller
            .on_request_wait(&AdmissionContext::new(), name, &TestRequest::write(0))
            .await
            .unwrap();
    }
    controller.start();

    // Drain both groups below the initial notify threshold; each limiter
    // latches and the capacity-1 channel folds the signals into one.
    for name in ["tenant-a", "tenant-b"] {
        controller
            .on_request_wait(
                &AdmissionContext::new(),
                name,
                &TestRequest::write(30 * 1024),
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let requests = provider.acquired();
    assert_eq!(requests.len(), 1, "low-token refills must batch into one rpc");
    assert_eq!(requests[0].requests.len(), 2);

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_new_rpc_while_request_in_progress() {
    let provider = MockProvider::new(vec![ru_group("tenant-a")]);
    provider.set_acquire_delay(Duration::from_secs(3));
    let controller = build_controller(Arc::clone(&provider)).await;

    // Instantiate the group before the loop runs.
    controller
        .on_request_wait(&AdmissionContext::new(), "tenant-a", &TestRequest::write(0))
        .await
        .unwrap();
    controller.start();

    controller
        .on_request_wait(
            &AdmissionContext::new(),
            "tenant-a",
            &TestRequest::write(30 * 1024),
        )
        .await
        .unwrap();

    // The low-token rpc is now in flight for 3s. More low-token traffic
    // must not start a second one.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(provider.acquired().len(), 1);
    controller
        .on_request_wait(
            &AdmissionContext::new(),
            "tenant-a",
            &TestRequest::write(30 * 1024),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(provider.acquired().len(), 1);

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_rpc_retries_on_next_tick() {
    let provider = MockProvider::new(vec![ru_group("tenant-a")]);
    provider.fail_next_acquires.store(1, Ordering::Relaxed);
    let controller = build_controller(Arc::clone(&provider)).await;
    controller.start();

    controller
        .on_request_wait(
            &AdmissionContext::new(),
            "tenant-a",
            &TestRequest::write(200 * 1024),
        )
        .await
        .unwrap();

    // First report fails; the next state tick retries it.
    tokio::time::sleep(Duration::from_secs(13)).await;
    assert!(provider.acquired().len() >= 2);

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_deletes_group_absent_on_server() {
    let provider = MockProvider::new(vec![ru_group("tenant-a")]);
    let controller = build_controller(Arc::clone(&provider)).await;
    controller.start();

    controller
        .on_request_wait(&AdmissionContext::new(), "tenant-a", &TestRequest::write(1024))
        .await
        .unwrap();
    assert!(controller.resource_group_exists("tenant-a"));

    provider.remove_group("tenant-a");
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(!controller.resource_group_exists("tenant-a"));

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_tombstone_two_scan_protocol() {
    let provider = MockProvider::new(vec![ru_group("tenant-a")]);
    let controller = build_controller(Arc::clone(&provider)).await;
    controller.start();

    controller
        .on_request_wait(&AdmissionContext::new(), "tenant-a", &TestRequest::write(1024))
        .await
        .unwrap();

    // First scan with unchanged consumption latches the tombstone but the
    // group survives.
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(controller.resource_group_exists("tenant-a"));

    // Activity between scans clears the tombstone.
    controller
        .on_request_wait(&AdmissionContext::new(), "tenant-a", &TestRequest::write(1024))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(controller.resource_group_exists("tenant-a"));

    // Two quiet scans in a row delete the group.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(!controller.resource_group_exists("tenant-a"));

    controller.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_start_errors() {
    let provider = MockProvider::new(vec![]);
    let controller = build_controller(provider).await;
    assert!(matches!(
        controller.stop().unwrap_err(),
        ControllerError::NotStarted
    ));

    controller.start();
    controller.stop().unwrap();
    // The loop token is gone after a successful stop.
    assert!(matches!(
        controller.stop().unwrap_err(),
        ControllerError::NotStarted
    ));
}
