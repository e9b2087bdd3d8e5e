//! Per-group cost accounting and admission control.
//!
//! A [`GroupCostController`] owns one limiter per cost dimension of one
//! resource group. Admission and settlement run on the caller's task and
//! only take short locks; the demand estimation and token-request state is
//! maintained by the controller main loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::calculator::{ResourceCalculator, SqlCpuSource};
use crate::config::{
    BUFFER_RUS, CONSUMPTION_REPORTING_THRESHOLD, Config, DEFAULT_MAX_WAIT_DURATION,
    INITIAL_REQUEST_UNITS, MAX_RETRY, MOVING_AVG_FACTOR, NOTIFY_FRACTION, RETRY_INTERVAL,
    TARGET_PERIOD,
};
use crate::error::{ControllerError, Result};
use crate::limiter::{AdmissionContext, Limiter, LimiterConfig, wait_reservations};
use crate::types::{
    Consumption, GroupMode, RAW_RESOURCE_LIMIT_TYPES, REQUEST_UNIT_LIMIT_TYPES, RawResourceItem,
    RawResourceType, RequestInfo, RequestItems, RequestUnitItem, RequestUnitType, ResourceGroup,
    ResponseInfo, TokenBucket, TokenBucketRequest, TokenBucketResponse,
};

/// Deferred notification-threshold install, armed while a trickle grant is
/// being delivered.
#[derive(Clone, Copy, Debug, PartialEq)]
struct PendingNotify {
    install_at: Instant,
    threshold: f64,
}

/// Demand estimation and refill bookkeeping for one cost dimension.
struct TokenCounter {
    /// Exponentially-weighted moving average of the RU consumption per
    /// second, used to size the next token request.
    avg_ru_per_sec: f64,
    /// Consumption value at the time `avg_ru_per_sec` was last updated.
    avg_ru_per_sec_last_ru: f64,
    avg_last_time: Instant,

    pending_notify: Option<PendingNotify>,

    /// End of the current trickle window, if a trickle grant is active.
    last_deadline: Option<Instant>,
    last_rate: f64,

    limiter: Limiter,
}

impl TokenCounter {
    fn new(now: Instant, limiter: Limiter) -> Self {
        Self {
            avg_ru_per_sec: 0.0,
            avg_ru_per_sec_last_ru: 0.0,
            avg_last_time: now,
            pending_notify: None,
            last_deadline: None,
            last_rate: 0.0,
            limiter,
        }
    }
}

/// Bookkeeping of the cleanup scan. The tombstone latches when a scan
/// observes no consumption change since the previous scan, clears on any
/// change, and a latched group is deleted by the next quiet scan.
#[derive(Default)]
struct CleanupState {
    last_seen: Consumption,
    tombstone: bool,
}

/// State owned by the controller main loop.
struct GroupRunState {
    now: Instant,
    /// How long one full token grant is expected to last.
    target_period: Duration,
    /// Last observed value of the authoritative consumption.
    consumption: Consumption,
    /// Consumption at the time of the last report to the server.
    last_request_consumption: Consumption,
    /// Latches once the first token response arrived and the pre-filled
    /// initial budget was retired.
    initial_request_completed: bool,
    ru_tokens: Vec<(RequestUnitType, TokenCounter)>,
    resource_tokens: Vec<(RawResourceType, TokenCounter)>,
}

/// Cost controller for a single resource group.
pub(crate) struct GroupCostController {
    group: ResourceGroup,
    mode: GroupMode,
    calculators: Vec<Arc<dyn ResourceCalculator>>,

    /// Authoritative running consumption, mutated by admission and
    /// settlement under a short lock.
    consumption: Mutex<Consumption>,

    /// Fast path: true while every dimension has an unlimited burst, in
    /// which case admission bypasses the limiters entirely.
    burstable: AtomicBool,

    /// Two-phase deletion marker maintained by the cleanup scan.
    cleanup: Mutex<CleanupState>,

    low_tokens_tx: mpsc::Sender<()>,
    bucket_update_tx: mpsc::Sender<Arc<GroupCostController>>,

    run: Mutex<GroupRunState>,
}

impl std::fmt::Debug for GroupCostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCostController")
            .field("group", &self.group.name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl GroupCostController {
    pub(crate) fn new(
        group: ResourceGroup,
        cfg: &Arc<Config>,
        calculators: Vec<Arc<dyn ResourceCalculator>>,
        sql_cpu_source: SqlCpuSource,
        low_tokens_tx: mpsc::Sender<()>,
        bucket_update_tx: mpsc::Sender<Arc<GroupCostController>>,
    ) -> Result<Self> {
        match group.mode {
            GroupMode::Ru => {
                if group.ru_settings.is_none() {
                    return Err(ControllerError::ConfigUnavailable(format!(
                        "resource group {} has no request unit settings",
                        group.name
                    )));
                }
            }
            GroupMode::Raw => {
                if group.raw_resource_settings.is_none() {
                    return Err(ControllerError::ConfigUnavailable(format!(
                        "resource group {} has no raw resource settings",
                        group.name
                    )));
                }
            }
            GroupMode::Unknown => {
                return Err(ControllerError::ConfigUnavailable(format!(
                    "resource group {} uses an unsupported mode",
                    group.name
                )));
            }
        }
        let sql_cpu_baseline = if cfg.single_group_by_keyspace {
            (sql_cpu_source)()
        } else {
            0.0
        };
        let now = Instant::now();
        let mode = group.mode;
        Ok(Self {
            group,
            mode,
            calculators,
            consumption: Mutex::new(Consumption::default()),
            burstable: AtomicBool::new(false),
            cleanup: Mutex::new(CleanupState::default()),
            low_tokens_tx,
            bucket_update_tx,
            run: Mutex::new(GroupRunState {
                now,
                target_period: TARGET_PERIOD,
                consumption: Consumption::default(),
                last_request_consumption: Consumption {
                    sql_layer_cpu_time_ms: sql_cpu_baseline,
                    ..Default::default()
                },
                initial_request_completed: false,
                ru_tokens: Vec::new(),
                resource_tokens: Vec::new(),
            }),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.group.name
    }

    fn lock_run(&self) -> MutexGuard<'_, GroupRunState> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_consumption(&self) -> MutexGuard<'_, Consumption> {
        self.consumption
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pre-fills every dimension with the initial RU budget so traffic can
    /// start flowing before the first server grant. The notify threshold is
    /// placed high enough that the first refill request fires as soon as
    /// the group starts consuming.
    pub(crate) fn init_run_state(&self, now: Instant) {
        let initial_cfg = |bucket: &TokenBucket| {
            let mut cfg = LimiterConfig {
                new_tokens: INITIAL_REQUEST_UNITS,
                new_rate: 0.0,
                new_burst: bucket.settings.burst_limit,
                notify_threshold: (INITIAL_REQUEST_UNITS
                    - bucket.settings.fill_rate as f64 * 0.2)
                    .max(1.0),
            };
            if cfg.new_burst >= 0 {
                cfg.new_burst = 0;
            }
            cfg
        };
        let mut guard = self.lock_run();
        let run = &mut *guard;
        run.now = now;
        run.target_period = TARGET_PERIOD;
        match self.mode {
            GroupMode::Raw => {
                run.resource_tokens = RAW_RESOURCE_LIMIT_TYPES
                    .iter()
                    .filter_map(|typ| {
                        let bucket = self.group.raw_bucket_setting(*typ)?;
                        let limiter = Limiter::with_config(
                            now,
                            initial_cfg(bucket),
                            self.low_tokens_tx.clone(),
                        );
                        Some((*typ, TokenCounter::new(now, limiter)))
                    })
                    .collect();
            }
            _ => {
                run.ru_tokens = REQUEST_UNIT_LIMIT_TYPES
                    .iter()
                    .filter_map(|typ| {
                        let bucket = self.group.ru_bucket_setting(*typ)?;
                        let limiter = Limiter::with_config(
                            now,
                            initial_cfg(bucket),
                            self.low_tokens_tx.clone(),
                        );
                        Some((*typ, TokenCounter::new(now, limiter)))
                    })
                    .collect();
            }
        }
    }

    /// Snapshots the authoritative consumption for the main loop, running
    /// the calculators' periodic accounting first.
    pub(crate) fn update_run_state(&self, now: Instant) {
        let snapshot = {
            let mut consumption = self.lock_consumption();
            for calc in &self.calculators {
                calc.trickle(&mut consumption);
            }
            consumption.clone()
        };
        let mut run = self.lock_run();
        run.consumption = snapshot;
        run.now = now;
        debug!(group = %self.group.name, consumption = ?run.consumption, "update run state");
    }

    /// Refreshes the per-dimension demand estimate and the burstable fast
    /// path flag.
    pub(crate) fn update_avg_request_resource_per_sec(&self) {
        let mut guard = self.lock_run();
        let run = &mut *guard;
        let now = run.now;
        let mut burstable = true;
        match self.mode {
            GroupMode::Raw => {
                for (typ, counter) in run.resource_tokens.iter_mut() {
                    if counter.limiter.burst() >= 0 {
                        burstable = false;
                    }
                    let value = run.consumption.raw_value(*typ);
                    if calc_avg(counter, now, value) {
                        debug!(
                            group = %self.group.name,
                            kind = ?typ,
                            avg_ru_per_sec = counter.avg_ru_per_sec,
                            "update avg raw resource per sec"
                        );
                    }
                }
            }
            _ => {
                for (typ, counter) in run.ru_tokens.iter_mut() {
                    if counter.limiter.burst() >= 0 {
                        burstable = false;
                    }
                    let value = run.consumption.ru_value(*typ);
                    if calc_avg(counter, now, value) {
                        debug!(
                            group = %self.group.name,
                            kind = ?typ,
                            avg_ru_per_sec = counter.avg_ru_per_sec,
                            "update avg ru per sec"
                        );
                    }
                }
            }
        }
        self.burstable.store(burstable, Ordering::Relaxed);
    }

    /// Whether the consumption delta since the last report crosses the
    /// reporting threshold on any dimension.
    pub(crate) fn should_report_consumption(&self) -> bool {
        let run = self.lock_run();
        match self.mode {
            GroupMode::Raw => RAW_RESOURCE_LIMIT_TYPES.iter().any(|typ| {
                run.consumption.raw_value(*typ) - run.last_request_consumption.raw_value(*typ)
                    >= CONSUMPTION_REPORTING_THRESHOLD
            }),
            _ => REQUEST_UNIT_LIMIT_TYPES.iter().any(|typ| {
                run.consumption.ru_value(*typ) - run.last_request_consumption.ru_value(*typ)
                    >= CONSUMPTION_REPORTING_THRESHOLD
            }),
        }
    }

    /// Builds this group's slice of the batched token request.
    ///
    /// With `only_low` set, the group is skipped entirely unless some
    /// dimension currently reports low tokens. A returned request also
    /// rolls the consumption-delta bookkeeping forward.
    pub(crate) fn collect_request_and_consumption(
        &self,
        only_low: bool,
    ) -> Option<TokenBucketRequest> {
        let mut guard = self.lock_run();
        let run = &mut *guard;
        let now = run.now;
        let target_period = run.target_period;
        let mut selected = !only_low;
        let request = match self.mode {
            GroupMode::Raw => {
                let mut items = Vec::with_capacity(run.resource_tokens.len());
                for (typ, counter) in &run.resource_tokens {
                    if only_low && counter.limiter.is_low_tokens() {
                        selected = true;
                    }
                    items.push(RawResourceItem {
                        kind: *typ,
                        value: calc_request(counter, now, target_period),
                    });
                }
                RequestItems::RawResources(items)
            }
            _ => {
                let mut items = Vec::with_capacity(run.ru_tokens.len());
                for (typ, counter) in &run.ru_tokens {
                    if only_low && counter.limiter.is_low_tokens() {
                        selected = true;
                    }
                    items.push(RequestUnitItem {
                        kind: *typ,
                        value: calc_request(counter, now, target_period),
                    });
                }
                RequestItems::RequestUnits(items)
            }
        };
        if !selected {
            return None;
        }
        let mut delta = run.consumption.clone();
        delta.sub(&run.last_request_consumption);
        run.last_request_consumption = run.consumption.clone();
        Some(TokenBucketRequest {
            resource_group_name: self.group.name.clone(),
            request,
            consumption_since_last_request: delta,
        })
    }

    /// Applies one group's slice of a token response. The very first
    /// response also retires the pre-filled initial budget on every
    /// dimension.
    pub(crate) fn handle_token_bucket_response(self: &Arc<Self>, resp: &TokenBucketResponse) {
        let mut guard = self.lock_run();
        let run = &mut *guard;
        let now = run.now;
        match self.mode {
            GroupMode::Raw => {
                for granted in &resp.granted_resource_tokens {
                    match run
                        .resource_tokens
                        .iter_mut()
                        .find(|(typ, _)| *typ == granted.kind)
                    {
                        Some((_, counter)) => self.modify_token_counter(
                            counter,
                            now,
                            &granted.granted_tokens,
                            granted.trickle_time_ms,
                        ),
                        None => warn!(
                            group = %self.group.name,
                            kind = ?granted.kind,
                            "token grant for an unsupported resource type"
                        ),
                    }
                }
            }
            _ => {
                for granted in &resp.granted_ru_tokens {
                    match run
                        .ru_tokens
                        .iter_mut()
                        .find(|(typ, _)| *typ == granted.kind)
                    {
                        Some((_, counter)) => self.modify_token_counter(
                            counter,
                            now,
                            &granted.granted_tokens,
                            granted.trickle_time_ms,
                        ),
                        None => warn!(
                            group = %self.group.name,
                            kind = ?granted.kind,
                            "token grant for an unsupported request unit type"
                        ),
                    }
                }
            }
        }
        if !run.initial_request_completed {
            run.initial_request_completed = true;
            for (_, counter) in &run.ru_tokens {
                counter.limiter.remove_tokens(now, INITIAL_REQUEST_UNITS);
            }
            for (_, counter) in &run.resource_tokens {
                counter.limiter.remove_tokens(now, INITIAL_REQUEST_UNITS);
            }
        }
    }

    /// Reconfigures one dimension from a token grant.
    ///
    /// Any undelivered remainder of a previous trickle window is folded
    /// into the new grant. A zero trickle installs the tokens at once; a
    /// nonzero trickle delivers them by raising the fill rate for the
    /// window and defers the notify-threshold install until shortly before
    /// the window closes.
    fn modify_token_counter(
        self: &Arc<Self>,
        counter: &mut TokenCounter,
        now: Instant,
        bucket: &TokenBucket,
        trickle_time_ms: i64,
    ) {
        let mut granted = bucket.tokens;
        if let Some(last_deadline) = counter.last_deadline {
            if last_deadline > now {
                granted += counter.last_rate * (last_deadline - now).as_secs_f64();
            }
        }
        // A fresh grant supersedes any armed deferred install.
        counter.pending_notify = None;
        let notify_threshold = (granted * NOTIFY_FRACTION).max(BUFFER_RUS);

        let mut cfg = LimiterConfig {
            new_burst: bucket.settings.burst_limit,
            ..Default::default()
        };
        if trickle_time_ms <= 0 {
            // The server has tokens to spare; everything is granted at
            // once and the client may accumulate more.
            cfg.new_tokens = granted;
            cfg.new_rate = bucket.settings.fill_rate as f64;
            cfg.notify_threshold = notify_threshold;
            counter.last_deadline = None;
            if cfg.new_burst >= 0 {
                cfg.new_burst = 0;
            }
        } else {
            let trickle = Duration::from_millis(trickle_time_ms as u64);
            cfg.new_tokens = 0.0;
            cfg.new_rate = bucket.settings.fill_rate as f64 + granted / trickle.as_secs_f64();
            let timer_duration = trickle.saturating_sub(Duration::from_secs(1)).max(trickle / 2);
            counter.pending_notify = Some(PendingNotify {
                install_at: now + timer_duration,
                threshold: notify_threshold,
            });
            counter.last_deadline = Some(now + trickle);
            if self.bucket_update_tx.try_send(Arc::clone(self)).is_err() {
                debug!(group = %self.group.name, "token bucket update channel full, dropping signal");
            }
        }
        counter.last_rate = cfg.new_rate;
        counter.limiter.reconfigure(now, cfg);
    }

    /// Services the deferred notification-threshold installs armed by
    /// trickle grants. Runs as a detached task; a newer grant invalidates
    /// the pending entry and the install is skipped.
    pub(crate) async fn handle_token_bucket_update_event(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) {
        let pending: Vec<(bool, usize, PendingNotify)> = {
            let run = self.lock_run();
            let ru = run
                .ru_tokens
                .iter()
                .enumerate()
                .filter_map(|(i, (_, c))| c.pending_notify.map(|p| (true, i, p)));
            let raw = run
                .resource_tokens
                .iter()
                .enumerate()
                .filter_map(|(i, (_, c))| c.pending_notify.map(|p| (false, i, p)));
            ru.chain(raw).collect()
        };
        for (is_ru, idx, pending) in pending {
            tokio::select! {
                _ = tokio::time::sleep_until(pending.install_at) => {
                    let mut guard = self.lock_run();
                    let run = &mut *guard;
                    let counter = if is_ru {
                        run.ru_tokens.get_mut(idx).map(|(_, c)| c)
                    } else {
                        run.resource_tokens.get_mut(idx).map(|(_, c)| c)
                    };
                    let Some(counter) = counter else { continue };
                    if counter.pending_notify == Some(pending) {
                        counter.pending_notify = None;
                        counter
                            .limiter
                            .setup_notification_threshold(Instant::now(), pending.threshold);
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Admits one request: pre-charges it, reserves tokens on every
    /// affected dimension (waiting if needed) and commits the delta.
    ///
    /// The delta is committed only after the reservations succeed, so a
    /// throttled or cancelled admission leaves the consumption untouched.
    #[tracing::instrument(skip_all, fields(group = %self.group.name))]
    pub(crate) async fn on_request_wait(
        &self,
        ctx: &AdmissionContext,
        info: &dyn RequestInfo,
    ) -> Result<Consumption> {
        let mut delta = Consumption::default();
        for calc in &self.calculators {
            calc.before_kv_request(&mut delta, info);
        }
        if !self.burstable.load(Ordering::Relaxed) {
            let mut last_err = ControllerError::Throttled;
            let mut granted = false;
            for attempt in 0..MAX_RETRY {
                if attempt > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                        _ = ctx.cancelled() => return Err(ControllerError::Cancelled),
                    }
                }
                let (now, reservations) = {
                    let run = self.lock_run();
                    let now = Instant::now();
                    let mut reservations = Vec::new();
                    match self.mode {
                        GroupMode::Raw => {
                            for (typ, counter) in &run.resource_tokens {
                                let value = delta.raw_value(*typ);
                                if value > 0.0 {
                                    reservations.push(counter.limiter.reserve(
                                        ctx,
                                        DEFAULT_MAX_WAIT_DURATION,
                                        now,
                                        value,
                                    ));
                                }
                            }
                        }
                        _ => {
                            for (typ, counter) in &run.ru_tokens {
                                let value = delta.ru_value(*typ);
                                if value > 0.0 {
                                    reservations.push(counter.limiter.reserve(
                                        ctx,
                                        DEFAULT_MAX_WAIT_DURATION,
                                        now,
                                        value,
                                    ));
                                }
                            }
                        }
                    }
                    (now, reservations)
                };
                match wait_reservations(ctx, now, &reservations).await {
                    Ok(()) => {
                        granted = true;
                        break;
                    }
                    Err(ControllerError::Cancelled) => return Err(ControllerError::Cancelled),
                    Err(err) => last_err = err,
                }
            }
            if !granted {
                warn!(group = %self.group.name, "admission throttled after retries");
                return Err(last_err);
            }
        }
        self.lock_consumption().add(&delta);
        Ok(delta)
    }

    /// Settles one finished request: post-charges it, debits the actual
    /// usage from the limiters and commits the delta.
    #[tracing::instrument(skip_all, fields(group = %self.group.name))]
    pub(crate) fn on_response(
        &self,
        req: &dyn RequestInfo,
        resp: &dyn ResponseInfo,
    ) -> Result<Consumption> {
        let mut delta = Consumption::default();
        for calc in &self.calculators {
            calc.after_kv_request(&mut delta, req, resp);
        }
        if !self.burstable.load(Ordering::Relaxed) {
            let now = Instant::now();
            let run = self.lock_run();
            match self.mode {
                GroupMode::Raw => {
                    for (typ, counter) in &run.resource_tokens {
                        let value = delta.raw_value(*typ);
                        if value > 0.0 {
                            counter.limiter.remove_tokens(now, value);
                        }
                    }
                }
                _ => {
                    for (typ, counter) in &run.ru_tokens {
                        let value = delta.ru_value(*typ);
                        if value > 0.0 {
                            counter.limiter.remove_tokens(now, value);
                        }
                    }
                }
            }
        }
        self.lock_consumption().add(&delta);
        Ok(delta)
    }

    pub(crate) fn latest_consumption(&self) -> Consumption {
        self.lock_consumption().clone()
    }

    /// One step of the two-phase deletion protocol, run per cleanup scan.
    /// Returns true once two consecutive scans observed no RU consumption
    /// change, i.e. the group is stale and should be dropped.
    pub(crate) fn advance_tombstone(&self) -> bool {
        let current = self.latest_consumption();
        let mut cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.equal_ru(&cleanup.last_seen) {
            if cleanup.tombstone {
                return true;
            }
            cleanup.tombstone = true;
        } else {
            cleanup.tombstone = false;
        }
        cleanup.last_seen = current;
        false
    }
}

/// Folds a new consumption sample into the moving average. Samples closer
/// than 500 ms apart are skipped to keep the estimate stable.
fn calc_avg(counter: &mut TokenCounter, now: Instant, new_value: f64) -> bool {
    let delta = now.saturating_duration_since(counter.avg_last_time);
    if delta < Duration::from_millis(500) {
        return false;
    }
    let sample = (new_value - counter.avg_ru_per_sec_last_ru) / delta.as_secs_f64();
    counter.avg_ru_per_sec =
        MOVING_AVG_FACTOR * counter.avg_ru_per_sec + (1.0 - MOVING_AVG_FACTOR) * sample;
    counter.avg_last_time = now;
    counter.avg_ru_per_sec_last_ru = new_value;
    true
}

/// RUs to request for one dimension: estimated demand for a full target
/// period plus a buffer, minus what is still in the bucket.
fn calc_request(counter: &TokenCounter, now: Instant, target_period: Duration) -> f64 {
    let value = counter.avg_ru_per_sec * target_period.as_secs_f64() + BUFFER_RUS
        - counter.limiter.available_tokens(now);
    value.max(0.0)
}
