//! Continuous-rate token bucket with reservations and low-token
//! notifications.
//!
//! The limiter meters one cost dimension of one resource group. Callers
//! reserve tokens ahead of a request (possibly agreeing to wait for them),
//! debit actual usage after the response, and reconfigure the bucket
//! whenever the server grants a refill. All state lives behind one internal
//! mutex; no operation holds it across a suspension point.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControllerError, Result};

/// Cancellation and deadline scope for one admission call.
#[derive(Clone, Debug, Default)]
pub struct AdmissionContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl AdmissionContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by an external cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Attaches an absolute deadline to the context.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves once the call is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

/// Arguments for [`Limiter::reconfigure`]. Every field is installed as-is;
/// `new_tokens` replaces the balance rather than adding to it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LimiterConfig {
    pub new_tokens: f64,
    /// Refill rate in tokens per second.
    pub new_rate: f64,
    /// Token ceiling. Positive caps the balance, zero leaves it uncapped,
    /// negative additionally makes the limiter transparent.
    pub new_burst: i64,
    /// Balance below which the low-token signal fires. Zero disables it.
    pub notify_threshold: f64,
}

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    rate: f64,
    burst: i64,
    last_update: Instant,
    notify_threshold: f64,
    low_tokens_notified: bool,
    notify_tx: Option<mpsc::Sender<()>>,
}

impl LimiterState {
    /// Moves `last_update` to `now`, crediting the refill accrued since the
    /// previous update. Never decreases the balance. A positive burst caps
    /// the balance; zero and negative bursts accumulate without a ceiling.
    fn advance(&mut self, now: Instant) {
        if now <= self.last_update {
            return;
        }
        let elapsed = (now - self.last_update).as_secs_f64();
        let mut tokens = self.tokens + self.rate * elapsed;
        if self.burst > 0 && tokens > self.burst as f64 {
            tokens = self.burst as f64;
        }
        self.tokens = tokens;
        self.last_update = now;
    }

    /// The balance as it would be after advancing to `now`, without
    /// mutating anything.
    fn available(&self, now: Instant) -> f64 {
        if now <= self.last_update {
            return self.tokens;
        }
        let elapsed = (now - self.last_update).as_secs_f64();
        let mut tokens = self.tokens + self.rate * elapsed;
        if self.burst > 0 && tokens > self.burst as f64 {
            tokens = self.burst as f64;
        }
        tokens
    }

    fn is_low(&self, now: Instant) -> bool {
        self.burst >= 0 && self.notify_threshold > 0.0 && self.available(now) < self.notify_threshold
    }

    /// Latches and fires the low-token signal when the balance has fallen
    /// below the threshold. The channel has capacity 1; a pending signal is
    /// enough, so a full channel drops the send.
    fn maybe_notify(&mut self, now: Instant) {
        if self.low_tokens_notified || !self.is_low(now) {
            return;
        }
        self.low_tokens_notified = true;
        debug!(
            tokens = self.tokens,
            threshold = self.notify_threshold,
            "low token notification"
        );
        if let Some(tx) = &self.notify_tx {
            let _ = tx.try_send(());
        }
    }
}

/// Token bucket limiter for one cost dimension. Cheap to clone; clones
/// share the same bucket.
#[derive(Clone, Debug)]
pub struct Limiter {
    state: Arc<Mutex<LimiterState>>,
}

impl Limiter {
    /// A limiter without a notification channel, mainly for tests and
    /// standalone use.
    pub fn new(now: Instant, rate: f64, tokens: f64, burst: i64) -> Self {
        Self::build(now, rate, tokens, burst, 0.0, None)
    }

    /// The limiter used by group controllers: initial state from `cfg`,
    /// low-token signals delivered on `notify_tx`.
    pub fn with_config(now: Instant, cfg: LimiterConfig, notify_tx: mpsc::Sender<()>) -> Self {
        Self::build(
            now,
            cfg.new_rate,
            cfg.new_tokens,
            cfg.new_burst,
            cfg.notify_threshold,
            Some(notify_tx),
        )
    }

    fn build(
        now: Instant,
        rate: f64,
        tokens: f64,
        burst: i64,
        notify_threshold: f64,
        notify_tx: Option<mpsc::Sender<()>>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                tokens,
                rate,
                burst,
                last_update: now,
                notify_threshold,
                low_tokens_notified: false,
                notify_tx,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves `amount` tokens, committing the debit immediately and
    /// reporting when they will all be available.
    ///
    /// The reservation is not ok when the wait would exceed `max_wait` or
    /// the context deadline, or when the bucket can never satisfy it
    /// (`rate == 0` and not enough tokens). A reservation that is not ok
    /// leaves the bucket untouched.
    pub fn reserve(
        &self,
        ctx: &AdmissionContext,
        max_wait: Duration,
        now: Instant,
        amount: f64,
    ) -> Reservation {
        let mut state = self.lock();
        // Unlimited burst keeps the limiter transparent.
        if state.burst < 0 {
            return Reservation {
                ok: true,
                amount,
                time_to_act: now,
                limiter: self.clone(),
            };
        }
        state.advance(now);
        let remaining = state.tokens - amount;
        let mut ok = true;
        let mut wait = Duration::ZERO;
        if remaining < 0.0 {
            if state.rate <= 0.0 {
                ok = false;
            } else {
                wait = Duration::from_secs_f64(-remaining / state.rate);
            }
        }
        if wait > max_wait {
            ok = false;
        }
        let time_to_act = now + wait;
        if let Some(deadline) = ctx.deadline() {
            if time_to_act > deadline {
                ok = false;
            }
        }
        if ok {
            state.tokens = remaining;
            state.maybe_notify(now);
        }
        Reservation {
            ok,
            amount,
            time_to_act: if ok { time_to_act } else { now },
            limiter: self.clone(),
        }
    }

    /// Unconditional debit. The balance may go negative; the debt is paid
    /// back by future refills.
    pub fn remove_tokens(&self, now: Instant, amount: f64) {
        let mut state = self.lock();
        if state.burst < 0 {
            return;
        }
        state.advance(now);
        state.tokens -= amount;
        state.maybe_notify(now);
    }

    /// Replaces the bucket parameters, clearing the low-token latch so a
    /// fresh notification subscription is in place.
    pub fn reconfigure(&self, now: Instant, cfg: LimiterConfig) {
        let mut state = self.lock();
        state.advance(now);
        state.tokens = cfg.new_tokens;
        state.rate = cfg.new_rate;
        state.burst = cfg.new_burst;
        state.notify_threshold = cfg.notify_threshold;
        state.low_tokens_notified = false;
        state.maybe_notify(now);
        debug!(
            tokens = state.tokens,
            rate = state.rate,
            burst = state.burst,
            threshold = state.notify_threshold,
            "limiter reconfigured"
        );
    }

    /// Installs a new notification threshold and re-arms the latch.
    pub fn setup_notification_threshold(&self, now: Instant, threshold: f64) {
        let mut state = self.lock();
        state.advance(now);
        state.notify_threshold = threshold;
        state.low_tokens_notified = false;
        state.maybe_notify(now);
    }

    /// The balance as of `now`, without mutating the bucket.
    pub fn available_tokens(&self, now: Instant) -> f64 {
        self.lock().available(now)
    }

    /// Whether the low-token signal has fired, or the balance currently
    /// sits below the threshold.
    pub fn is_low_tokens(&self) -> bool {
        let state = self.lock();
        state.low_tokens_notified || state.is_low(Instant::now())
    }

    /// The configured burst. Negative means unlimited.
    pub fn burst(&self) -> i64 {
        self.lock().burst
    }
}

/// A pending claim for tokens on one bucket.
#[derive(Clone, Debug)]
pub struct Reservation {
    ok: bool,
    amount: f64,
    time_to_act: Instant,
    limiter: Limiter,
}

impl Reservation {
    /// Whether the claim can possibly be satisfied within its wait budget.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// The earliest moment all reserved tokens are available.
    pub fn time_to_act(&self) -> Instant {
        self.time_to_act
    }

    /// Remaining wait as seen from `now`.
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.time_to_act.saturating_duration_since(now)
    }

    /// Rolls the reservation back, crediting the tokens to the bucket.
    /// A reservation whose tokens were already usable at `now` is spent and
    /// not returned.
    pub fn cancel_at(&self, now: Instant) {
        if !self.ok || self.time_to_act <= now {
            return;
        }
        let mut state = self.limiter.lock();
        if state.burst < 0 {
            return;
        }
        state.advance(now);
        state.tokens += self.amount;
        debug!(amount = self.amount, "reservation cancelled");
    }
}

/// Waits until every reservation in the batch is satisfied, i.e. until the
/// maximum `time_to_act`.
///
/// If any reservation is not ok the whole batch is rolled back and the call
/// fails with [`ControllerError::Throttled`]. If the context is cancelled
/// while waiting, the batch is rolled back and the call fails with
/// [`ControllerError::Cancelled`].
pub async fn wait_reservations(
    ctx: &AdmissionContext,
    now: Instant,
    reservations: &[Reservation],
) -> Result<()> {
    if reservations.is_empty() {
        return Ok(());
    }
    let mut longest = Duration::ZERO;
    for res in reservations {
        if !res.is_ok() {
            cancel_all(reservations, now);
            return Err(ControllerError::Throttled);
        }
        longest = longest.max(res.delay_from(now));
    }
    if longest.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep_until(now + longest) => Ok(()),
        _ = ctx.cancelled() => {
            cancel_all(reservations, now);
            Err(ControllerError::Cancelled)
        }
    }
}

fn cancel_all(reservations: &[Reservation], now: Instant) {
    for res in reservations {
        res.cancel_at(now);
    }
}
