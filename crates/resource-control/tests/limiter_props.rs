//! Property-based tests for the token bucket limiter.
//!
//! Verifies the limiter invariants:
//! - Conservation: without refill, the balance moves exactly by the debits
//! - Rollback: cancelling a waiting reservation restores the balance
//! - Failed reservations leave the bucket untouched
//! - A positive burst is a hard ceiling on the balance
//! - Reconfiguring twice with identical arguments equals reconfiguring once
//! - Consumption counters are monotone under field-wise addition

use proptest::prelude::*;
use tokio::time::{Duration, Instant};

use resource_control::prelude::*;

fn ctx() -> AdmissionContext {
    AdmissionContext::new()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// With a zero rate the balance changes only by explicit debits.
    #[test]
    fn prop_balance_conserved_without_refill(
        initial in 0.0f64..10_000.0,
        debits in prop::collection::vec(0.0f64..100.0, 1..50),
    ) {
        let now = Instant::now();
        let limiter = Limiter::new(now, 0.0, initial, 0);
        let mut expected = initial;
        for (i, debit) in debits.iter().enumerate() {
            limiter.remove_tokens(now + Duration::from_millis(i as u64), *debit);
            expected -= debit;
        }
        let balance = limiter.available_tokens(now + Duration::from_secs(60));
        prop_assert!(
            (balance - expected).abs() < 1e-6,
            "balance {} != expected {}", balance, expected
        );
    }

    /// Cancelling a reservation that still waits for tokens restores the
    /// balance exactly.
    #[test]
    fn prop_cancelled_reservation_restores_balance(
        initial in 0.0f64..1_000.0,
        rate in 1.0f64..100.0,
        extra in 0.1f64..100.0,
    ) {
        let now = Instant::now();
        let limiter = Limiter::new(now, rate, initial, 0);
        let before = limiter.available_tokens(now);
        // Ask for more than the bucket holds so the reservation must wait.
        let res = limiter.reserve(&ctx(), Duration::from_secs(3_600), now, initial + extra);
        prop_assert!(res.is_ok());
        prop_assert!(res.time_to_act() > now);
        res.cancel_at(now);
        let after = limiter.available_tokens(now);
        prop_assert!(
            (after - before).abs() < 1e-6,
            "balance {} != pre-reserve {}", after, before
        );
    }

    /// A reservation the bucket can never satisfy fails and leaves the
    /// balance untouched.
    #[test]
    fn prop_failed_reservation_leaves_balance(
        initial in 0.0f64..100.0,
        extra in 1.0f64..1_000.0,
    ) {
        let now = Instant::now();
        let limiter = Limiter::new(now, 0.0, initial, 0);
        let res = limiter.reserve(&ctx(), Duration::from_secs(1), now, initial + extra);
        prop_assert!(!res.is_ok());
        let balance = limiter.available_tokens(now);
        prop_assert!((balance - initial).abs() < 1e-6);
    }

    /// A granted reservation never promises a wait beyond `max_wait`.
    #[test]
    fn prop_granted_wait_within_budget(
        initial in 0.0f64..100.0,
        rate in 1.0f64..100.0,
        amount in 0.0f64..500.0,
        max_wait_ms in 1u64..10_000,
    ) {
        let now = Instant::now();
        let limiter = Limiter::new(now, rate, initial, 0);
        let max_wait = Duration::from_millis(max_wait_ms);
        let res = limiter.reserve(&ctx(), max_wait, now, amount);
        if res.is_ok() {
            prop_assert!(res.delay_from(now) <= max_wait);
        }
    }

    /// A positive burst caps the balance no matter how long the bucket
    /// idles.
    #[test]
    fn prop_balance_never_exceeds_burst(
        rate in 1.0f64..1_000.0,
        burst in 1i64..10_000,
        probes in prop::collection::vec(0u64..100_000, 1..20),
    ) {
        let now = Instant::now();
        let limiter = Limiter::new(now, rate, burst as f64, burst);
        for t in probes {
            let balance = limiter.available_tokens(now + Duration::from_millis(t));
            prop_assert!(
                balance <= burst as f64 + 1e-9,
                "balance {} > burst {}", balance, burst
            );
        }
    }

    /// Two consecutive reconfigures with identical arguments behave like
    /// one.
    #[test]
    fn prop_reconfigure_idempotent(
        tokens in 0.0f64..10_000.0,
        rate in 0.0f64..1_000.0,
        burst in -2i64..10_000,
        threshold in 0.0f64..5_000.0,
        probes in prop::collection::vec(0u64..60_000, 1..10),
    ) {
        let now = Instant::now();
        let cfg = LimiterConfig {
            new_tokens: tokens,
            new_rate: rate,
            new_burst: burst,
            notify_threshold: threshold,
        };
        let once = Limiter::new(now, 0.0, 0.0, 0);
        once.reconfigure(now, cfg);
        let twice = Limiter::new(now, 0.0, 0.0, 0);
        twice.reconfigure(now, cfg);
        twice.reconfigure(now, cfg);
        for t in probes {
            let probe = now + Duration::from_millis(t);
            let a = once.available_tokens(probe);
            let b = twice.available_tokens(probe);
            prop_assert!((a - b).abs() < 1e-9, "{} != {} at {}ms", a, b, t);
        }
        prop_assert_eq!(once.is_low_tokens(), twice.is_low_tokens());
    }

    /// Folding non-negative deltas keeps every consumption field
    /// non-decreasing.
    #[test]
    fn prop_consumption_monotone(
        deltas in prop::collection::vec(
            (0.0f64..100.0, 0.0f64..100.0, 0.0f64..4_096.0, 0.0f64..4_096.0, 0.0f64..50.0),
            1..40,
        ),
    ) {
        let mut acc = Consumption::default();
        for (rru, wru, read_bytes, write_bytes, cpu) in deltas {
            let prev = acc.clone();
            acc.add(&Consumption {
                rru,
                wru,
                read_bytes,
                write_bytes,
                total_cpu_time_ms: cpu,
                sql_layer_cpu_time_ms: 0.0,
                kv_read_rpc_count: 1.0,
                kv_write_rpc_count: 1.0,
            });
            prop_assert!(acc.rru >= prev.rru);
            prop_assert!(acc.wru >= prev.wru);
            prop_assert!(acc.read_bytes >= prev.read_bytes);
            prop_assert!(acc.write_bytes >= prev.write_bytes);
            prop_assert!(acc.total_cpu_time_ms >= prev.total_cpu_time_ms);
            prop_assert!(acc.kv_read_rpc_count >= prev.kv_read_rpc_count);
            prop_assert!(acc.kv_write_rpc_count >= prev.kv_write_rpc_count);
        }
    }
}
