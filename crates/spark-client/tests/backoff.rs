//! 退避序列性质验证。
//!
//! - **合同 (What)**：未抖动序列随尝试次数单调不减并在上限封顶；抖动落在 `±jitter` 区间内；
//!   稳定连接后进度归零，下一次等待回到基准值。

use std::time::Duration;

use proptest::prelude::*;
use spark_client::{Backoff, BackoffConfig};

fn config_strategy() -> impl Strategy<Value = BackoffConfig> {
    (1u64..5_000, 1.0f64..3.0, 0u64..600_000).prop_map(|(base_ms, multiplier, extra_ms)| {
        BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            multiplier,
            jitter: 0.0,
            max_delay: Duration::from_millis(base_ms + extra_ms),
            min_stable_duration: Duration::from_secs(10),
        }
    })
}

proptest! {
    #[test]
    fn prop_unjittered_is_monotone_and_capped(config in config_strategy(), attempts in 1u32..64) {
        let mut previous = Duration::ZERO;
        for attempt in 0..attempts {
            let delay = config.unjittered(attempt);
            prop_assert!(delay >= previous, "第 {} 次等待 {:?} 小于前一次 {:?}", attempt, delay, previous);
            prop_assert!(delay <= config.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn prop_jitter_stays_within_bounds(
        jitter in 0.0f64..0.9,
        attempt in 0u32..32,
        seed in any::<u64>(),
    ) {
        let config = BackoffConfig { jitter, ..BackoffConfig::default() };
        let base = config.unjittered(attempt).as_secs_f64();
        let delay = config.delay(attempt, seed).as_secs_f64();
        let ceiling = (base * (1.0 + jitter)).min(config.max_delay.as_secs_f64());
        prop_assert!(delay >= base * (1.0 - jitter) - 1e-6, "{} < 下界", delay);
        prop_assert!(delay <= ceiling + 1e-6, "{} > 上界", delay);
    }

    #[test]
    fn prop_progress_is_deterministic(seed in any::<u64>(), steps in 1usize..12) {
        let mut left = Backoff::new(BackoffConfig::default(), seed);
        let mut right = Backoff::new(BackoffConfig::default(), seed);
        for _ in 0..steps {
            prop_assert_eq!(left.next_delay(), right.next_delay());
        }
    }
}

#[test]
fn sequence_without_jitter_follows_schedule() {
    let config = BackoffConfig {
        base_delay: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: 0.0,
        max_delay: Duration::from_millis(1_000),
        min_stable_duration: Duration::from_secs(1),
    };
    let mut backoff = Backoff::new(config, 0);
    let observed: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
    assert_eq!(observed, [100, 200, 400, 800, 1_000, 1_000]);
}

#[test]
fn stable_connection_resets_to_base() {
    let config = BackoffConfig {
        jitter: 0.0,
        min_stable_duration: Duration::from_millis(500),
        ..BackoffConfig::default()
    };
    let mut backoff = Backoff::new(config, 42);
    for _ in 0..5 {
        backoff.next_delay();
    }
    assert!(backoff.current() > config.base_delay);

    assert!(!backoff.observe_connection(Duration::from_millis(499)), "未达到稳定阈值不应重置");
    assert_eq!(backoff.attempt(), 5);

    assert!(backoff.observe_connection(Duration::from_millis(500)));
    assert_eq!(backoff.current(), config.base_delay);
}
