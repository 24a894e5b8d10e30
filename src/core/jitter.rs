//! 确定性抖动
//!
//! 每个实例、每个定时器的间隔由 (agent_id, timer_name) 的稳定哈希偏移到名义间隔的 ±12% 之内；
//! 回复前的响应抖动只由 agent_id 决定，落在 15–90 秒。不同实例因此自然错开轮询与回复。

use std::time::Duration;

use sha2::{Digest, Sha256};

pub const DEFAULT_JITTER_FRACTION: f64 = 0.12;
pub const RESPONSE_JITTER_MIN: Duration = Duration::from_secs(15);
pub const RESPONSE_JITTER_MAX: Duration = Duration::from_secs(90);

/// 跨进程、跨版本稳定的哈希（取 SHA-256 前 8 字节）
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// 哈希映射到 [-1.0, 1.0]
fn unit_offset(hash: u64) -> f64 {
    let bucket = (hash % 20_001) as f64;
    bucket / 10_000.0 - 1.0
}

pub fn jittered_interval(agent_id: &str, timer: &str, base: Duration) -> Duration {
    jittered_interval_with(agent_id, timer, base, DEFAULT_JITTER_FRACTION)
}

pub fn jittered_interval_with(agent_id: &str, timer: &str, base: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 0.9);
    let offset = unit_offset(stable_hash(&[agent_id, timer])) * fraction;
    base.mul_f64(1.0 + offset)
}

pub fn response_jitter(agent_id: &str) -> Duration {
    response_jitter_within(agent_id, RESPONSE_JITTER_MIN, RESPONSE_JITTER_MAX)
}

pub fn response_jitter_within(agent_id: &str, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span_ms = (max - min).as_millis() as u64;
    let pick = stable_hash(&[agent_id, "response"]) % (span_ms + 1);
    min + Duration::from_millis(pick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let base = Duration::from_secs(300);
        assert_eq!(
            jittered_interval("peer-a", "awareness", base),
            jittered_interval("peer-a", "awareness", base)
        );
        assert_eq!(response_jitter("peer-a"), response_jitter("peer-a"));
    }

    #[test]
    fn test_within_twelve_percent() {
        let base = Duration::from_secs(600);
        let low = base.mul_f64(1.0 - DEFAULT_JITTER_FRACTION);
        let high = base.mul_f64(1.0 + DEFAULT_JITTER_FRACTION);
        for agent in ["a", "b", "c", "peer-1", "peer-2", "hive.example"] {
            for timer in ["awareness", "expression", "reflection", "plan_awareness"] {
                let d = jittered_interval(agent, timer, base);
                assert!(d >= low && d <= high, "{agent}/{timer}: {d:?}");
            }
        }
    }

    #[test]
    fn test_peers_are_staggered() {
        let base = Duration::from_secs(300);
        let intervals: std::collections::HashSet<_> = (0..10)
            .map(|i| jittered_interval(&format!("peer-{i}"), "awareness", base))
            .collect();
        assert!(intervals.len() > 1);

        let per_timer: std::collections::HashSet<_> = ["awareness", "expression", "reflection"]
            .iter()
            .map(|t| jittered_interval("peer-0", t, base))
            .collect();
        assert!(per_timer.len() > 1);
    }

    #[test]
    fn test_response_jitter_bounds() {
        for i in 0..50 {
            let d = response_jitter(&format!("agent-{i}"));
            assert!(d >= RESPONSE_JITTER_MIN && d <= RESPONSE_JITTER_MAX);
        }
        let fixed = Duration::from_secs(5);
        assert_eq!(response_jitter_within("x", fixed, fixed), fixed);
    }

    #[test]
    fn test_zero_fraction_is_identity() {
        let base = Duration::from_secs(60);
        assert_eq!(jittered_interval_with("a", "t", base, 0.0), base);
    }
}
