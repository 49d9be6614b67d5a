use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fraction of the interval used for jitter in both directions.
pub const JITTER: f64 = 0.1;

/// `interval` scaled by a random factor in `[1 - JITTER, 1 + JITTER]`.
pub fn jittered(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
    interval.mul_f64(factor)
}

/// Sleep a jittered `interval`, returning `true` if `token` fired first.
pub async fn random_sleep(interval: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(jittered(interval)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_random_sleep_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(random_sleep(Duration::from_secs(60), &token).await);
        assert!(!random_sleep(Duration::from_millis(1), &CancellationToken::new()).await);
    }
}
