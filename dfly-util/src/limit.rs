//! 令牌桶限速器。以字节为令牌，0 速率表示不限速

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    /// 桶容量，即最大突发量
    capacity: u64,

    /// 当前令牌数
    tokens: u64,

    /// 每秒补充的令牌数
    rate: u64,

    /// 上次补充时间
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let add = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        self.tokens = (self.tokens + add).min(self.capacity);
    }
}

/// 可在任务间共享的限速器。clone 后仍指向同一个桶
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    /// bytes_per_sec 为 0 时不限速
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self { bucket: None };
        }
        Self {
            bucket: Some(Arc::new(Mutex::new(Bucket {
                capacity: bytes_per_sec,
                tokens: bytes_per_sec,
                rate: bytes_per_sec,
                last_refill: Instant::now(),
            }))),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// 取走 amount 个令牌，不足时挂起等待。
    /// 超过桶容量的请求按容量分批扣减，因此大分片也能在有限时间内通过。
    /// future 被 drop 即视为放弃，已扣减的令牌不退还
    pub async fn acquire(&self, amount: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let mut remain = amount;
        loop {
            let wait = {
                let mut b = bucket.lock().await;
                b.refill();
                let take = remain.min(b.tokens);
                b.tokens -= take;
                remain -= take;
                if remain == 0 {
                    return;
                }
                let need = remain.min(b.capacity);
                Duration::from_millis((need * 1000 / b.rate).max(1))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.is_unlimited());
        let start = Instant::now();
        limiter.acquire(u64::MAX).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_burst_within_capacity() {
        let limiter = RateLimiter::new(1024 * 1024);
        let start = Instant::now();
        limiter.acquire(1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1000);
        // 先掏空桶
        limiter.acquire(1000).await;
        let start = tokio::time::Instant::now();
        // 再要 500，大约需要等 0.5 秒补充
        limiter.acquire(500).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(400), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_larger_than_capacity() {
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await;
        let start = tokio::time::Instant::now();
        limiter.acquire(3000).await;
        // 3 倍容量，至少要等约 3 秒
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
