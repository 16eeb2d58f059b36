use std::collections::{HashSet, VecDeque};

use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::Mutex;
use tracing::warn;

use crate::jose;

const NONCE_BYTES: usize = 16;

/// Single-use anti-replay tokens. Issued tokens stay live until consumed
/// or evicted once the pool exceeds its capacity; evicted, consumed and
/// unknown tokens all fail consumption. Nothing ever rehydrates.
#[derive(Debug)]
pub struct NoncePool {
    rng: SystemRandom,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    issued: HashSet<String>,
    order: VecDeque<String>,
}

impl NoncePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            rng: SystemRandom::new(),
            capacity,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Issues a fresh 128-bit token and records it as outstanding.
    pub async fn issue(&self) -> String {
        let mut bytes = [0u8; NONCE_BYTES];
        if self.rng.fill(&mut bytes).is_err() {
            warn!("system RNG unavailable while issuing nonce");
        }
        let nonce = jose::b64(&bytes);

        let mut inner = self.inner.lock().await;
        inner.issued.insert(nonce.clone());
        inner.order.push_back(nonce.clone());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.issued.remove(&oldest);
            }
        }
        nonce
    }

    /// Atomically retires an outstanding token. Returns true only for
    /// the first consumption of a token this pool issued.
    pub async fn consume(&self, nonce: &str) -> bool {
        self.inner.lock().await.issued.remove(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_then_consume_once() {
        let pool = NoncePool::new(16);
        let nonce = pool.issue().await;
        assert!(pool.consume(&nonce).await);
        assert!(!pool.consume(&nonce).await);
    }

    #[tokio::test]
    async fn test_unknown_nonce_fails() {
        let pool = NoncePool::new(16);
        assert!(!pool.consume("never-issued").await);
    }

    #[tokio::test]
    async fn test_issued_nonces_are_unique() {
        let pool = NoncePool::new(16);
        let first = pool.issue().await;
        let second = pool.issue().await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_eviction_at_capacity() {
        let pool = NoncePool::new(2);
        let first = pool.issue().await;
        let second = pool.issue().await;
        let third = pool.issue().await;
        assert!(!pool.consume(&first).await);
        assert!(pool.consume(&second).await);
        assert!(pool.consume(&third).await);
    }
}
