/// Permit handed out by [`Semaphore::acquire_owned`], returned to the pool on drop.
#[derive(Debug)]
pub struct Permit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct Semaphore {
    limit: usize,
    sem: std::sync::Arc<tokio::sync::Semaphore>,
}

impl Semaphore {
    /// Creates a pool with exactly `limit` permits.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero - a pool without permits would block every acquirer forever.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "concurrency limit must be greater than zero");
        let limit = std::cmp::min(limit, tokio::sync::Semaphore::MAX_PERMITS);
        Self {
            limit,
            sem: std::sync::Arc::new(tokio::sync::Semaphore::new(limit)),
        }
    }

    pub async fn acquire_owned(&self) -> Permit {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            // the semaphore is never closed
            .unwrap_or_else(|_| unreachable!("concurrency semaphore closed"));
        tracing::trace!("permit acquired, in use: {}", self.in_use());
        Permit { _permit: permit }
    }

    /// Non-blocking variant of [`Semaphore::acquire_owned`].
    pub fn try_acquire_owned(&self) -> Option<Permit> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.limit - self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded() {
        let pool = Semaphore::new(2);
        let first = pool.acquire_owned().await;
        let _second = pool.acquire_owned().await;
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_acquire_owned().is_none());
        drop(first);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire_owned().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_release() {
        let pool = Semaphore::new(1);
        let held = pool.acquire_owned().await;
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _permit = pool.acquire_owned().await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "concurrency limit must be greater than zero")]
    fn zero_limit_is_rejected() {
        let _ = Semaphore::new(0);
    }
}
