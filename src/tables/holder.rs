use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

/// A cache entry with a one-shot readiness latch so concurrent readers
/// wait on a single producer.
///
/// The first requester for an unseen key inserts a `Holder` with
/// `available = false` and a latch held, releases the map lock, and
/// performs the external fetch. Every other requester that observes the
/// same holder waits on [`Holder::wait_ready`] instead of fetching again.
pub struct Holder<T> {
    pub creation_time: Instant,
    pub access_time: std::sync::atomic::AtomicU64,
    data: tokio::sync::RwLock<Option<T>>,
    ready: Notify,
    available: std::sync::atomic::AtomicBool,
}

impl<T: Clone> Holder<T> {
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            creation_time: Instant::now(),
            access_time: std::sync::atomic::AtomicU64::new(0),
            data: tokio::sync::RwLock::new(None),
            ready: Notify::new(),
            available: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Called exactly once by the inserting task: stores the fetched value
    /// and releases every waiter.
    pub async fn fulfil(&self, value: T) {
        *self.data.write().await = Some(value);
        self.available.store(true, std::sync::atomic::Ordering::Release);
        self.ready.notify_waiters();
    }

    /// Called exactly once by the inserting task when the fetch failed;
    /// waiters observe `None` from [`Holder::get`] rather than blocking
    /// forever.
    pub async fn fail(&self) {
        self.available.store(true, std::sync::atomic::Ordering::Release);
        self.ready.notify_waiters();
    }

    pub fn is_ready(&self) -> bool {
        self.available.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Waits for the producer to call `fulfil`/`fail`, then returns the
    /// value if one was produced.
    ///
    /// The `Notified` future is created and enabled *before* the
    /// `is_ready()` check (tokio's documented pattern for this race): a
    /// `notify_waiters()` that lands between an `is_ready()` check and a
    /// later `notified()` call would otherwise never wake this waiter.
    pub async fn wait_ready(&self) -> Option<T> {
        let notified = self.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_ready() {
            notified.await;
        }
        self.data.read().await.clone()
    }

    pub fn age(&self) -> std::time::Duration {
        self.creation_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_waiters_see_fulfilled_value() {
        let holder: Arc<Holder<String>> = Holder::pending();
        let h2 = holder.clone();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            h2.fulfil("example.com".to_string()).await;
        });
        let waiter = holder.wait_ready().await;
        producer.await.unwrap();
        assert_eq!(waiter.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn failed_fetch_resolves_waiters_to_none() {
        let holder: Arc<Holder<String>> = Holder::pending();
        holder.fail().await;
        assert!(holder.wait_ready().await.is_none());
    }
}
