//! # Claim Check
//!
//! Out-of-band storage for payloads too large for the transport. The
//! publisher checks a payload in under its result id and sends a pointer
//! carrying that id; the consumer claims the payload the pointer names.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CoordinationResult;

#[async_trait]
pub trait ClaimCheck: Send + Sync {
    /// Store a payload under its result id, replacing any earlier payload
    /// with the same id
    async fn check(&self, query_id: &str, result_id: &str, payload: Vec<u8>) -> CoordinationResult<()>;

    /// Take the payload stored for `result_id`, waiting up to `timeout` for
    /// it to be checked in
    async fn claim(&self, query_id: &str, result_id: &str, timeout: Duration)
        -> CoordinationResult<Option<Vec<u8>>>;

    /// Put a claimed payload back, for a result that will be redelivered
    fn restore(&self, query_id: &str, result_id: &str, payload: Vec<u8>);

    /// Withdraw the payload of a pointer that was never delivered
    fn retract(&self, query_id: &str, result_id: &str) -> Option<Vec<u8>>;

    /// Drop stored payloads, keeping the store
    async fn empty(&self, query_id: &str) -> CoordinationResult<()>;

    /// Drop the store
    async fn delete(&self, query_id: &str) -> CoordinationResult<()>;

    fn pending(&self, query_id: &str) -> usize;
}

/// Process-local claim check
#[derive(Debug, Default, Clone)]
pub struct InMemoryClaimCheck {
    stores: Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>,
    checked_in: Arc<Notify>,
}

impl InMemoryClaimCheck {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, query_id: &str, result_id: &str) -> Option<Vec<u8>> {
        self.stores
            .lock()
            .get_mut(query_id)
            .and_then(|store| store.remove(result_id))
    }

    fn store(&self, query_id: &str, result_id: &str, payload: Vec<u8>) {
        self.stores
            .lock()
            .entry(query_id.to_string())
            .or_default()
            .insert(result_id.to_string(), payload);
        self.checked_in.notify_waiters();
    }
}

#[async_trait]
impl ClaimCheck for InMemoryClaimCheck {
    async fn check(&self, query_id: &str, result_id: &str, payload: Vec<u8>) -> CoordinationResult<()> {
        debug!(
            query_id = query_id,
            result_id = result_id,
            bytes = payload.len(),
            "📦 Claim check stored payload"
        );
        self.store(query_id, result_id, payload);
        Ok(())
    }

    async fn claim(
        &self,
        query_id: &str,
        result_id: &str,
        timeout: Duration,
    ) -> CoordinationResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.checked_in.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.take(query_id, result_id) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.take(query_id, result_id));
            }
        }
    }

    fn restore(&self, query_id: &str, result_id: &str, payload: Vec<u8>) {
        self.store(query_id, result_id, payload);
    }

    fn retract(&self, query_id: &str, result_id: &str) -> Option<Vec<u8>> {
        let retracted = self.take(query_id, result_id);
        if retracted.is_some() {
            debug!(query_id = query_id, result_id = result_id, "Claim check payload retracted");
        }
        retracted
    }

    async fn empty(&self, query_id: &str) -> CoordinationResult<()> {
        if let Some(store) = self.stores.lock().get_mut(query_id) {
            store.clear();
        }
        Ok(())
    }

    async fn delete(&self, query_id: &str) -> CoordinationResult<()> {
        self.stores.lock().remove(query_id);
        Ok(())
    }

    fn pending(&self, query_id: &str) -> usize {
        self.stores.lock().get(query_id).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claims_by_result_id() {
        let claim_check = InMemoryClaimCheck::new();
        claim_check.check("q1", "r1", b"first".to_vec()).await.unwrap();
        claim_check.check("q1", "r2", b"second".to_vec()).await.unwrap();
        claim_check.check("q2", "r1", b"other".to_vec()).await.unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(claim_check.claim("q1", "r2", timeout).await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(claim_check.claim("q1", "r1", timeout).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(claim_check.claim("q1", "r1", timeout).await.unwrap(), None);
        assert_eq!(claim_check.pending("q2"), 1);
    }

    #[tokio::test]
    async fn test_restore_makes_payload_claimable_again() {
        let claim_check = InMemoryClaimCheck::new();
        claim_check.check("q", "a", b"a".to_vec()).await.unwrap();

        let a = claim_check.claim("q", "a", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(claim_check.pending("q"), 0);
        claim_check.restore("q", "a", a);
        assert_eq!(claim_check.claim("q", "a", Duration::ZERO).await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_retract_removes_only_named_payload() {
        let claim_check = InMemoryClaimCheck::new();
        claim_check.check("q", "b", b"b".to_vec()).await.unwrap();
        claim_check.check("q", "a", b"a".to_vec()).await.unwrap();

        assert_eq!(claim_check.retract("q", "b"), Some(b"b".to_vec()));
        assert_eq!(claim_check.retract("q", "b"), None);
        assert_eq!(claim_check.claim("q", "a", Duration::ZERO).await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_claim_waits_for_check() {
        let claim_check = InMemoryClaimCheck::new();
        let waiter = {
            let claim_check = claim_check.clone();
            tokio::spawn(async move { claim_check.claim("q", "late", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        claim_check.check("q", "early", b"early".to_vec()).await.unwrap();
        claim_check.check("q", "late", b"late".to_vec()).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Some(b"late".to_vec()));
        assert_eq!(claim_check.pending("q"), 1);
    }

    #[tokio::test]
    async fn test_empty_and_delete() {
        let claim_check = InMemoryClaimCheck::new();
        claim_check.check("q", "x", b"x".to_vec()).await.unwrap();
        claim_check.empty("q").await.unwrap();
        assert_eq!(claim_check.pending("q"), 0);
        claim_check.check("q", "y", b"y".to_vec()).await.unwrap();
        claim_check.delete("q").await.unwrap();
        assert_eq!(claim_check.pending("q"), 0);
    }
}
