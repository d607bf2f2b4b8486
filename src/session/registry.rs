/// Per-request slots: id allocation, record accumulation and completion
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::data::QuoteSnapshot;
use crate::error::GatewayError;
use crate::types::{Bar, TickType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Quote,
    Historical,
}

/// How a request's callback stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// End marker (historical end or snapshot end) arrived
    Finished,
    /// The gateway answered with an error for this request id
    Rejected { code: i32, message: String },
    /// The connection went away before the request finished
    Closed,
}

struct Slot {
    kind: RequestKind,
    records: Vec<Bar>,
    quote: QuoteSnapshot,
    completion: Option<Completion>,
    done: Option<oneshot::Sender<Completion>>,
}

/// Handle returned to the caller of a request
#[derive(Debug)]
pub struct PendingRequest {
    pub req_id: i32,
    pub kind: RequestKind,
    pub(crate) done: oneshot::Receiver<Completion>,
}

/// Result of waiting on a request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub req_id: i32,
    pub kind: RequestKind,
    pub records: Vec<Bar>,
    /// `None` when the wait bound elapsed first
    pub completion: Option<Completion>,
}

impl RequestOutcome {
    pub fn timed_out(&self) -> bool {
        self.completion.is_none()
    }

    /// Why the request ended early, if it did
    pub fn failure(&self) -> Option<GatewayError> {
        match &self.completion {
            Some(Completion::Rejected { code, message }) => Some(GatewayError::RequestRejected {
                req_id: self.req_id,
                code: *code,
                message: message.clone(),
            }),
            Some(Completion::Closed) => Some(GatewayError::Disconnected(format!(
                "request {} did not finish",
                self.req_id
            ))),
            Some(Completion::Finished) | None => None,
        }
    }

    /// Records collected so far. A rejected or aborted request keeps what arrived
    /// before it ended; the failure is only logged.
    pub fn into_records(self) -> Vec<Bar> {
        if let Some(e) = self.failure() {
            warn!(
                "[{}] {}; keeping {} record(s)",
                e.error_code(),
                e,
                self.records.len()
            );
        }
        self.records
    }
}

/// Registry of in-flight requests keyed by request id.
///
/// Ids are unique and increasing for the lifetime of the registry. A slot lives
/// from `register` until `take`.
pub struct RequestRegistry {
    next_id: AtomicI32,
    slots: Mutex<HashMap<i32, Slot>>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        RequestRegistry {
            next_id: AtomicI32::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and open an empty slot for it
    pub async fn register(&self, kind: RequestKind) -> PendingRequest {
        let req_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        self.slots.lock().await.insert(
            req_id,
            Slot {
                kind,
                records: Vec::new(),
                quote: QuoteSnapshot::default(),
                completion: None,
                done: Some(tx),
            },
        );

        PendingRequest { req_id, kind, done: rx }
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, req_id: i32) -> bool {
        self.slots.lock().await.contains_key(&req_id)
    }

    #[cfg(test)]
    pub(crate) async fn kind_of(&self, req_id: i32) -> Option<RequestKind> {
        self.slots.lock().await.get(&req_id).map(|s| s.kind)
    }

    /// Append a historical bar; returns false when the id is unknown
    pub async fn append_bar(&self, req_id: i32, bar: Bar) -> bool {
        match self.slots.lock().await.get_mut(&req_id) {
            Some(slot) => {
                slot.records.push(bar);
                true
            }
            None => false,
        }
    }

    /// Fold a price tick into the quote and record the resulting snapshot
    pub async fn apply_price(
        &self,
        req_id: i32,
        tick_type: TickType,
        price: f64,
        tz: Tz,
        received_at: DateTime<Utc>,
    ) -> Option<Bar> {
        self.update_quote(req_id, tz, received_at, |q| q.apply_price(tick_type, price))
            .await
    }

    pub async fn apply_size(
        &self,
        req_id: i32,
        tick_type: TickType,
        size: i64,
        tz: Tz,
        received_at: DateTime<Utc>,
    ) -> Option<Bar> {
        self.update_quote(req_id, tz, received_at, |q| q.apply_size(tick_type, size))
            .await
    }

    pub async fn apply_string(
        &self,
        req_id: i32,
        tick_type: TickType,
        value: &str,
        tz: Tz,
        received_at: DateTime<Utc>,
    ) -> Option<Bar> {
        self.update_quote(req_id, tz, received_at, |q| q.apply_string(tick_type, value))
            .await
    }

    async fn update_quote<F>(&self, req_id: i32, tz: Tz, received_at: DateTime<Utc>, apply: F) -> Option<Bar>
    where
        F: FnOnce(&mut QuoteSnapshot) -> bool,
    {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(&req_id)?;

        if !apply(&mut slot.quote) {
            return None;
        }

        let bar = slot.quote.to_bar(tz, received_at)?;
        slot.records.push(bar.clone());
        Some(bar)
    }

    /// Resolve a request. Later completions for the same id are ignored.
    pub async fn complete(&self, req_id: i32, completion: Completion) -> bool {
        let mut slots = self.slots.lock().await;
        let slot = match slots.get_mut(&req_id) {
            Some(slot) => slot,
            None => return false,
        };

        if slot.completion.is_some() {
            return false;
        }

        slot.completion = Some(completion.clone());
        if let Some(done) = slot.done.take() {
            // Receiver may already be gone after a timed-out wait
            let _ = done.send(completion);
        }
        true
    }

    /// Resolve every open request as closed; returns how many were affected
    pub async fn close_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let mut closed = 0;

        for slot in slots.values_mut().filter(|s| s.completion.is_none()) {
            slot.completion = Some(Completion::Closed);
            if let Some(done) = slot.done.take() {
                let _ = done.send(Completion::Closed);
            }
            closed += 1;
        }

        closed
    }

    /// Remove the slot and hand back everything it collected
    pub async fn take(&self, req_id: i32) -> Option<RequestOutcome> {
        self.slots.lock().await.remove(&req_id).map(|slot| RequestOutcome {
            req_id,
            kind: slot.kind,
            records: slot.records,
            completion: slot.completion,
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 12, 14, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_ids_unique_and_increasing() {
        let registry = RequestRegistry::new();
        let a = registry.register(RequestKind::Quote).await;
        let b = registry.register(RequestKind::Historical).await;
        let c = registry.register(RequestKind::Quote).await;

        assert!(a.req_id < b.req_id && b.req_id < c.req_id);
        assert_eq!(registry.pending_count().await, 3);
        assert_eq!(registry.kind_of(b.req_id).await, Some(RequestKind::Historical));
    }

    #[tokio::test]
    async fn test_records_isolated_per_request() {
        let registry = RequestRegistry::new();
        let a = registry.register(RequestKind::Historical).await;
        let b = registry.register(RequestKind::Historical).await;

        registry.append_bar(a.req_id, Bar::new("20250311 04:00:00", 1.0, 1.0, 1.0, 1.0, 1)).await;
        registry.append_bar(b.req_id, Bar::new("20250311 05:00:00", 2.0, 2.0, 2.0, 2.0, 2)).await;
        registry.append_bar(b.req_id, Bar::new("20250311 06:00:00", 3.0, 3.0, 3.0, 3.0, 3)).await;
        assert!(!registry.append_bar(999, Bar::new("20250311", 1.0, 1.0, 1.0, 1.0, 1)).await);

        assert_eq!(registry.take(a.req_id).await.unwrap().records.len(), 1);
        assert_eq!(registry.take(b.req_id).await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn test_completion_signals_waiter_once() {
        let registry = RequestRegistry::new();
        let pending = registry.register(RequestKind::Historical).await;

        assert!(registry.complete(pending.req_id, Completion::Finished).await);
        assert!(
            !registry
                .complete(pending.req_id, Completion::Rejected { code: 162, message: "late".into() })
                .await
        );
        assert_eq!(pending.done.await.unwrap(), Completion::Finished);
    }

    #[tokio::test]
    async fn test_take_removes_slot() {
        let registry = RequestRegistry::new();
        let pending = registry.register(RequestKind::Quote).await;

        assert!(registry.take(pending.req_id).await.is_some());
        assert!(!registry.contains(pending.req_id).await);
        assert!(registry.take(pending.req_id).await.is_none());
        assert_eq!(registry.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_quote_ticks_push_snapshots() {
        let registry = RequestRegistry::new();
        let pending = registry.register(RequestKind::Quote).await;
        let tz = chrono_tz::UTC;

        // bid alone has no price to report
        assert!(registry.apply_price(pending.req_id, TickType::Bid, 9.9, tz, now()).await.is_none());
        let first = registry.apply_price(pending.req_id, TickType::Last, 10.0, tz, now()).await.unwrap();
        assert_eq!(first.close, 10.0);
        let second = registry.apply_size(pending.req_id, TickType::Volume, 500, tz, now()).await.unwrap();
        assert_eq!(second.volume, 500);

        let outcome = registry.take(pending.req_id).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records.last(), Some(&second));
    }

    #[tokio::test]
    async fn test_close_all_marks_open_requests() {
        let registry = RequestRegistry::new();
        let finished = registry.register(RequestKind::Historical).await;
        let open = registry.register(RequestKind::Quote).await;
        registry.complete(finished.req_id, Completion::Finished).await;

        assert_eq!(registry.close_all().await, 1);
        assert_eq!(open.done.await.unwrap(), Completion::Closed);

        registry
            .append_bar(open.req_id, Bar::new("20250312 10:00:00", 5.0, 5.0, 5.0, 5.0, 10))
            .await;
        let outcome = registry.take(open.req_id).await.unwrap();
        assert!(matches!(outcome.failure(), Some(GatewayError::Disconnected(_))));
        assert_eq!(outcome.into_records().len(), 1);
    }

    #[test]
    fn test_outcome_into_records() {
        let rejected = RequestOutcome {
            req_id: 4,
            kind: RequestKind::Historical,
            records: vec![Bar::new("20240314", 2.0, 2.5, 1.5, 2.25, 40)],
            completion: Some(Completion::Rejected { code: 200, message: "No security definition".into() }),
        };
        match rejected.failure() {
            Some(GatewayError::RequestRejected { req_id, code, .. }) => {
                assert_eq!(req_id, 4);
                assert_eq!(code, 200);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(rejected.into_records().len(), 1);

        let timed_out = RequestOutcome {
            req_id: 5,
            kind: RequestKind::Quote,
            records: vec![Bar::new("20250312 10:00:00", 1.0, 1.0, 1.0, 1.0, 0)],
            completion: None,
        };
        assert!(timed_out.timed_out());
        assert!(timed_out.failure().is_none());
        assert_eq!(timed_out.into_records().len(), 1);
    }
}
