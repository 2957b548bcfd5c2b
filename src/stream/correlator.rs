//! Request/reply correlation for `findmany` searches.
//!
//! Each search gets a `search-<n>` id from a per-client counter. The reply
//! handle is parked in a map until the matching reply arrives or its deadline
//! passes, whichever comes first.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::stream::normalize::normalize_record;

const SEARCH_ID_PREFIX: &str = "search-";

/// Outcome delivered to a search caller.
pub type SearchResult = Result<Vec<Value>, SearchError>;

/// Reasons a search resolves without records.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    /// No reply arrived before the search deadline.
    #[error("search {msg_id} timed out")]
    Timeout { msg_id: String },

    /// The service answered with a non-ok acknowledgement.
    #[error("search {msg_id} rejected: {message}")]
    Rejected { msg_id: String, message: String },

    /// The connection worker stopped before the search completed.
    #[error("connection closed before the search completed")]
    ConnectionClosed,
}

struct PendingSearch {
    reply: oneshot::Sender<SearchResult>,
    expires_at: Option<Instant>,
}

pub struct MessageCorrelator {
    next_search_id: u64,
    timeout: Option<Duration>,
    pending: HashMap<String, PendingSearch>,
}

impl MessageCorrelator {
    /// Creates a correlator whose entries expire after `timeout`.
    ///
    /// `None` keeps entries until a reply arrives.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            next_search_id: 0,
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Returns the next search id. Ids are never reused by one correlator.
    pub fn next_msg_id(&mut self) -> String {
        self.next_search_id += 1;
        format!("{SEARCH_ID_PREFIX}{}", self.next_search_id)
    }

    /// Parks `reply` under `msg_id`.
    ///
    /// The deadline runs from `issued_at`, when the caller asked for the search,
    /// not from registration.
    pub fn register(
        &mut self,
        msg_id: String,
        reply: oneshot::Sender<SearchResult>,
        issued_at: Instant,
    ) {
        let expires_at = self.deadline_from(issued_at);
        self.pending
            .insert(msg_id, PendingSearch { reply, expires_at });
    }

    /// Deadline for a search issued at `issued_at`.
    ///
    /// `None` when searches never expire or the deadline is not representable.
    pub fn deadline_from(&self, issued_at: Instant) -> Option<Instant> {
        self.timeout.and_then(|timeout| issued_at.checked_add(timeout))
    }

    pub fn is_expired(&self, issued_at: Instant, now: Instant) -> bool {
        self.deadline_from(issued_at).is_some_and(|at| at <= now)
    }

    /// Times out a search that expired before it could be written.
    ///
    /// The search still consumes an id so the error names it uniquely.
    pub fn expire_unsent(&mut self, reply: oneshot::Sender<SearchResult>) -> String {
        let msg_id = self.next_msg_id();
        let _ = reply.send(Err(SearchError::Timeout {
            msg_id: msg_id.clone(),
        }));
        msg_id
    }

    /// Completes the search registered under `msg_id`.
    ///
    /// Records are normalized before delivery. Returns `false` and changes
    /// nothing when no search is pending under that id.
    pub fn resolve(&mut self, msg_id: &str, body: Result<Vec<Value>, String>) -> bool {
        let Some(pending) = self.pending.remove(msg_id) else {
            return false;
        };

        let result = match body {
            Ok(records) => Ok(records.iter().map(normalize_record).collect()),
            Err(message) => Err(SearchError::Rejected {
                msg_id: msg_id.to_string(),
                message,
            }),
        };
        if pending.reply.send(result).is_err() {
            debug!(event = "search_caller_gone", msg_id);
        }
        true
    }

    /// Rejects every pending search whose deadline is at or before `now`.
    ///
    /// Returns the number of expired searches.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.expires_at.is_some_and(|at| at <= now))
            .map(|(msg_id, _)| msg_id.clone())
            .collect();

        for msg_id in &expired {
            if let Some(pending) = self.pending.remove(msg_id) {
                let _ = pending.reply.send(Err(SearchError::Timeout {
                    msg_id: msg_id.clone(),
                }));
            }
        }
        expired.len()
    }

    #[cfg(test)]
    fn is_pending(&self, msg_id: &str) -> bool {
        self.pending.contains_key(msg_id)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    use super::{MessageCorrelator, SearchError};

    fn record(n: i64) -> serde_json::Value {
        json!({"elems": {"n": {"type": "integer", "value": n}}, "creationDate": n})
    }

    #[test]
    fn search_ids_are_monotonic() {
        let mut correlator = MessageCorrelator::new(None);
        assert_eq!(correlator.next_msg_id(), "search-1");
        assert_eq!(correlator.next_msg_id(), "search-2");
        assert_eq!(correlator.next_msg_id(), "search-3");
    }

    #[test]
    fn replies_resolve_their_own_search_once() {
        let mut correlator = MessageCorrelator::new(None);
        let first_id = correlator.next_msg_id();
        let second_id = correlator.next_msg_id();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        correlator.register(first_id.clone(), first_tx, Instant::now());
        correlator.register(second_id.clone(), second_tx, Instant::now());

        assert!(correlator.resolve(&second_id, Ok(vec![record(2)])));
        assert!(correlator.resolve(&first_id, Ok(vec![record(1), record(11)])));
        assert!(!correlator.resolve(&first_id, Ok(vec![record(99)])));

        assert_eq!(
            first_rx.try_recv().expect("first resolved"),
            Ok(vec![
                json!({"n": 1, "creationDate": 1}),
                json!({"n": 11, "creationDate": 11})
            ])
        );
        assert_eq!(
            second_rx.try_recv().expect("second resolved"),
            Ok(vec![json!({"n": 2, "creationDate": 2})])
        );
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn unmatched_reply_is_ignored() {
        let mut correlator = MessageCorrelator::new(None);
        let msg_id = correlator.next_msg_id();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(msg_id.clone(), tx, Instant::now());

        assert!(!correlator.resolve("search-404", Ok(vec![record(1)])));
        assert!(correlator.is_pending(&msg_id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejected_reply_surfaces_server_message() {
        let mut correlator = MessageCorrelator::new(None);
        let msg_id = correlator.next_msg_id();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(msg_id.clone(), tx, Instant::now());

        correlator.resolve(&msg_id, Err("bad filter".to_string()));

        assert_eq!(
            rx.try_recv().expect("resolved"),
            Err(SearchError::Rejected {
                msg_id,
                message: "bad filter".to_string()
            })
        );
    }

    #[test]
    fn reply_after_caller_dropped_still_clears_entry() {
        let mut correlator = MessageCorrelator::new(None);
        let msg_id = correlator.next_msg_id();
        let (tx, rx) = oneshot::channel();
        correlator.register(msg_id.clone(), tx, Instant::now());
        drop(rx);

        assert!(correlator.resolve(&msg_id, Ok(Vec::new())));
        assert!(!correlator.is_pending(&msg_id));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_rejects_only_expired_searches() {
        let mut correlator = MessageCorrelator::new(Some(Duration::from_secs(5)));
        let old_id = correlator.next_msg_id();
        let (old_tx, mut old_rx) = oneshot::channel();
        correlator.register(old_id.clone(), old_tx, Instant::now());

        tokio::time::advance(Duration::from_secs(3)).await;
        let new_id = correlator.next_msg_id();
        let (new_tx, mut new_rx) = oneshot::channel();
        correlator.register(new_id.clone(), new_tx, Instant::now());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(correlator.sweep_expired(Instant::now()), 1);

        assert_eq!(
            old_rx.try_recv().expect("expired"),
            Err(SearchError::Timeout { msg_id: old_id.clone() })
        );
        assert!(new_rx.try_recv().is_err());
        assert!(correlator.is_pending(&new_id));
        assert!(!correlator.resolve(&old_id, Ok(Vec::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_from_issue_time() {
        let mut correlator = MessageCorrelator::new(Some(Duration::from_secs(5)));
        let issued_at = Instant::now();
        tokio::time::advance(Duration::from_secs(4)).await;

        let msg_id = correlator.next_msg_id();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(msg_id.clone(), tx, issued_at);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(correlator.sweep_expired(Instant::now()), 1);
        assert_eq!(
            rx.try_recv().expect("expired"),
            Err(SearchError::Timeout { msg_id })
        );
    }

    #[test]
    fn unsent_search_expires_with_fresh_id() {
        let mut correlator = MessageCorrelator::new(Some(Duration::from_millis(100)));
        let issued_at = Instant::now();
        assert!(!correlator.is_expired(issued_at, issued_at));
        assert!(correlator.is_expired(issued_at, issued_at + Duration::from_millis(100)));

        assert_eq!(correlator.next_msg_id(), "search-1");
        let (tx, mut rx) = oneshot::channel();
        assert_eq!(correlator.expire_unsent(tx), "search-2");
        assert_eq!(
            rx.try_recv().expect("expired"),
            Err(SearchError::Timeout {
                msg_id: "search-2".to_string()
            })
        );
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let mut correlator = MessageCorrelator::new(Some(Duration::MAX));
        let now = Instant::now();
        assert_eq!(correlator.deadline_from(now), None);

        let msg_id = correlator.next_msg_id();
        let (tx, _rx) = oneshot::channel();
        correlator.register(msg_id.clone(), tx, now);
        assert_eq!(correlator.sweep_expired(now + Duration::from_secs(86_400)), 0);
        assert!(correlator.is_pending(&msg_id));
    }

    #[test]
    fn without_timeout_nothing_expires() {
        let mut correlator = MessageCorrelator::new(None);
        let msg_id = correlator.next_msg_id();
        let (tx, _rx) = oneshot::channel();
        correlator.register(msg_id.clone(), tx, Instant::now());

        assert_eq!(
            correlator.sweep_expired(Instant::now() + Duration::from_secs(86_400)),
            0
        );
        assert!(correlator.is_pending(&msg_id));
    }
}
