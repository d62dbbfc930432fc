//! Blank node allocation.
//!
//! Blank node identifiers are minted by the server in batches and handed out
//! locally, so allocating N identifiers costs `ceil(N / batch)` round trips.
//! Each logical connection owns one allocator; buffers are never shared
//! between connections.

use crate::error::{SessionError, SessionResult};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Shape of a server-minted identifier: `b` + 8 hex digits + `x` + counter
fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^b[0-9A-Fa-f]{8}x\d+$").ok())
        .as_ref()
}

/// A server-minted blank node identifier (without the `_:` prefix)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlankNode(String);

impl BlankNode {
    /// Parse one identifier as returned by the server, with or without `_:`
    pub fn parse(raw: &str) -> SessionResult<Self> {
        let id = raw.trim();
        let id = id.strip_prefix("_:").unwrap_or(id);
        if id_pattern().is_some_and(|pattern| pattern.is_match(id)) {
            Ok(BlankNode(id.to_string()))
        } else {
            Err(SessionError::TransportFailure {
                endpoint: "blankNodes".to_string(),
                message: format!("malformed blank node id '{raw}'"),
            })
        }
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlankNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_:{}", self.0)
    }
}

/// Buffered blank node source for one connection
#[derive(Debug)]
pub struct BlankNodeAllocator {
    buffer: Mutex<VecDeque<BlankNode>>,
    batch_size: AtomicUsize,
    refills: AtomicU64,
    issued: AtomicU64,
}

impl BlankNodeAllocator {
    pub fn new(batch_size: usize) -> Self {
        BlankNodeAllocator {
            buffer: Mutex::new(VecDeque::new()),
            batch_size: AtomicUsize::new(batch_size.max(1)),
            refills: AtomicU64::new(0),
            issued: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::SeqCst)
    }

    /// Applies from the next refill; buffered ids are kept
    pub fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size.max(1), Ordering::SeqCst);
    }

    /// Ids fetched but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Server round trips made so far
    pub fn refills(&self) -> u64 {
        self.refills.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Hand out one identifier, refilling through `fetch` when the buffer is
    /// empty. `fetch(n)` must return exactly `n` raw ids.
    ///
    /// The buffer lock is held across the refill, so concurrent callers on
    /// the same connection wait for one round trip instead of racing.
    pub fn allocate<F>(&self, fetch: F) -> SessionResult<BlankNode>
    where
        F: FnOnce(usize) -> SessionResult<Vec<String>>,
    {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            let amount = self.batch_size();
            let raw = fetch(amount)?;
            if raw.len() != amount {
                return Err(SessionError::TransportFailure {
                    endpoint: "blankNodes".to_string(),
                    message: format!("requested {amount} blank nodes, got {}", raw.len()),
                });
            }
            let batch = raw
                .iter()
                .map(|id| BlankNode::parse(id))
                .collect::<SessionResult<Vec<_>>>()?;
            self.refills.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(amount, "blank_node_batch_fetched");
            buffer.extend(batch);
        }
        let node = buffer.pop_front().ok_or_else(|| SessionError::TransportFailure {
            endpoint: "blankNodes".to_string(),
            message: "empty blank node batch".to_string(),
        })?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(node)
    }

    /// Drop buffered ids; used when the connection's identity changes
    pub fn discard(&self) {
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn minting(counter: &AtomicU64) -> impl FnOnce(usize) -> SessionResult<Vec<String>> + '_ {
        move |n| {
            Ok((0..n)
                .map(|_| format!("_:b0A1B2C3Dx{}", counter.fetch_add(1, Ordering::SeqCst)))
                .collect())
        }
    }

    #[test]
    fn test_parse_accepts_server_shape() {
        let node = BlankNode::parse("_:b1234abcdx17").unwrap();
        assert_eq!(node.id(), "b1234abcdx17");
        assert_eq!(node.to_string(), "_:b1234abcdx17");
        assert!(BlankNode::parse("b1234ABCDx0").is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for raw in ["", "_:x", "b123x1", "b1234abcdx", "c1234abcdx1", "b1234abcgx1"] {
            assert!(BlankNode::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_one_round_trip_per_batch() {
        let counter = AtomicU64::new(0);
        let allocator = BlankNodeAllocator::new(10);
        for _ in 0..10 {
            allocator.allocate(minting(&counter)).unwrap();
        }
        assert_eq!(allocator.refills(), 1);
        allocator.allocate(minting(&counter)).unwrap();
        assert_eq!(allocator.refills(), 2);
        assert_eq!(allocator.buffered(), 9);
    }

    #[test]
    fn test_batch_size_change_applies_to_next_refill() {
        let counter = AtomicU64::new(0);
        let allocator = BlankNodeAllocator::new(4);
        allocator.allocate(minting(&counter)).unwrap();
        allocator.set_batch_size(2);
        assert_eq!(allocator.buffered(), 3);
        for _ in 0..3 {
            allocator.allocate(minting(&counter)).unwrap();
        }
        assert_eq!(allocator.refills(), 1);
        allocator.allocate(minting(&counter)).unwrap();
        assert_eq!(allocator.refills(), 2);
        assert_eq!(allocator.buffered(), 1);
    }

    #[test]
    fn test_short_batch_is_an_error() {
        let allocator = BlankNodeAllocator::new(3);
        let err = allocator
            .allocate(|_| Ok(vec!["_:b00000000x1".to_string()]))
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportFailure { .. }));
        assert_eq!(allocator.buffered(), 0);
    }

    #[test]
    fn test_concurrent_allocation_never_repeats() {
        let counter = Arc::new(AtomicU64::new(0));
        let allocator = Arc::new(BlankNodeAllocator::new(7));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| allocator.allocate(minting(&counter)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for node in handle.join().unwrap() {
                assert!(seen.insert(node));
            }
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(allocator.issued(), 200);
    }
}
