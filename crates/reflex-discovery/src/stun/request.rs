//! STUN transaction engine.
//!
//! [`StunRequestManager`] owns every in-flight request, retransmits on an
//! exponential schedule and correlates responses by transaction id. It never
//! touches a socket or a clock: datagrams go out through a [`RequestHost`]
//! and time is whatever `now` the caller passes in.

use super::message::{StunMessage, StunMessageClass, TransactionId, peek_transaction_id};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Retransmission schedule for a STUN transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitConfig {
    /// Wait after the first send
    pub initial_interval: Duration,
    /// Ceiling for the doubling wait
    pub max_interval: Duration,
    /// Resends after the first send before giving up
    pub max_retransmissions: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1600),
            max_retransmissions: 8,
        }
    }
}

impl RetransmitConfig {
    /// Set the initial wait
    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the wait ceiling
    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the resend limit
    #[must_use]
    pub fn with_max_retransmissions(mut self, count: u32) -> Self {
        self.max_retransmissions = count;
        self
    }

    /// Wait after the `sends`-th send: `min(initial * 2^(sends-1), max)`
    #[must_use]
    pub fn wait_after(&self, sends: u32) -> Duration {
        let shift = sends.saturating_sub(1).min(31);
        self.initial_interval
            .saturating_mul(1u32 << shift)
            .min(self.max_interval)
    }

    /// Time from the first send until the transaction times out
    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        (1..=self.max_retransmissions.saturating_add(1))
            .map(|sends| self.wait_after(sends))
            .sum()
    }
}

/// Terminal result of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Success response
    Success(StunMessage),
    /// Error response
    ErrorResponse(StunMessage),
    /// No response after the last retransmission
    Timeout,
}

/// What the manager may do to its owner
pub trait RequestHost<T> {
    /// Put `data` on the wire towards `dest`
    fn send_raw(&mut self, dest: SocketAddr, data: &[u8]);

    /// A transaction finished. It has already left the manager.
    fn on_outcome(&mut self, id: TransactionId, tag: T, outcome: RequestOutcome);
}

struct Transaction<T> {
    dest: SocketAddr,
    payload: Vec<u8>,
    tag: T,
    /// Copies put on the wire so far; 0 while a delayed send is pending
    sends: u32,
    deadline: Instant,
}

type IdSource = Box<dyn FnMut() -> TransactionId + Send>;

/// In-flight STUN transactions, tagged with caller data `T`
pub struct StunRequestManager<T> {
    transactions: HashMap<TransactionId, Transaction<T>>,
    config: RetransmitConfig,
    id_source: IdSource,
}

impl<T> StunRequestManager<T> {
    /// Create a manager using `config` for every transaction
    #[must_use]
    pub fn new(config: RetransmitConfig) -> Self {
        Self::with_id_source(config, TransactionId::random)
    }

    /// Create a manager drawing transaction ids from `source`.
    ///
    /// Ids that collide with a pending transaction are discarded and drawn
    /// again, so `source` must eventually yield a free id.
    #[must_use]
    pub fn with_id_source(
        config: RetransmitConfig,
        source: impl FnMut() -> TransactionId + Send + 'static,
    ) -> Self {
        Self {
            transactions: HashMap::new(),
            config,
            id_source: Box::new(source),
        }
    }

    /// Retransmission schedule
    #[must_use]
    pub fn config(&self) -> &RetransmitConfig {
        &self.config
    }

    fn allocate_id(&mut self) -> TransactionId {
        loop {
            let id = (self.id_source)();
            if !self.transactions.contains_key(&id) {
                return id;
            }
            tracing::trace!("Transaction id {} already pending, drawing again", id);
        }
    }

    fn insert(
        &mut self,
        dest: SocketAddr,
        mut request: StunMessage,
        tag: T,
        sends: u32,
        deadline: Instant,
    ) -> (TransactionId, &Transaction<T>) {
        let id = self.allocate_id();
        request.transaction_id = id;
        let txn = self.transactions.entry(id).or_insert(Transaction {
            dest,
            payload: request.encode(),
            tag,
            sends,
            deadline,
        });
        (id, txn)
    }

    /// Start a transaction and send the first copy immediately.
    ///
    /// The transaction id of `request` is replaced with a fresh one, which
    /// is returned.
    pub fn send(
        &mut self,
        dest: SocketAddr,
        request: StunMessage,
        tag: T,
        now: Instant,
        host: &mut impl RequestHost<T>,
    ) -> TransactionId {
        let deadline = now + self.config.wait_after(1);
        let (id, txn) = self.insert(dest, request, tag, 1, deadline);
        tracing::debug!("Sending STUN binding request {} to {}", id, dest);
        host.send_raw(dest, &txn.payload);
        id
    }

    /// Start a transaction whose first copy goes out after `delay`
    pub fn send_delayed(
        &mut self,
        dest: SocketAddr,
        request: StunMessage,
        tag: T,
        delay: Duration,
        now: Instant,
    ) -> TransactionId {
        let (id, _) = self.insert(dest, request, tag, 0, now + delay);
        tracing::trace!("Scheduled STUN request {} to {} in {:?}", id, dest, delay);
        id
    }

    /// Offer a received datagram.
    ///
    /// Returns `true` when the datagram carries the id of a pending
    /// transaction and was consumed. A matching response ends the
    /// transaction and reports its outcome; a matching datagram that fails
    /// to decode is dropped and the transaction keeps its schedule.
    pub fn check_response(&mut self, data: &[u8], host: &mut impl RequestHost<T>) -> bool {
        let Some(id) = peek_transaction_id(data) else {
            return false;
        };
        if !self.transactions.contains_key(&id) {
            return false;
        }

        let msg = match StunMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Dropping malformed response to {}: {}", id, e);
                return true;
            }
        };
        if !msg.message_class.is_response() {
            return false;
        }

        let Some(txn) = self.transactions.remove(&id) else {
            return false;
        };
        let outcome = match msg.message_class {
            StunMessageClass::ErrorResponse => RequestOutcome::ErrorResponse(msg),
            _ => RequestOutcome::Success(msg),
        };
        tracing::trace!(
            "Transaction {} answered after {} sends",
            id,
            txn.sends
        );
        host.on_outcome(id, txn.tag, outcome);
        true
    }

    /// Fire every timer due at `now`: first sends, retransmissions and
    /// timeouts
    pub fn handle_timeout(&mut self, now: Instant, host: &mut impl RequestHost<T>) {
        let mut due: Vec<(Instant, TransactionId)> = self
            .transactions
            .iter()
            .filter(|(_, txn)| txn.deadline <= now)
            .map(|(id, txn)| (txn.deadline, *id))
            .collect();
        due.sort();

        let attempts = self.config.max_retransmissions.saturating_add(1);
        for (_, id) in due {
            let Some(txn) = self.transactions.get_mut(&id) else {
                continue;
            };

            if txn.sends >= attempts {
                if let Some(txn) = self.transactions.remove(&id) {
                    tracing::warn!(
                        "STUN request {} to {} timed out after {} sends",
                        id,
                        txn.dest,
                        txn.sends
                    );
                    host.on_outcome(id, txn.tag, RequestOutcome::Timeout);
                }
                continue;
            }

            txn.sends += 1;
            txn.deadline = now + self.config.wait_after(txn.sends);
            if txn.sends == 1 {
                tracing::debug!("Sending STUN binding request {} to {}", id, txn.dest);
            } else {
                tracing::trace!(
                    "Retransmitting {} to {} (send {})",
                    id,
                    txn.dest,
                    txn.sends
                );
            }
            host.send_raw(txn.dest, &txn.payload);
        }
    }

    /// Earliest pending deadline
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.transactions.values().map(|txn| txn.deadline).min()
    }

    /// Drop a pending transaction without reporting an outcome
    pub fn cancel(&mut self, id: TransactionId) -> bool {
        self.transactions.remove(&id).is_some()
    }

    /// Drop every pending transaction without reporting outcomes
    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    /// `id` is pending
    #[must_use]
    pub fn contains(&self, id: TransactionId) -> bool {
        self.transactions.contains_key(&id)
    }

    /// Pending transaction count
    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// No transaction pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Resends so far for a pending transaction
    #[must_use]
    pub fn retransmissions(&self, id: TransactionId) -> Option<u32> {
        self.transactions
            .get(&id)
            .map(|txn| txn.sends.saturating_sub(1))
    }

    /// Tag of a pending transaction
    #[must_use]
    pub fn tag(&self, id: TransactionId) -> Option<&T> {
        self.transactions.get(&id).map(|txn| &txn.tag)
    }
}

impl<T> fmt::Debug for StunRequestManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StunRequestManager")
            .field("pending", &self.transactions.len())
            .field("config", &self.config)
            .finish()
    }
}
