//! Per-account nonce reservation authority.
//!
//! Chains require contiguous nonces per account, so every outbound
//! transaction claims its sequence number here before signing. The rule for
//! failures is uniform and lives only in [`NonceAuthority::fail`]: a value is
//! eligible for reuse iff its ticket failed without ever being broadcast.

use crate::chain::EndpointPool;
use crate::error::{DispatchError, Result};
use dashmap::DashMap;
use ethers::types::Address;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Reserved,
    Completed,
    Failed,
}

/// A claimed nonce value. Not `Clone`: `complete` and `fail` take the ticket
/// by value, so a reservation resolves at most once by construction.
#[derive(Debug)]
pub struct NonceTicket {
    pub id: Uuid,
    pub account: Address,
    pub value: u64,
    pub state: TicketState,
    pub broadcast: bool,
}

struct AccountNonceState {
    network_nonce: u64,
    next_nonce: u64,
    last_sync: Option<Instant>,
    force_resync: bool,
    pending: HashSet<u64>,
    released: BTreeSet<u64>,
}

impl AccountNonceState {
    fn cold() -> Self {
        Self {
            network_nonce: 0,
            next_nonce: 0,
            last_sync: None,
            force_resync: false,
            pending: HashSet::new(),
            released: BTreeSet::new(),
        }
    }

    fn needs_sync(&self, interval: Duration) -> bool {
        self.force_resync || self.last_sync.map_or(true, |t| t.elapsed() >= interval)
    }
}

/// Issues per-account nonce reservations, synchronized against observed
/// network state. One async mutex per account; the authority never holds one
/// account's lock while touching another.
pub struct NonceAuthority {
    pool: Arc<EndpointPool>,
    states: DashMap<Address, Arc<Mutex<AccountNonceState>>>,
    resync_interval: Duration,
    max_pending_per_account: usize,
    reserved_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    resync_total: AtomicU64,
}

impl NonceAuthority {
    pub fn new(pool: Arc<EndpointPool>, resync_interval: Duration, max_pending: usize) -> Self {
        Self {
            pool,
            states: DashMap::new(),
            resync_interval,
            max_pending_per_account: max_pending,
            reserved_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            resync_total: AtomicU64::new(0),
        }
    }

    fn state_for(&self, account: Address) -> Arc<Mutex<AccountNonceState>> {
        self.states
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(AccountNonceState::cold())))
            .value()
            .clone()
    }

    /// Reserves the next nonce for `account`. Cold start adopts the network
    /// count; later calls periodically resync and self-heal with
    /// `max(local, network)` in case a transaction was sent outside this
    /// process. Released (never-broadcast) values are handed out lowest
    /// first before the counter advances.
    pub async fn reserve(&self, account: Address) -> Result<NonceTicket> {
        let state_arc = self.state_for(account);
        let mut state = state_arc.lock().await;

        if state.needs_sync(self.resync_interval) {
            self.sync_locked(account, &mut state).await?;
        }

        if state.pending.len() >= self.max_pending_per_account {
            return Err(DispatchError::RateLimitTimeout(format!(
                "{} reservations already pending for {:?}",
                state.pending.len(),
                account
            )));
        }

        let value = match state.released.iter().next().copied() {
            Some(v) => {
                state.released.remove(&v);
                v
            }
            None => {
                let v = state.next_nonce;
                state.next_nonce += 1;
                v
            }
        };
        state.pending.insert(value);
        self.reserved_total.fetch_add(1, Ordering::Relaxed);

        let ticket = NonceTicket {
            id: Uuid::new_v4(),
            account,
            value,
            state: TicketState::Reserved,
            broadcast: false,
        };
        debug!("Reserved nonce {} for {:?} (ticket {})", value, account, ticket.id);
        Ok(ticket)
    }

    /// Marks the ticket completed. The value was consumed on-chain, so there
    /// is nothing to do to the counter.
    pub async fn complete(&self, mut ticket: NonceTicket) {
        ticket.state = TicketState::Completed;
        ticket.broadcast = true;
        let state_arc = self.state_for(ticket.account);
        let mut state = state_arc.lock().await;
        state.pending.remove(&ticket.value);
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Completed nonce {} for {:?} (ticket {})",
            ticket.value, ticket.account, ticket.id
        );
    }

    /// Marks the ticket failed. `broadcast = false` means the transaction was
    /// never sent, so the value must be reusable by the very next reserve —
    /// otherwise the gap would stall every later transaction for the account.
    /// `broadcast = true` means the network saw the value; it is consumed for
    /// good. A reason that smells like on-chain nonce disagreement forces a
    /// resync on the next reserve.
    pub async fn fail(&self, mut ticket: NonceTicket, broadcast: bool, reason: &str) {
        ticket.state = TicketState::Failed;
        ticket.broadcast = broadcast;
        let state_arc = self.state_for(ticket.account);
        let mut state = state_arc.lock().await;
        state.pending.remove(&ticket.value);

        if !broadcast {
            state.released.insert(ticket.value);
            // Compact the tail: released values adjacent to the counter just
            // roll it back instead of sitting in the set.
            while let Some(top) = state.released.iter().next_back().copied() {
                if top + 1 == state.next_nonce {
                    state.released.remove(&top);
                    state.next_nonce = top;
                } else {
                    break;
                }
            }
        }

        if reason.to_lowercase().contains("nonce") {
            state.force_resync = true;
            warn!(
                "Nonce disagreement for {:?} ({}); forcing resync",
                ticket.account, reason
            );
        }

        self.failed_total.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Failed nonce {} for {:?} (broadcast={}): {}",
            ticket.value, ticket.account, broadcast, reason
        );
    }

    /// Forces a resync for an account on its next reserve.
    pub async fn mark_stale(&self, account: Address) {
        let state_arc = self.state_for(account);
        state_arc.lock().await.force_resync = true;
    }

    async fn sync_locked(&self, account: Address, state: &mut AccountNonceState) -> Result<()> {
        let client = self.pool.get_connection().await?;
        let network = client.transaction_count(account).await?;

        if state.last_sync.is_none() {
            state.network_nonce = network;
            state.next_nonce = network;
            info!("Adopted network nonce {} for {:?}", network, account);
        } else {
            let old = state.network_nonce;
            state.network_nonce = network;
            if network > state.next_nonce {
                warn!(
                    "Network nonce {} ahead of local {} for {:?}; self-healing",
                    network, state.next_nonce, account
                );
                state.next_nonce = network;
            }
            // Values the chain has already consumed can never be reissued.
            state.released.retain(|v| *v >= network);
            if old != network {
                debug!("Resynced {:?}: network nonce {} -> {}", account, old, network);
            }
        }

        state.force_resync = false;
        state.last_sync = Some(Instant::now());
        self.resync_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn account_stats(&self, account: Address) -> Option<AccountNonceStats> {
        let state_arc = self.states.get(&account)?.value().clone();
        let state = state_arc.lock().await;
        Some(AccountNonceStats {
            network_nonce: state.network_nonce,
            next_nonce: state.next_nonce,
            pending_count: state.pending.len(),
            released_count: state.released.len(),
        })
    }

    pub fn stats(&self) -> NonceStats {
        NonceStats {
            accounts: self.states.len(),
            reserved: self.reserved_total.load(Ordering::Relaxed),
            completed: self.completed_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            resyncs: self.resync_total.load(Ordering::Relaxed),
        }
    }

    /// Total reservations currently unresolved across all accounts. Zero
    /// after a drained shutdown; anything else means a stranded ticket.
    pub async fn pending_total(&self) -> usize {
        let mut total = 0;
        let arcs: Vec<_> = self.states.iter().map(|e| e.value().clone()).collect();
        for state_arc in arcs {
            total += state_arc.lock().await.pending.len();
        }
        total
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountNonceStats {
    pub network_nonce: u64,
    pub next_nonce: u64,
    pub pending_count: usize,
    pub released_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NonceStats {
    pub accounts: usize,
    pub reserved: u64,
    pub completed: u64,
    pub failed: u64,
    pub resyncs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_pool, MockChainClient};
    use pretty_assertions::assert_eq;

    fn test_account() -> Address {
        Address::from_low_u64_be(0xdead)
    }

    fn authority_with(client: MockChainClient, resync: Duration) -> NonceAuthority {
        NonceAuthority::new(Arc::new(mock_pool(client)), resync, 20)
    }

    #[tokio::test]
    async fn adopts_network_count_at_cold_start() {
        let client = MockChainClient::new("http://a").with_transaction_count(5);
        let authority = authority_with(client, Duration::from_secs(3600));
        let account = test_account();

        let t1 = authority.reserve(account).await.unwrap();
        let t2 = authority.reserve(account).await.unwrap();
        assert_eq!(t1.value, 5);
        assert_eq!(t2.value, 6);
    }

    #[tokio::test]
    async fn concurrent_reserves_are_distinct_and_contiguous() {
        let client = MockChainClient::new("http://a").with_transaction_count(100);
        let authority = Arc::new(authority_with(client, Duration::from_secs(3600)));
        let account = test_account();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let authority = authority.clone();
            handles.push(tokio::spawn(
                async move { authority.reserve(account).await },
            ));
        }

        let mut values: Vec<u64> = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap().value);
        }
        values.sort_unstable();
        assert_eq!(values, (100..110).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unbroadcast_failure_releases_value_for_next_reserve() {
        let client = MockChainClient::new("http://a").with_transaction_count(5);
        let authority = authority_with(client, Duration::from_secs(3600));
        let account = test_account();

        let t5 = authority.reserve(account).await.unwrap();
        let t6 = authority.reserve(account).await.unwrap();
        assert_eq!((t5.value, t6.value), (5, 6));

        authority.fail(t6, false, "signing failed").await;
        let again = authority.reserve(account).await.unwrap();
        assert_eq!(again.value, 6);

        // t5 is still reserved; nothing was stranded or duplicated.
        let stats = authority.account_stats(account).await.unwrap();
        assert_eq!(stats.pending_count, 2);
    }

    #[tokio::test]
    async fn broadcast_failure_consumes_value_permanently() {
        let client = MockChainClient::new("http://a").with_transaction_count(5);
        let authority = authority_with(client, Duration::from_secs(3600));
        let account = test_account();

        let t5 = authority.reserve(account).await.unwrap();
        authority.fail(t5, true, "reverted on-chain").await;

        let next = authority.reserve(account).await.unwrap();
        assert_eq!(next.value, 6);
    }

    #[tokio::test]
    async fn released_values_hand_out_lowest_first() {
        let client = MockChainClient::new("http://a").with_transaction_count(0);
        let authority = authority_with(client, Duration::from_secs(3600));
        let account = test_account();

        let t0 = authority.reserve(account).await.unwrap();
        let t1 = authority.reserve(account).await.unwrap();
        let _t2 = authority.reserve(account).await.unwrap();

        // Fail the middle and the low one out of order; reserve must return
        // 0 then 1, not whatever failed last.
        authority.fail(t1, false, "never sent").await;
        authority.fail(t0, false, "never sent").await;

        assert_eq!(authority.reserve(account).await.unwrap().value, 0);
        assert_eq!(authority.reserve(account).await.unwrap().value, 1);
    }

    #[tokio::test]
    async fn resync_self_heals_external_sends() {
        let client = MockChainClient::new("http://a").with_transaction_count(5);
        let authority = authority_with(client.clone(), Duration::from_millis(0));
        let account = test_account();

        let t5 = authority.reserve(account).await.unwrap();
        assert_eq!(t5.value, 5);

        // Something outside this process pushed the account to 10.
        client.set_transaction_count(10);
        let next = authority.reserve(account).await.unwrap();
        assert_eq!(next.value, 10);
    }
}
