use crate::constants::{
    CREDENTIAL_FRESH_MAX_AGE_SECS, CREDENTIAL_HARD_EXPIRY_SECS, REAUTH_HEADER,
};
use crate::types::{PeriscopeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// A captured authenticated-session snapshot: everything needed to replay one
/// backend call. Validated once, at the pool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Harvest {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookie: Option<String>,
    pub url: String,
    pub body: serde_json::Value,
}

impl Harvest {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(PeriscopeError::InvalidHarvest("harvest url is empty".into()).into());
        }
        if !self.body.is_object() {
            return Err(PeriscopeError::InvalidHarvest(
                "harvest body template must be a JSON object".into(),
            )
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Empty,
    Active,
    Expired,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSlot {
    pub slot_id: usize,
    pub harvest: Option<Harvest>,
    /// Unix seconds at capture time
    pub timestamp: f64,
    pub version: u64,
    pub status: SlotStatus,
    pub last_used: f64,
    pub use_count: u64,
}

impl CredentialSlot {
    fn empty(slot_id: usize) -> Self {
        Self {
            slot_id,
            harvest: None,
            timestamp: 0.0,
            version: 0,
            status: SlotStatus::Empty,
            last_used: 0.0,
            use_count: 0,
        }
    }

    pub fn age_seconds(&self) -> f64 {
        now_unix() - self.timestamp
    }

    pub fn is_healthy(&self, max_age_secs: u64) -> bool {
        self.status == SlotStatus::Active
            && self.harvest.is_some()
            && self.age_seconds() < max_age_secs as f64
    }
}

/// A credential handed to one request, with the pool version at issue time so
/// the orchestrator can verify a refresh actually produced something newer.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub slot_id: usize,
    pub version: u64,
    pub age_seconds: f64,
    pub harvest: Harvest,
}

#[derive(Serialize, Deserialize)]
struct PoolSnapshot {
    pool: Vec<CredentialSlot>,
    rotation_cursor: usize,
    active_slot: Option<usize>,
    pool_version: u64,
    timestamp: f64,
}

struct PoolState {
    slots: Vec<CredentialSlot>,
    /// Next slot to overwrite
    rotation_cursor: usize,
    /// Most recently written slot
    active_slot: Option<usize>,
    pool_version: u64,
    refresh_in_flight: bool,
}

struct Waiter {
    token: u64,
    caller_id: String,
    tx: oneshot::Sender<()>,
}

/// The waiter queue lives behind its own synchronous lock so a cancelled
/// wait can still remove its entry from a Drop impl.
type WaiterQueue = std::sync::Mutex<Vec<Waiter>>;

fn lock_waiters(queue: &WaiterQueue) -> std::sync::MutexGuard<'_, Vec<Waiter>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct WaiterGuard<'a> {
    queue: &'a WaiterQueue,
    token: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock_waiters(self.queue).retain(|w| w.token != self.token);
    }
}

impl PoolState {
    fn best_slot_index(&self) -> Option<usize> {
        // Freshest healthy slot first, then freshest active-but-stale slot.
        let healthy = self
            .slots
            .iter()
            .filter(|s| s.is_healthy(CREDENTIAL_FRESH_MAX_AGE_SECS))
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        if let Some(slot) = healthy {
            return Some(slot.slot_id);
        }

        let stale = self
            .slots
            .iter()
            .filter(|s| s.status == SlotStatus::Active && s.harvest.is_some())
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        if let Some(slot) = stale {
            tracing::warn!(
                "[POOL] All credentials past freshness window, using slot {} (age {:.0}s)",
                slot.slot_id,
                slot.age_seconds()
            );
            return Some(slot.slot_id);
        }
        None
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            pool: self.slots.clone(),
            rotation_cursor: self.rotation_cursor,
            active_slot: self.active_slot,
            pool_version: self.pool_version,
            timestamp: now_unix(),
        }
    }
}

/// Per-slot status line for the health endpoint.
#[derive(Debug, Serialize)]
pub struct SlotReport {
    pub slot_id: usize,
    pub status: SlotStatus,
    pub version: u64,
    pub age_seconds: u64,
    pub use_count: u64,
    pub is_healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct PoolReport {
    pub pool_size: usize,
    pub rotation_cursor: usize,
    pub active_slot: Option<usize>,
    pub pool_version: u64,
    pub queue_length: usize,
    pub is_refreshing: bool,
    pub slots: Vec<SlotReport>,
}

/// Shared store of harvested sessions. All mutations happen under one lock;
/// waiters are single-shot and cleaned up by whichever side fires first.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    waiters: WaiterQueue,
    waiter_seq: std::sync::atomic::AtomicU64,
    snapshot_path: PathBuf,
    pool_size: usize,
}

impl CredentialPool {
    pub fn new(snapshot_path: impl Into<PathBuf>, pool_size: usize) -> Self {
        let slots = (0..pool_size).map(CredentialSlot::empty).collect();
        Self {
            state: Mutex::new(PoolState {
                slots,
                rotation_cursor: 0,
                active_slot: None,
                pool_version: 0,
                refresh_in_flight: false,
            }),
            waiters: std::sync::Mutex::new(Vec::new()),
            waiter_seq: std::sync::atomic::AtomicU64::new(0),
            snapshot_path: snapshot_path.into(),
            pool_size,
        }
    }

    /// Wakes every queued waiter exactly once and clears the queue.
    fn notify_waiters(&self) {
        let drained: Vec<Waiter> = lock_waiters(&self.waiters).drain(..).collect();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        for waiter in drained {
            tracing::debug!("[POOL] [{}] waking", waiter.caller_id);
            let _ = waiter.tx.send(());
        }
        tracing::info!("[POOL] Notified {} waiting request(s)", count);
    }

    /// Loads a persisted snapshot if one exists; otherwise starts empty.
    pub async fn load_or_default(snapshot_path: impl Into<PathBuf>, pool_size: usize) -> Self {
        let pool = Self::new(snapshot_path, pool_size);
        match tokio::fs::read_to_string(&pool.snapshot_path).await {
            Ok(raw) => match serde_json::from_str::<PoolSnapshot>(&raw) {
                Ok(snapshot) => {
                    let mut state = pool.state.lock().await;
                    for slot in snapshot.pool {
                        if slot.slot_id < pool_size {
                            let idx = slot.slot_id;
                            state.slots[idx] = slot;
                        }
                    }
                    state.rotation_cursor = snapshot.rotation_cursor % pool_size;
                    state.active_slot = snapshot.active_slot.filter(|s| *s < pool_size);
                    state.pool_version = snapshot.pool_version;
                    let active = state
                        .slots
                        .iter()
                        .filter(|s| s.status == SlotStatus::Active)
                        .count();
                    tracing::info!(
                        "[POOL] Loaded snapshot: {}/{} active credential(s), v{}",
                        active,
                        pool_size,
                        state.pool_version
                    );
                }
                Err(e) => {
                    tracing::warn!("[POOL] Snapshot unreadable, starting empty: {}", e);
                }
            },
            Err(_) => {
                tracing::info!("[POOL] No saved snapshot found");
            }
        }
        pool
    }

    /// Accepts a freshly harvested session: overwrites the slot at the
    /// rotation cursor, bumps the pool version, advances the cursor, persists
    /// a snapshot, and wakes every queued waiter exactly once.
    pub async fn submit(&self, harvest: Harvest) -> Result<u64> {
        harvest.validate()?;
        let snapshot = {
            let mut state = self.state.lock().await;
            let slot_id = state.rotation_cursor;
            let replaced_version = state.slots[slot_id].version;
            state.pool_version += 1;
            let version = state.pool_version;
            state.slots[slot_id] = CredentialSlot {
                slot_id,
                harvest: Some(harvest),
                timestamp: now_unix(),
                version,
                status: SlotStatus::Active,
                last_used: 0.0,
                use_count: 0,
            };
            state.active_slot = Some(slot_id);
            state.rotation_cursor = (slot_id + 1) % self.pool_size;
            state.refresh_in_flight = false;

            if replaced_version > 0 {
                tracing::info!(
                    "[POOL] Replaced slot {} (was v{}) -> v{}",
                    slot_id,
                    replaced_version,
                    version
                );
            } else {
                tracing::info!("[POOL] Captured credential into slot {} (v{})", slot_id, version);
            }

            state.snapshot()
        };
        self.notify_waiters();
        self.persist(&snapshot).await;
        Ok(snapshot.pool_version)
    }

    /// Rotates the short-lived auth token on the active slot without a full
    /// re-harvest. No-op when the pool has never been populated.
    pub async fn update_token(&self, token: &str) -> Result<u64> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let active = match state.active_slot {
                Some(idx) => idx,
                None => {
                    return Err(PeriscopeError::NoCredential(
                        "token update with no active credential".into(),
                    )
                    .into());
                }
            };
            state.pool_version += 1;
            let version = state.pool_version;
            let slot = &mut state.slots[active];
            match slot.harvest.as_mut() {
                Some(harvest) => {
                    let wrapped = serde_json::to_string(&vec![token])
                        .map_err(PeriscopeError::Serialization)?;
                    harvest.headers.insert(REAUTH_HEADER.to_string(), wrapped);
                    slot.timestamp = now_unix();
                    slot.version = version;
                }
                None => {
                    return Err(PeriscopeError::NoCredential(
                        "active slot has no harvest".into(),
                    )
                    .into());
                }
            }
            tracing::info!("[POOL] Token rotated on slot {} (v{})", active, version);
            state.refresh_in_flight = false;
            state.snapshot()
        };
        self.notify_waiters();
        self.persist(&snapshot).await;
        Ok(snapshot.pool_version)
    }

    /// Picks the freshest healthy credential, falling back to the freshest
    /// active-but-stale one. Updates usage counters only.
    pub async fn acquire_best(&self) -> Option<IssuedCredential> {
        let mut state = self.state.lock().await;
        let idx = state.best_slot_index()?;
        let version = state.pool_version;
        let slot = &mut state.slots[idx];
        slot.last_used = now_unix();
        slot.use_count += 1;
        Some(IssuedCredential {
            slot_id: idx,
            version,
            age_seconds: slot.age_seconds(),
            harvest: slot.harvest.clone()?,
        })
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.pool_version
    }

    /// True when no credential is usable for a request right now: pool empty,
    /// or the best slot older than the hard expiry ceiling.
    pub async fn needs_refresh(&self) -> bool {
        let state = self.state.lock().await;
        match state.best_slot_index() {
            Some(idx) => {
                state.slots[idx].age_seconds() > CREDENTIAL_HARD_EXPIRY_SECS as f64
            }
            None => true,
        }
    }

    /// True when the best credential's remaining freshness is below the
    /// preemptive threshold and a background refresh should start.
    pub async fn needs_preemptive_refresh(&self, threshold_secs: u64) -> bool {
        let state = self.state.lock().await;
        match state.best_slot_index() {
            Some(idx) => {
                let remaining =
                    CREDENTIAL_FRESH_MAX_AGE_SECS as f64 - state.slots[idx].age_seconds();
                remaining < threshold_secs as f64
            }
            None => true,
        }
    }

    /// Claims the current refresh episode. Returns true for exactly one
    /// caller per episode; everyone else should just enqueue and wait.
    pub async fn begin_refresh(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.refresh_in_flight {
            false
        } else {
            state.refresh_in_flight = true;
            true
        }
    }

    /// Releases a failed refresh episode and unblocks every waiter so they
    /// can re-evaluate instead of sleeping to their timeouts.
    pub async fn mark_refresh_failed(&self) {
        {
            let mut state = self.state.lock().await;
            if state.refresh_in_flight {
                tracing::warn!("[POOL] Refresh episode marked failed");
            }
            state.refresh_in_flight = false;
        }
        self.notify_waiters();
    }

    /// Blocks until the next pool write or the timeout. The waiter entry is
    /// removed on every exit path, timeout and cancellation included, so a
    /// dropped request can never leak a queue slot.
    pub async fn wait_for_update(&self, caller_id: &str, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let token = self
            .waiter_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut waiters = lock_waiters(&self.waiters);
            waiters.push(Waiter {
                token,
                caller_id: caller_id.to_string(),
                tx,
            });
            tracing::debug!(
                "[POOL] [{}] queued for credential update (position {})",
                caller_id,
                waiters.len()
            );
        }
        // Cleanup happens in Drop: idempotent after a notify, and it still
        // runs when this future is cancelled mid-wait.
        let _guard = WaiterGuard {
            queue: &self.waiters,
            token,
        };

        let woken = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));

        if woken {
            tracing::debug!("[POOL] [{}] woken by credential update", caller_id);
        } else {
            tracing::warn!(
                "[POOL] [{}] timed out after {:?} waiting for credentials",
                caller_id,
                timeout
            );
        }
        woken
    }

    pub async fn mark_slot_expired(&self, slot_id: usize) {
        let mut state = self.state.lock().await;
        if slot_id < state.slots.len() {
            state.slots[slot_id].status = SlotStatus::Expired;
            tracing::warn!("[POOL] Slot {} marked expired", slot_id);
        }
    }

    pub async fn mark_slot_invalid(&self, slot_id: usize) {
        let mut state = self.state.lock().await;
        if slot_id < state.slots.len() {
            state.slots[slot_id].status = SlotStatus::Invalid;
            tracing::warn!("[POOL] Slot {} marked invalid", slot_id);
        }
    }

    pub async fn report(&self) -> PoolReport {
        let queue_length = lock_waiters(&self.waiters).len();
        let state = self.state.lock().await;
        PoolReport {
            pool_size: self.pool_size,
            rotation_cursor: state.rotation_cursor,
            active_slot: state.active_slot,
            pool_version: state.pool_version,
            queue_length,
            is_refreshing: state.refresh_in_flight,
            slots: state
                .slots
                .iter()
                .map(|s| SlotReport {
                    slot_id: s.slot_id,
                    status: s.status,
                    version: s.version,
                    age_seconds: if s.harvest.is_some() {
                        s.age_seconds().max(0.0) as u64
                    } else {
                        0
                    },
                    use_count: s.use_count,
                    is_healthy: s.is_healthy(CREDENTIAL_FRESH_MAX_AGE_SECS),
                })
                .collect(),
        }
    }

    async fn persist(&self, snapshot: &PoolSnapshot) {
        let raw = match serde_json::to_string_pretty(snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("[POOL] Snapshot serialization failed: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.snapshot_path, raw).await {
            tracing::warn!(
                "[POOL] Snapshot write to {} failed: {}",
                self.snapshot_path.display(),
                e
            );
        }
    }
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
