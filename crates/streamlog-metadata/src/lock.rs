//! Distributed Owner Lock
//!
//! Single-writer lock over the coordinator, used to guarantee at most one
//! writer per stream. Acquisition follows the member-queue protocol:
//!
//! 1. Create an ephemeral sequential member node under the lock path.
//! 2. List members; if ours has the lowest sequence, we own the lock.
//! 3. Otherwise watch the member immediately below ours and retry when it
//!    disappears.
//!
//! The lock is reentrant within a process by explicit reason tags: every
//! `acquire(reason)` must be matched by a `release(reason)`, and the
//! member node is deleted only when the last hold is released.
//!
//! Session expiry invalidates the lock. Dependents (segment writers,
//! readers) subscribe to `expiry_watch()` and flip to an errored state
//! when it fires; `check_ownership()` gives the synchronous view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, CreateMode, SessionEvent};
use crate::error::{MetadataError, Result};

struct LockState {
    member_path: Option<String>,
    holds: HashMap<String, usize>,
}

/// Distributed single-owner lock with reentrant reason tags.
pub struct DistributedLock {
    coordinator: Arc<dyn Coordinator>,
    lock_path: String,
    client_id: String,
    acquire_timeout: Duration,
    state: Mutex<LockState>,
    expiry_tx: watch::Sender<bool>,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedLock {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        lock_path: impl Into<String>,
        client_id: impl Into<String>,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        let (expiry_tx, _) = watch::channel(false);
        let lock = Arc::new(Self {
            coordinator,
            lock_path: lock_path.into(),
            client_id: client_id.into(),
            acquire_timeout,
            state: Mutex::new(LockState {
                member_path: None,
                holds: HashMap::new(),
            }),
            expiry_tx,
            session_task: Mutex::new(None),
        });

        // Forward session expiry into the lock's expiry watch. The task
        // ends when the coordinator's broadcast sender goes away.
        let task = {
            let lock = Arc::clone(&lock);
            let mut events = lock.coordinator.session_events();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        SessionEvent::Expired => {
                            warn!(lock_path = %lock.lock_path, "session expired, lock invalidated");
                            {
                                let mut state = lock.state.lock().unwrap();
                                state.member_path = None;
                            }
                            let _ = lock.expiry_tx.send(true);
                        }
                    }
                }
            })
        };
        *lock.session_task.lock().unwrap() = Some(task);
        lock
    }

    /// Observers see `true` once the underlying session has expired.
    pub fn expiry_watch(&self) -> watch::Receiver<bool> {
        self.expiry_tx.subscribe()
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().member_path.is_some()
    }

    /// Synchronous ownership check used on every transmit.
    pub fn check_ownership(&self) -> Result<()> {
        if *self.expiry_tx.borrow() {
            return Err(MetadataError::OwnershipLost(self.lock_path.clone()));
        }
        if !self.is_held() {
            return Err(MetadataError::OwnershipLost(self.lock_path.clone()));
        }
        Ok(())
    }

    /// Acquire the lock for `reason`, waiting for the current owner to go
    /// away if necessary. Reentrant: if this process already owns the
    /// lock, only the hold count changes.
    pub async fn acquire(&self, reason: &str) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.member_path.is_some() {
                *state.holds.entry(reason.to_string()).or_insert(0) += 1;
                debug!(lock_path = %self.lock_path, reason, "reentrant lock acquire");
                return Ok(());
            }
        }

        // Parent may already exist; any other failure is real.
        match self
            .coordinator
            .create(&self.lock_path, Bytes::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(MetadataError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }

        let member_path = self
            .coordinator
            .create(
                &format!("{}/member_", self.lock_path),
                Bytes::from(self.client_id.clone()),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let member_name = member_path
            .rsplit('/')
            .next()
            .expect("member path has a name")
            .to_string();

        let waited =
            tokio::time::timeout(self.acquire_timeout, self.wait_for_ownership(&member_name)).await;
        match waited {
            Ok(Ok(())) => {
                let mut state = self.state.lock().unwrap();
                state.member_path = Some(member_path);
                state.holds.insert(reason.to_string(), 1);
                info!(lock_path = %self.lock_path, reason, "lock acquired");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = self.coordinator.delete(&member_path).await;
                Err(e)
            }
            Err(_) => {
                let _ = self.coordinator.delete(&member_path).await;
                Err(MetadataError::OwnershipAcquireFailed(self.lock_path.clone()))
            }
        }
    }

    async fn wait_for_ownership(&self, member_name: &str) -> Result<()> {
        loop {
            let mut members = self.coordinator.children(&self.lock_path).await?;
            members.sort();
            let index = members
                .iter()
                .position(|m| m == member_name)
                .ok_or_else(|| MetadataError::OwnershipAcquireFailed(self.lock_path.clone()))?;
            if index == 0 {
                return Ok(());
            }
            let predecessor = format!("{}/{}", self.lock_path, members[index - 1]);
            debug!(lock_path = %self.lock_path, predecessor = %predecessor, "waiting on lock predecessor");
            let watch = self.coordinator.watch_delete(&predecessor).await?;
            // A dead sender just means the predecessor is already gone.
            let _ = watch.await;
        }
    }

    /// Release one hold for `reason`; deletes the member node when the
    /// last hold goes away.
    pub async fn release(&self, reason: &str) -> Result<()> {
        let to_delete = {
            let mut state = self.state.lock().unwrap();
            match state.holds.get_mut(reason) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some(_) => {
                    state.holds.remove(reason);
                    if state.holds.is_empty() {
                        state.member_path.take()
                    } else {
                        None
                    }
                }
                None => {
                    return Err(MetadataError::LockNotHeld(reason.to_string()));
                }
            }
        };
        if let Some(path) = to_delete {
            info!(lock_path = %self.lock_path, reason, "lock released");
            match self.coordinator.delete(&path).await {
                Ok(()) | Err(MetadataError::NodeNotFound(_)) => {}
                // The member node dies with the session anyway.
                Err(MetadataError::SessionExpired) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(task) = self.session_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
