//! Vault session management.
//!
//! A session holds the derived master key in memory while the vault is
//! unlocked. Keys are zeroized when the session is locked, expires, or is
//! dropped.
//!
//! The idle timeout is enforced twice: every [`SessionManager::acquire`]
//! checks it, and a background task force-locks the session at the deadline
//! even if nothing touches it. Each lock bumps an epoch counter; a
//! [`KeyLease`] taken before the bump refuses further use, so work already
//! in flight stops instead of finishing with a stale key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use casevault_common::{CaseId, Error, Result};
use casevault_crypto::{unlock_key, KdfParams, MasterKey, Salt, VerificationToken};

/// State of the vault session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No key in memory.
    Locked,
    /// Key available for content access.
    Unlocked,
}

/// Session details safe to display or log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub case_id: CaseId,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Idle timeout of the live session, or of the next one.
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockReason {
    Explicit,
    Expired,
}

struct Session {
    /// Sole strong reference; leases only hold weak ones.
    key: Arc<MasterKey>,
    created_at: DateTime<Utc>,
    timeout: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Session {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Inner {
    session: Option<Session>,
    /// Idle timeout given to the next session.
    timeout: Option<Duration>,
    last_lock: LockReason,
    monitor: Option<JoinHandle<()>>,
}

struct Shared {
    inner: RwLock<Inner>,
    epoch: AtomicU64,
    case_id: CaseId,
}

impl Shared {
    /// Drop the key, stop the monitor, and invalidate outstanding leases.
    fn clear(&self, inner: &mut Inner, reason: LockReason) -> bool {
        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }
        let had_session = inner.session.take().is_some();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        inner.last_lock = reason;
        had_session
    }

    /// The live session, force-locking it if its deadline has passed.
    fn live<'a>(&self, inner: &'a mut Inner, now: Instant) -> Result<&'a mut Session> {
        let expired = match &inner.session {
            None => {
                return Err(match inner.last_lock {
                    LockReason::Expired => Error::SessionExpired,
                    LockReason::Explicit => Error::Locked,
                })
            }
            Some(session) => session.expired(now),
        };
        if expired {
            self.clear(inner, LockReason::Expired);
            info!(case = %self.case_id, "Session expired");
            return Err(Error::SessionExpired);
        }
        inner.session.as_mut().ok_or(Error::Locked)
    }
}

/// Owner of the in-memory key for one case.
///
/// Explicitly owned by the vault manager; several managers (and thus several
/// sessions) can coexist in one process.
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create a locked session manager.
    ///
    /// `timeout` is the idle timeout; `None` disables expiry.
    pub fn new(case_id: CaseId, timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    session: None,
                    timeout,
                    last_lock: LockReason::Explicit,
                    monitor: None,
                }),
                epoch: AtomicU64::new(0),
                case_id,
            }),
        }
    }

    /// Derive the key for `password` and unlock if it matches `token`.
    ///
    /// Key derivation runs on the blocking pool.
    ///
    /// # Errors
    /// - `Error::Authentication` on a wrong password; the session stays locked
    pub async fn unlock(
        &self,
        password: &[u8],
        salt: &Salt,
        kdf: &KdfParams,
        token: &VerificationToken,
    ) -> Result<()> {
        let key = derive_verified(password, salt, kdf, token).await?;
        self.start(key).await;
        Ok(())
    }

    /// Install an already verified key, replacing any current session.
    pub async fn start(&self, key: impl Into<Arc<MasterKey>>) {
        let mut inner = self.shared.inner.write().await;
        self.shared.clear(&mut inner, LockReason::Explicit);

        let timeout = inner.timeout;
        let now = Instant::now();
        inner.session = Some(Session {
            key: key.into(),
            created_at: Utc::now(),
            timeout,
            expires_at: timeout.and_then(|t| now.checked_add(t)),
        });
        reschedule(&self.shared, &mut inner);
        info!(case = %self.shared.case_id, "Vault unlocked");
    }

    /// Zero and drop the key. Idempotent.
    pub async fn lock(&self) {
        let mut inner = self.shared.inner.write().await;
        if self.shared.clear(&mut inner, LockReason::Explicit) {
            info!(case = %self.shared.case_id, "Vault locked");
        }
    }

    /// Lock unless the session key derives `token`.
    ///
    /// A mismatch means the password was changed by another owner of the
    /// case; the key in memory no longer opens the files. Returns whether
    /// the session was locked.
    pub async fn lock_unless_matches(&self, token: &VerificationToken) -> bool {
        let mut inner = self.shared.inner.write().await;
        let stale = inner
            .session
            .as_ref()
            .is_some_and(|s| !s.key.verification_token().matches(token));
        if stale {
            self.shared.clear(&mut inner, LockReason::Explicit);
            info!(case = %self.shared.case_id, "Password changed elsewhere, session locked");
        }
        stale
    }

    /// Take a lease on the key for one access, extending the idle deadline.
    ///
    /// # Errors
    /// - `Error::SessionExpired` if the idle timeout has passed
    /// - `Error::Locked` if the vault was never unlocked or was locked explicitly
    pub async fn acquire(&self) -> Result<KeyLease> {
        let mut inner = self.shared.inner.write().await;
        let now = Instant::now();
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let session = self.shared.live(&mut inner, now)?;
        session.expires_at = session.timeout.and_then(|t| now.checked_add(t));

        Ok(KeyLease {
            key: Arc::downgrade(&session.key),
            epoch,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Add `additional` to the idle timeout of the live session and restart
    /// its countdown. A session without a timeout is left as is.
    ///
    /// # Errors
    /// - `Error::SessionExpired` or `Error::Locked` without a live session
    pub async fn extend(&self, additional: Duration) -> Result<()> {
        let mut inner = self.shared.inner.write().await;
        let now = Instant::now();
        let session = self.shared.live(&mut inner, now)?;
        let Some(current) = session.timeout else {
            return Ok(());
        };

        let timeout = current.saturating_add(additional);
        session.timeout = Some(timeout);
        session.expires_at = now.checked_add(timeout);
        reschedule(&self.shared, &mut inner);
        info!(
            case = %self.shared.case_id,
            timeout_secs = timeout.as_secs(),
            "Session extended"
        );
        Ok(())
    }

    /// Change the idle timeout of the live session and of later ones.
    ///
    /// The countdown of a live session restarts now; `None` disables expiry.
    pub async fn set_timeout(&self, timeout: Option<Duration>) {
        let mut inner = self.shared.inner.write().await;
        let now = Instant::now();
        inner.timeout = timeout;
        if inner.session.as_ref().is_some_and(|s| s.expired(now)) {
            self.shared.clear(&mut inner, LockReason::Expired);
        }
        if let Some(session) = inner.session.as_mut() {
            session.timeout = timeout;
            session.expires_at = timeout.and_then(|t| now.checked_add(t));
        }
        reschedule(&self.shared, &mut inner);
        debug!(case = %self.shared.case_id, ?timeout, "Idle timeout changed");
    }

    /// Idle timeout of the live session, or of the next one.
    pub async fn timeout(&self) -> Option<Duration> {
        let inner = self.shared.inner.read().await;
        match &inner.session {
            Some(session) => session.timeout,
            None => inner.timeout,
        }
    }

    /// Current state, without extending the deadline.
    pub async fn state(&self) -> SessionState {
        let inner = self.shared.inner.read().await;
        match &inner.session {
            Some(s) if !s.expired(Instant::now()) => SessionState::Unlocked,
            _ => SessionState::Locked,
        }
    }

    /// Session details without key material.
    pub async fn info(&self) -> SessionInfo {
        let state = self.state().await;
        let inner = self.shared.inner.read().await;
        let (created_at, expires_at) = match (&inner.session, state) {
            (Some(s), SessionState::Unlocked) => {
                let remaining = s
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now()));
                let expires_at = remaining
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d);
                (Some(s.created_at), expires_at)
            }
            _ => (None, None),
        };
        let timeout = match &inner.session {
            Some(session) => session.timeout,
            None => inner.timeout,
        };

        SessionInfo {
            state,
            case_id: self.shared.case_id.clone(),
            created_at,
            expires_at,
            idle_timeout_secs: timeout.map(|t| t.as_secs()),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_write() {
            self.shared.clear(&mut inner, LockReason::Explicit);
        }
    }
}

/// Derive a key and check it against the stored token, off the async threads.
pub(crate) async fn derive_verified(
    password: &[u8],
    salt: &Salt,
    kdf: &KdfParams,
    token: &VerificationToken,
) -> Result<MasterKey> {
    let password = zeroize::Zeroizing::new(password.to_vec());
    let salt = salt.clone();
    let kdf = kdf.clone();
    let token = token.clone();
    tokio::task::spawn_blocking(move || unlock_key(&password, &salt, &kdf, &token))
        .await
        .map_err(|e| Error::Vault(format!("Key derivation task failed: {}", e)))?
}

/// Replace the expiry monitor after the deadline moved.
fn reschedule(shared: &Arc<Shared>, inner: &mut Inner) {
    if let Some(monitor) = inner.monitor.take() {
        monitor.abort();
    }
    if inner.session.as_ref().is_some_and(|s| s.expires_at.is_some()) {
        inner.monitor = Some(spawn_monitor(Arc::downgrade(shared)));
    }
}

fn spawn_monitor(shared: Weak<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = {
                let Some(shared) = shared.upgrade() else { return };
                let inner = shared.inner.read().await;
                let next = inner.session.as_ref().and_then(|s| s.expires_at);
                match next {
                    Some(at) => at,
                    None => return,
                }
            };

            tokio::time::sleep_until(deadline).await;

            let Some(shared) = shared.upgrade() else { return };
            let mut inner = shared.inner.write().await;
            let due = match &inner.session {
                Some(s) => s.expired(Instant::now()),
                None => return,
            };
            if due {
                // Our own handle; dropping it detaches.
                inner.monitor.take();
                shared.clear(&mut inner, LockReason::Expired);
                info!(case = %shared.case_id, "Idle timeout reached, key cleared");
                return;
            }
            debug!(case = %shared.case_id, "Session touched, monitor rescheduled");
        }
    })
}

/// A key borrowed from the session for one operation.
///
/// The lease does not own the key: once the session locks, expires, or is
/// re-keyed, the key is gone and the lease refuses further use.
#[derive(Clone)]
pub struct KeyLease {
    key: Weak<MasterKey>,
    epoch: u64,
    shared: Arc<Shared>,
}

impl KeyLease {
    /// Fail if the session was locked, expired, or re-keyed since the lease
    /// was taken.
    pub fn check(&self) -> Result<()> {
        if self.shared.epoch.load(Ordering::SeqCst) == self.epoch {
            Ok(())
        } else {
            Err(Error::SessionExpired)
        }
    }

    /// The key, after checking the lease. Hold it only for the current step.
    pub fn key(&self) -> Result<Arc<MasterKey>> {
        self.check()?;
        self.key.upgrade().ok_or(Error::SessionExpired)
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
