//! Leader election over a key prefix.
//!
//! Candidates queue exactly like [`Mutex`](crate::Mutex) contenders, except
//! that each candidate key carries a value (typically the candidate's
//! address). The oldest key under the prefix is the leader and its value is
//! what [`Election::leader`] reports.
//!
//! # States
//!
//! ```text
//! Idle ──campaign──▶ Campaigning ──won──▶ Leading ──resign──▶ Resigned
//!                         │                   └──session lost──▶ Expired
//!                         └──timeout──▶ Idle
//! Resumed ──validated──▶ Leading
//!    └──────stale──────▶ Idle
//! ```

use std::time::Duration;

use tether_core::KeyValueStore;
use tether_core::kv::CompareOp;
use tether_core::kv::KeyValueWithRevision;
use tether_core::kv::ReadRequest;
use tether_core::kv::ScanRequest;
use tether_core::kv::TxnCompare;
use tether_core::kv::TxnOp;
use tether_core::kv::WriteRequest;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CoordinationError;
use crate::keys::candidate_key;
use crate::keys::normalize_prefix;
use crate::observe::LeaderObserver;
use crate::session::Session;
use crate::wait::enqueue;
use crate::wait::wait_predecessors;

/// Where an [`Election`] stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not campaigning.
    Idle,
    /// Candidate key written, waiting for older candidates to leave.
    Campaigning,
    /// This instance is the leader.
    Leading,
    /// Leadership taken over from a previous instance, not yet checked.
    Resumed,
    /// Leadership given up voluntarily.
    Resigned,
    /// The session died while campaigning or leading.
    Expired,
}

/// The current leader as stored under the election prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRecord {
    pub key: String,
    pub value: String,
    /// Leadership term; strictly increases across leaders.
    pub create_revision: u64,
    /// Changes whenever the leader proclaims a new value.
    pub mod_revision: u64,
}

impl From<KeyValueWithRevision> for LeaderRecord {
    fn from(kv: KeyValueWithRevision) -> Self {
        Self {
            key: kv.key,
            value: kv.value,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
        }
    }
}

/// One participant in a leader election, bound to a [`Session`].
pub struct Election<S: KeyValueStore + ?Sized + 'static> {
    session: Session<S>,
    prefix: String,
    key: Option<String>,
    leader_rev: u64,
    header_revision: u64,
    state: ElectionState,
}

impl<S: KeyValueStore + ?Sized + 'static> std::fmt::Debug for Election<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Election")
            .field("prefix", &self.prefix)
            .field("key", &self.key)
            .field("leader_rev", &self.leader_rev)
            .field("state", &self.state)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Election<S> {
    pub(crate) fn new(session: Session<S>, prefix: &str) -> Self {
        Self {
            session,
            prefix: normalize_prefix(prefix),
            key: None,
            leader_rev: 0,
            header_revision: 0,
            state: ElectionState::Idle,
        }
    }

    pub(crate) fn resume(session: Session<S>, prefix: &str, leader_key: String, leader_rev: u64) -> Self {
        Self {
            session,
            prefix: normalize_prefix(prefix),
            key: Some(leader_key),
            leader_rev,
            header_revision: 0,
            state: ElectionState::Resumed,
        }
    }

    /// Run for leader with `value`, waiting up to `timeout` (forever if `None`).
    ///
    /// Calling this again while leading updates the value instead of entering
    /// a second time. A resumed election is validated first and fails with
    /// [`CoordinationError::LeaderChanged`] when the recorded leadership is
    /// gone. On timeout the candidate key is deleted and
    /// [`CoordinationError::CampaignTimeout`] returned.
    pub async fn campaign(&mut self, value: impl Into<String>, timeout: Option<Duration>) -> Result<(), CoordinationError> {
        self.session.ensure_active()?;
        if self.state == ElectionState::Resumed {
            self.validate_resumed().await?;
        }
        if self.state == ElectionState::Leading {
            return self.proclaim(value).await;
        }

        let value = value.into();
        let key = self.candidate();
        self.state = ElectionState::Campaigning;

        let outcome = match timeout {
            None => self.run_campaign(&key, &value).await,
            Some(limit) => match tokio::time::timeout(limit, self.run_campaign(&key, &value)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoordinationError::CampaignTimeout {
                    prefix: self.prefix.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
        };

        match outcome {
            Ok((create_revision, header_revision)) => {
                self.leader_rev = create_revision;
                self.header_revision = header_revision;
                self.state = ElectionState::Leading;
                info!(prefix = %self.prefix, key = %key, revision = create_revision, "elected leader");
                Ok(())
            }
            Err(err) => {
                self.abandon(&key).await;
                self.state = match err {
                    CoordinationError::SessionExpired { .. } => ElectionState::Expired,
                    _ => ElectionState::Idle,
                };
                Err(err)
            }
        }
    }

    /// Replace the leader's value without giving up leadership.
    ///
    /// Guarded on the leader key's create revision, so a deposed leader
    /// gets [`CoordinationError::NotLeader`] instead of overwriting anything.
    pub async fn proclaim(&mut self, value: impl Into<String>) -> Result<(), CoordinationError> {
        let key = self.leader_key().await?;
        let value = value.into();

        let result = self
            .session
            .store()
            .write(WriteRequest::transaction(
                vec![TxnCompare::create_revision(key.as_str(), CompareOp::Equal, self.leader_rev)],
                vec![TxnOp::put_with_lease(key.as_str(), value, self.session.lease_id())],
                vec![],
            ))
            .await?;

        if result.succeeded != Some(true) {
            warn!(prefix = %self.prefix, key = %key, "proclaim rejected, leadership lost");
            self.lose_leadership();
            return Err(CoordinationError::NotLeader {
                prefix: self.prefix.clone(),
            });
        }
        self.header_revision = result.header_revision.unwrap_or(self.header_revision);
        debug!(prefix = %self.prefix, key = %key, "leader value proclaimed");
        Ok(())
    }

    /// Give up leadership. Does nothing unless leading or resumed.
    ///
    /// A candidate key left behind by a failed withdrawal is removed here too.
    pub async fn resign(&mut self) -> Result<(), CoordinationError> {
        if !matches!(self.state, ElectionState::Leading | ElectionState::Resumed) {
            if let Some(key) = self.key.clone() {
                self.session.store().write(WriteRequest::delete(key.as_str())).await?;
                debug!(prefix = %self.prefix, key = %key, "leftover candidate key removed");
                self.key = None;
            }
            return Ok(());
        }
        if self.state == ElectionState::Resumed {
            self.validate_resumed().await?;
        }
        let Some(key) = self.key.clone() else {
            return Ok(());
        };

        let result = self
            .session
            .store()
            .write(WriteRequest::transaction(
                vec![TxnCompare::create_revision(key.as_str(), CompareOp::Equal, self.leader_rev)],
                vec![TxnOp::delete(key.as_str())],
                vec![],
            ))
            .await?;

        self.header_revision = result.header_revision.unwrap_or(self.header_revision);
        self.key = None;
        self.leader_rev = 0;
        self.state = ElectionState::Resigned;
        info!(prefix = %self.prefix, key = %key, "resigned leadership");
        Ok(())
    }

    /// The current leader, whoever it is.
    pub async fn leader(&self) -> Result<LeaderRecord, CoordinationError> {
        let scan = self.session.store().scan(ScanRequest::first_created(self.prefix.as_str())).await?;
        scan.entries.into_iter().next().map(LeaderRecord::from).ok_or_else(|| CoordinationError::NoLeader {
            prefix: self.prefix.clone(),
        })
    }

    /// Stream of leaders, emitting whenever the leader or its value changes.
    ///
    /// Ends when the session ends. Call again to start a fresh stream.
    pub fn observe(&self) -> LeaderObserver {
        LeaderObserver::spawn(self.session.clone(), self.prefix.clone())
    }

    /// Confirm against the store that this instance still leads.
    ///
    /// A resumed election becomes `Leading` here when the recorded key still
    /// exists at the recorded revision.
    pub async fn ensure_leader(&mut self) -> Result<(), CoordinationError> {
        let key = self.leader_key().await?;
        let current = self.session.store().read(ReadRequest::new(key.as_str())).await?;
        match current.kv {
            Some(kv) if kv.create_revision == self.leader_rev => Ok(()),
            _ => {
                let revision = self.leader_rev;
                self.lose_leadership();
                Err(CoordinationError::LeaderChanged {
                    prefix: self.prefix.clone(),
                    key,
                    revision,
                })
            }
        }
    }

    /// Leader key when leading, empty otherwise.
    pub fn key(&self) -> &str {
        match &self.key {
            Some(key) if matches!(self.state, ElectionState::Leading | ElectionState::Resumed) => key.as_str(),
            _ => "",
        }
    }

    /// Create revision of the leader key; the leadership term.
    pub fn rev(&self) -> u64 {
        self.leader_rev
    }

    pub fn header_revision(&self) -> u64 {
        self.header_revision
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leading
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Comparison that holds only while this instance leads.
    pub fn is_owner_cmp(&self) -> Option<TxnCompare> {
        matches!(self.state, ElectionState::Leading | ElectionState::Resumed)
            .then(|| TxnCompare::create_revision(self.key(), CompareOp::Equal, self.leader_rev))
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    /// Our candidate key, always derived from this session's lease.
    fn candidate(&mut self) -> String {
        let session = &self.session;
        let prefix = &self.prefix;
        self.key
            .get_or_insert_with(|| candidate_key(prefix, session.lease_id(), session.next_sequence()))
            .clone()
    }

    async fn run_campaign(&self, key: &str, value: &str) -> Result<(u64, u64), CoordinationError> {
        let store = self.session.store();
        let lease_id = self.session.lease_id();

        let enqueued = enqueue(&**store, &self.prefix, key, value, lease_id).await?;
        let mut header_revision = enqueued.header_revision;

        if let Some(existing) = &enqueued.existing {
            if existing.value != value {
                let result = store
                    .write(WriteRequest::transaction(
                        vec![TxnCompare::create_revision(key, CompareOp::Equal, existing.create_revision)],
                        vec![TxnOp::put_with_lease(key, value, lease_id)],
                        vec![],
                    ))
                    .await?;
                if result.succeeded != Some(true) {
                    return Err(CoordinationError::SessionExpired { lease_id });
                }
                header_revision = result.header_revision.unwrap_or(header_revision);
            }
        }

        if !enqueued.is_owner(key) {
            debug!(prefix = %self.prefix, key, revision = enqueued.create_revision, "campaigning, waiting");
            tokio::select! {
                waited = wait_predecessors(&**store, &self.prefix, enqueued.create_revision - 1) => waited?,
                _ = self.session.done() => return Err(CoordinationError::SessionExpired { lease_id }),
            }
            let current = store.read(ReadRequest::new(key)).await?;
            if current.kv.is_none() {
                return Err(CoordinationError::SessionExpired { lease_id });
            }
            header_revision = current.header_revision;
        }

        Ok((enqueued.create_revision, header_revision))
    }

    /// Key of our leadership, validating a resumed election first.
    async fn leader_key(&mut self) -> Result<String, CoordinationError> {
        if self.session.is_done() && matches!(self.state, ElectionState::Leading | ElectionState::Resumed) {
            self.state = ElectionState::Expired;
            return Err(CoordinationError::SessionExpired {
                lease_id: self.session.lease_id(),
            });
        }
        match self.state {
            ElectionState::Leading => {}
            ElectionState::Resumed => self.validate_resumed().await?,
            _ => {
                return Err(CoordinationError::NotLeader {
                    prefix: self.prefix.clone(),
                });
            }
        }
        self.key.clone().ok_or_else(|| CoordinationError::NotLeader {
            prefix: self.prefix.clone(),
        })
    }

    async fn validate_resumed(&mut self) -> Result<(), CoordinationError> {
        let key = self.key.clone().unwrap_or_default();
        let current = self.session.store().read(ReadRequest::new(key.as_str())).await?;
        match current.kv {
            Some(kv) if kv.create_revision == self.leader_rev => {
                self.state = ElectionState::Leading;
                self.header_revision = current.header_revision;
                info!(prefix = %self.prefix, key = %key, revision = self.leader_rev, "resumed leadership confirmed");
                Ok(())
            }
            _ => {
                let revision = self.leader_rev;
                warn!(prefix = %self.prefix, key = %key, revision, "resumed leadership is stale");
                self.lose_leadership();
                Err(CoordinationError::LeaderChanged {
                    prefix: self.prefix.clone(),
                    key,
                    revision,
                })
            }
        }
    }

    fn lose_leadership(&mut self) {
        self.key = None;
        self.leader_rev = 0;
        self.state = ElectionState::Idle;
    }

    /// Best-effort removal of our candidate key. The key is kept when the
    /// delete fails so a later `campaign` or `resign` can deal with it.
    async fn abandon(&mut self, key: &str) {
        self.leader_rev = 0;

        let timeout = self.session.config().request_timeout;
        match tokio::time::timeout(timeout, self.session.store().write(WriteRequest::delete(key))).await {
            Ok(Ok(_)) => {
                self.key = None;
                debug!(prefix = %self.prefix, key, "abandoned candidate key removed");
            }
            Ok(Err(err)) => warn!(prefix = %self.prefix, key, error = %err, "failed to remove abandoned candidate key"),
            Err(_) => warn!(prefix = %self.prefix, key, "timed out removing abandoned candidate key"),
        }
    }
}
