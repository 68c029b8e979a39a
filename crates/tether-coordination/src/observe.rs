//! Streaming leadership changes.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::StreamExt;
use tether_core::KeyValueStore;
use tether_core::constants::OBSERVER_CHANNEL_CAPACITY;
use tether_core::kv::ScanRequest;
use tether_core::kv::WatchRequest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::election::LeaderRecord;
use crate::error::CoordinationError;
use crate::session::Session;

/// Stream of [`LeaderRecord`]s from [`Election::observe`](crate::Election::observe).
///
/// The first item is the leader at subscription time, if there is one.
/// Dropping the observer stops the background watch.
pub struct LeaderObserver {
    rx: mpsc::Receiver<LeaderRecord>,
    task: JoinHandle<()>,
}

impl LeaderObserver {
    pub(crate) fn spawn<S: KeyValueStore + ?Sized + 'static>(session: Session<S>, prefix: String) -> Self {
        let (tx, rx) = mpsc::channel(OBSERVER_CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            tokio::select! {
                state = session.done() => {
                    debug!(prefix = %prefix, ?state, "observer stopped, session ended");
                }
                _ = tx.closed() => {
                    debug!(prefix = %prefix, "observer stopped, receiver dropped");
                }
                result = watch_leader(&**session.store(), &prefix, &tx) => {
                    if let Err(err) = result {
                        warn!(prefix = %prefix, error = %err, "observer stopped");
                    }
                }
            }
        });
        Self { rx, task }
    }

    /// Wait for the next leadership change.
    pub async fn next_leader(&mut self) -> Option<LeaderRecord> {
        self.rx.recv().await
    }
}

impl Stream for LeaderObserver {
    type Item = LeaderRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LeaderObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Rescan the oldest key on every change under `prefix` and forward it
/// when it differs from the last one sent.
async fn watch_leader<S: KeyValueStore + ?Sized>(
    store: &S,
    prefix: &str,
    tx: &mpsc::Sender<LeaderRecord>,
) -> Result<(), CoordinationError> {
    let mut last_sent: Option<(String, u64)> = None;

    loop {
        let mut events = store.watch(WatchRequest::prefix(prefix)).await?;

        loop {
            let leader = store.scan(ScanRequest::first_created(prefix)).await?.entries.into_iter().next();
            if let Some(kv) = leader {
                let marker = (kv.key.clone(), kv.mod_revision);
                if last_sent.as_ref() != Some(&marker) {
                    last_sent = Some(marker);
                    if tx.send(LeaderRecord::from(kv)).await.is_err() {
                        return Ok(());
                    }
                }
            }

            match events.next().await {
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(prefix, error = %err, "leader watch broken, resubscribing");
                    break;
                }
                None => break,
            }
        }
    }
}
