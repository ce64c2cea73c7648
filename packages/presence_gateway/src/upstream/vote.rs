//! In-process presence service backed by a vote per user.
//!
//! A user is online while at least one `connect` call for them is open on
//! this node. Open calls are counted, so the vote only flips back to offline
//! when the last one goes away. `monitor` reports the flag, never the count.

use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use super::{PresenceClient, PresenceUpdate, UpstreamError, UpstreamStream};

type Votes = HashMap<String, watch::Sender<usize>>;

struct Inner {
    /// Open `connect` calls per user, kept only while someone votes or watches
    votes: Mutex<Votes>,
    closed: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Votes> {
        self.votes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cast(&self, name: &str) {
        let mut votes = self.lock();
        let vote = votes
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(0).0);
        vote.send_modify(|n| *n += 1);
        debug!(user = %name, connections = *vote.borrow(), "Vote cast");
    }

    fn withdraw(&self, name: &str) {
        let mut votes = self.lock();
        if let Some(vote) = votes.get(name) {
            vote.send_modify(|n| *n = n.saturating_sub(1));
            debug!(user = %name, connections = *vote.borrow(), "Vote withdrawn");
        }
        prune(&mut votes, name);
    }

    fn subscribe(&self, name: &str) -> watch::Receiver<usize> {
        let mut votes = self.lock();
        votes
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }
}

/// Forget `name` once nobody votes for it and nobody watches it.
fn prune(votes: &mut Votes, name: &str) {
    let idle = votes
        .get(name)
        .is_some_and(|v| *v.borrow() == 0 && v.receiver_count() == 0);
    if idle {
        votes.remove(name);
    }
}

/// Holds one vote for as long as the `connect` stream is alive.
struct VoteGuard {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for VoteGuard {
    fn drop(&mut self) {
        self.inner.withdraw(&self.name);
    }
}

/// The receiving side of a `monitor` stream.
struct Watch {
    inner: Arc<Inner>,
    name: String,
    /// Only `None` while dropping
    votes: Option<watch::Receiver<usize>>,
}

impl Watch {
    fn online(&mut self) -> bool {
        self.votes
            .as_mut()
            .is_some_and(|v| *v.borrow_and_update() > 0)
    }

    async fn changed(&mut self) -> bool {
        match self.votes.as_mut() {
            Some(votes) => votes.changed().await.is_ok(),
            None => false,
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        // The receiver goes first so it no longer counts as a watcher
        drop(self.votes.take());
        prune(&mut self.inner.lock(), &self.name);
    }
}

enum Wake {
    Changed,
    Gone,
    Closed,
}

/// Local stand-in for the replicated presence service.
#[derive(Clone)]
pub struct VoteBackend {
    inner: Arc<Inner>,
}

impl Default for VoteBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VoteBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                votes: Mutex::new(HashMap::new()),
                closed: watch::channel(false).0,
            }),
        }
    }

    /// Whether `name` currently has at least one open `connect` call.
    #[cfg(test)]
    pub fn is_online(&self, name: &str) -> bool {
        self.connections(name) > 0
    }

    #[cfg(test)]
    pub fn connections(&self, name: &str) -> usize {
        self.inner.lock().get(name).map(|v| *v.borrow()).unwrap_or(0)
    }

    /// Users the service currently keeps state for.
    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().len()
    }

    /// Take the service down: open calls fail, new calls fail immediately.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    /// Bring the service back after [`close`](Self::close).
    #[cfg(test)]
    pub fn reopen(&self) {
        self.inner.closed.send_replace(false);
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    fn unavailable() -> UpstreamStream {
        stream::once(async {
            Err(UpstreamError::Unavailable(
                "presence service shut down".to_string(),
            ))
        })
        .boxed()
    }
}

impl PresenceClient for VoteBackend {
    fn connect(&self, name: &str) -> UpstreamStream {
        if self.is_closed() {
            return Self::unavailable();
        }

        self.inner.cast(name);
        let guard = VoteGuard {
            inner: self.inner.clone(),
            name: name.to_string(),
        };
        let mut closed = self.inner.closed.subscribe();
        stream::once(async move {
            let _guard = guard;
            let _ = closed.wait_for(|c| *c).await;
            Err(UpstreamError::Unavailable(
                "presence service shut down".to_string(),
            ))
        })
        .boxed()
    }

    fn monitor(&self, name: &str) -> UpstreamStream {
        if self.is_closed() {
            return Self::unavailable();
        }

        let watch = Watch {
            inner: self.inner.clone(),
            name: name.to_string(),
            votes: Some(self.inner.subscribe(name)),
        };
        let closed = self.inner.closed.subscribe();
        stream::unfold(
            (watch, closed, None::<bool>, false),
            |(mut watch, mut closed, last, done)| async move {
                if done {
                    return None;
                }
                loop {
                    let online = watch.online();
                    if last != Some(online) {
                        let item = Ok(PresenceUpdate { online });
                        return Some((item, (watch, closed, Some(online), false)));
                    }
                    let wake = tokio::select! {
                        changed = watch.changed() => {
                            if changed { Wake::Changed } else { Wake::Gone }
                        }
                        _ = closed.wait_for(|c| *c) => Wake::Closed,
                    };
                    match wake {
                        Wake::Changed => continue,
                        Wake::Gone => return None,
                        Wake::Closed => {
                            let item = Err(UpstreamError::Unavailable(
                                "presence service shut down".to_string(),
                            ));
                            return Some((item, (watch, closed, last, true)));
                        }
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(stream: &mut UpstreamStream) -> Option<Result<PresenceUpdate, UpstreamError>> {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream stalled")
    }

    #[tokio::test]
    async fn test_connect_holds_vote_until_dropped() {
        let backend = VoteBackend::new();
        let first = backend.connect("bob");
        let second = backend.connect("bob");
        assert_eq!(backend.connections("bob"), 2);
        assert!(backend.is_online("bob"));

        drop(first);
        assert!(backend.is_online("bob"));
        drop(second);
        assert!(!backend.is_online("bob"));
    }

    #[tokio::test]
    async fn test_monitor_reports_current_then_changes() {
        let backend = VoteBackend::new();
        let mut watch = backend.monitor("alice");
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: false });

        let call = backend.connect("alice");
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: true });

        drop(call);
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: false });
    }

    #[tokio::test]
    async fn test_monitor_ignores_count_changes_without_flag_change() {
        let backend = VoteBackend::new();
        let first = backend.connect("carol");
        let mut watch = backend.monitor("carol");
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: true });

        let second = backend.connect("carol");
        drop(first);
        drop(second);
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: false });
    }

    #[tokio::test]
    async fn test_close_fails_open_calls() {
        let backend = VoteBackend::new();
        let mut call = backend.connect("dave");
        let mut watch = backend.monitor("dave");
        assert!(next(&mut watch).await.unwrap().is_ok());

        backend.close();
        assert!(matches!(next(&mut call).await, Some(Err(UpstreamError::Unavailable(_)))));
        assert!(next(&mut call).await.is_none());
        assert!(matches!(next(&mut watch).await, Some(Err(UpstreamError::Unavailable(_)))));
        assert!(next(&mut watch).await.is_none());

        drop(call);
        assert!(!backend.is_online("dave"));
    }

    #[tokio::test]
    async fn test_finished_calls_leave_no_state_behind() {
        let backend = VoteBackend::new();
        for i in 0..1000 {
            let name = format!("user-{i}");
            let mut watch = backend.monitor(&name);
            assert!(next(&mut watch).await.unwrap().is_ok());
            let call = backend.connect(&name);
            drop(call);
            drop(watch);
        }
        assert_eq!(backend.tracked(), 0);
    }

    #[tokio::test]
    async fn test_state_is_kept_while_anyone_still_cares() {
        let backend = VoteBackend::new();
        let mut watch = backend.monitor("frank");
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: false });

        // The last vote leaving must not drop the entry under a live watcher
        drop(backend.connect("frank"));
        assert_eq!(backend.tracked(), 1);
        let call = backend.connect("frank");
        assert_eq!(next(&mut watch).await.unwrap().unwrap(), PresenceUpdate { online: true });

        // Nor the watcher leaving under a live vote
        drop(watch);
        assert_eq!(backend.tracked(), 1);
        assert!(backend.is_online("frank"));

        drop(call);
        assert_eq!(backend.tracked(), 0);

        // Unpolled streams clean up too
        drop(backend.monitor("gina"));
        drop(backend.connect("gina"));
        assert_eq!(backend.tracked(), 0);
    }

    #[tokio::test]
    async fn test_calls_on_closed_service_fail_immediately() {
        let backend = VoteBackend::new();
        backend.close();

        let mut call = backend.connect("erin");
        assert!(!backend.is_online("erin"));
        assert!(matches!(next(&mut call).await, Some(Err(_))));

        backend.reopen();
        let _call = backend.connect("erin");
        assert!(backend.is_online("erin"));
    }
}
