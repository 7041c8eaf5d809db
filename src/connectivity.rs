//! Connectivity monitoring.
//!
//! The monitor owns the current reachability flag and publishes it through a
//! `watch` channel. Readers hold a cheap [`Connectivity`] handle. A sync drain
//! is triggered only on the offline to online edge.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::remote::{HttpRemote, RemoteApi};
use crate::sync::SyncEngine;

/// Read-only view of the current reachability.
#[derive(Clone, Debug)]
pub struct Connectivity {
  rx: watch::Receiver<bool>,
}

impl Connectivity {
  /// A handle that never changes.
  pub fn fixed(online: bool) -> Self {
    let (_tx, rx) = watch::channel(online);
    Self { rx }
  }

  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }
}

/// Change in reachability produced by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  CameOnline,
  WentOffline,
  Unchanged,
}

/// Platform reachability primitive (heartbeat, OS API, event source).
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
  async fn is_reachable(&self) -> bool;
}

/// Heartbeat probe: the server is reachable if it answers an HTTP request.
pub struct HttpProbe {
  remote: HttpRemote,
  path: String,
}

impl HttpProbe {
  pub fn new(remote: HttpRemote, path: impl Into<String>) -> Self {
    Self {
      remote,
      path: path.into(),
    }
  }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
  async fn is_reachable(&self) -> bool {
    self.remote.ping(&self.path).await
  }
}

/// Tracks offline/online transitions and triggers sync drains.
pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx }
  }

  pub fn handle(&self) -> Connectivity {
    Connectivity {
      rx: self.tx.subscribe(),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record an observation and report the edge it produced, if any.
  pub fn observe(&self, online: bool) -> Transition {
    let was_online = self.tx.send_replace(online);
    match (was_online, online) {
      (false, true) => {
        info!("connectivity restored");
        Transition::CameOnline
      }
      (true, false) => {
        warn!("connectivity lost");
        Transition::WentOffline
      }
      _ => Transition::Unchanged,
    }
  }

  /// Poll `probe` every `interval` and start a drain on each offline to online edge.
  ///
  /// Runs until the surrounding task is dropped. Drains run in their own task so
  /// polling continues while a pass is in flight; overlapping triggers are
  /// coalesced by the engine.
  pub async fn run<P, R>(&self, probe: P, engine: Arc<SyncEngine<R>>, interval: Duration)
  where
    P: ReachabilityProbe,
    R: RemoteApi + 'static,
  {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let online = probe.is_reachable().await;

      if self.observe(online) == Transition::CameOnline {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
          let outcome = engine.drain().await;
          debug!(?outcome, "drain triggered by reconnect finished");
        });
      }
    }
  }
}
