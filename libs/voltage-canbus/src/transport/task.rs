//! Reception task handle
//!
//! One background task per connected transport. The handle owns the
//! cancellation token and the join handle; `stop` cancels and then waits for
//! the task to exit, which is the ordering every transport relies on before it
//! releases sockets or mapped memory.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::bus::{Reception, ReceptionState};
use crate::error::{CanBusError, Result};
use crate::wire::{self, WireFrame};

#[derive(Debug)]
pub(crate) struct ReceptionTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReceptionTask {
    /// Run a loop of blocking syscalls on the blocking thread pool
    pub(crate) fn spawn_blocking<F>(name: &'static str, reception: Arc<Reception>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Result<()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        reception.set_state(ReceptionState::Running);
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = body(child);
            finish(name, &reception, outcome);
        });
        info!("{} reception task started", name);
        Self { token, handle }
    }

    /// Run an async reception loop on the runtime
    pub(crate) fn spawn<F, Fut>(name: &'static str, reception: Arc<Reception>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let fut = body(token.clone());
        reception.set_state(ReceptionState::Running);
        let handle = tokio::spawn(async move {
            let outcome = fut.await;
            finish(name, &reception, outcome);
        });
        info!("{} reception task started", name);
        Self { token, handle }
    }

    /// Whether the task already exited on its own
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the task to exit
    pub(crate) async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| CanBusError::TaskJoin(e.to_string()))
    }

    /// Cancel, then wait for the task to exit
    pub(crate) async fn stop(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

fn finish(name: &'static str, reception: &Reception, outcome: Result<()>) {
    match outcome {
        Ok(()) => {
            info!("{} reception task stopped", name);
            reception.set_state(ReceptionState::Stopped);
        },
        Err(e) => {
            error!("{} reception task terminated: {}", name, e);
            reception.set_state(ReceptionState::Failed(e.to_string()));
        },
    }
}

/// Decode one wire frame and hand it to the listener
///
/// Records with an invalid length byte are dropped and counted, never fatal.
#[inline]
pub(crate) fn deliver_wire(reception: &Reception, raw: &WireFrame) {
    match wire::decode(raw) {
        Ok(frame) => {
            trace!("RX {}", frame);
            reception.deliver(frame);
        },
        Err(e) => {
            warn!("Dropping invalid CAN frame: {}", e);
            reception.stats.record_dropped(1);
        },
    }
}
