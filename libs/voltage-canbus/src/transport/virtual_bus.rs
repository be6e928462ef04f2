//! Virtual transport (`virtual`)
//!
//! In-process bus keyed by channel name. Every `VirtualBus` on the same channel
//! shares one broadcast queue, so frames keep their send order for every
//! subscriber. Frames travel as wire frames, exactly as on a raw socket.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{deliver_wire, ReceptionTask};
use crate::bus::{Bus, BusStats, FrameListener, Reception, ReceptionState};
use crate::config::BusConfig;
use crate::error::{CanBusError, Result};
use crate::frame::Frame;
use crate::wire::{self, WireFrame};

#[derive(Debug, Clone, Copy)]
struct Envelope {
    origin: u64,
    raw: WireFrame,
}

type ChannelSender = Arc<broadcast::Sender<Envelope>>;
type Hub = SyncMutex<HashMap<String, Weak<broadcast::Sender<Envelope>>>>;

static HUB: OnceLock<Hub> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn hub() -> &'static Hub {
    HUB.get_or_init(Hub::default)
}

/// Shared queue for `channel`; the first bus on a channel sets its capacity
///
/// The hub holds weak references only: a channel lives as long as some bus
/// on it does.
fn channel_sender(channel: &str, capacity: usize) -> ChannelSender {
    let mut hub = hub().lock();
    if let Some(tx) = hub.get(channel).and_then(Weak::upgrade) {
        return tx;
    }
    // Entries left behind by buses dropped concurrently
    hub.retain(|_, tx| tx.strong_count() > 0);

    debug!("Virtual channel {} created (capacity {})", channel, capacity);
    let tx = Arc::new(broadcast::channel(capacity).0);
    hub.insert(channel.to_string(), Arc::downgrade(&tx));
    tx
}

/// Forget `channel` if `tx` is its last handle
fn release_channel(channel: &str, tx: &ChannelSender) {
    let mut hub = hub().lock();
    let is_last = hub
        .get(channel)
        .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(tx)))
        && Arc::strong_count(tx) == 1;
    if is_last {
        hub.remove(channel);
        debug!("Virtual channel {} released", channel);
    }
}

#[cfg(test)]
fn channel_exists(channel: &str) -> bool {
    hub().lock().contains_key(channel)
}

struct Connection {
    task: ReceptionTask,
}

/// In-process CAN bus
pub struct VirtualBus {
    id: u64,
    channel: String,
    receive_own_messages: bool,
    reception: Arc<Reception>,
    tx: ChannelSender,
    connected: AtomicBool,
    connection: Mutex<Option<Connection>>,
}

impl VirtualBus {
    pub fn new(channel: &str, config: &BusConfig) -> Result<Self> {
        config.validate()?;
        if channel.is_empty() {
            return Err(CanBusError::config("virtual channel name cannot be empty"));
        }
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            receive_own_messages: config.receive_own_messages,
            reception: Reception::new(),
            tx: channel_sender(channel, config.listener_capacity),
            connected: AtomicBool::new(false),
            connection: Mutex::new(None),
        })
    }
}

async fn reception_loop(
    mut rx: broadcast::Receiver<Envelope>,
    reception: Arc<Reception>,
    id: u64,
    receive_own_messages: bool,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            message = rx.recv() => message,
        };
        match message {
            Ok(envelope) => {
                if envelope.origin == id && !receive_own_messages {
                    continue;
                }
                deliver_wire(&reception, &envelope.raw);
            },
            Err(RecvError::Lagged(missed)) => {
                warn!("Virtual bus listener lagged, {} frames dropped", missed);
                reception.stats.record_dropped(missed);
            },
            Err(RecvError::Closed) => return Err(CanBusError::NotConnected),
        }
    }
}

#[async_trait]
impl Bus for VirtualBus {
    fn transport_type(&self) -> &str {
        super::VIRTUAL
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.task.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = guard.take() {
            stale.task.stop().await?;
        }

        // Subscribe before returning so every later send is observed
        let rx = self.tx.subscribe();
        let reception = self.reception.clone();
        let (id, own) = (self.id, self.receive_own_messages);
        let task = ReceptionTask::spawn(super::VIRTUAL, self.reception.clone(), move |token| {
            reception_loop(rx, reception, id, own, token)
        });

        *guard = Some(Connection { task });
        self.connected.store(true, Ordering::Release);
        info!("Virtual transport connected to {}", self.channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            self.connected.store(false, Ordering::Release);
            conn.task.stop().await?;
            info!("Virtual transport disconnected from {}", self.channel);
        }
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(CanBusError::NotConnected);
        }
        let envelope = Envelope {
            origin: self.id,
            raw: wire::encode(frame),
        };
        // No subscribers is an idle bus, not an error
        let _ = self.tx.send(envelope);
        self.reception.stats.record_sent();
        Ok(())
    }

    fn subscribe(&self, listener: Box<dyn FrameListener>) {
        self.reception.listener.replace(listener);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> BusStats {
        self.reception.stats.snapshot()
    }

    fn reception_state(&self) -> watch::Receiver<ReceptionState> {
        self.reception.watch()
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        release_channel(&self.channel, &self.tx);
    }
}

impl std::fmt::Debug for VirtualBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBus")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("connected", &self.is_connected())
            .finish()
    }
}
