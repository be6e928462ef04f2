//! Blocking-Read transport (`socketcan-blocking`)
//!
//! The simplest reception strategy: one `recv` of one wire frame per loop
//! iteration on a blocking-pool thread. There is no cancellation token in the
//! loop; `disconnect` closes the socket for the reader, which notices within
//! one read timeout.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::task::{deliver_wire, ReceptionTask};
use crate::bus::{Bus, BusStats, FrameListener, Reception, ReceptionState};
use crate::config::BusConfig;
use crate::error::{is_transient_io, CanBusError, Result};
use crate::frame::Frame;
use crate::socket::{self, CanSocket};

struct Connection {
    socket: Arc<CanSocket>,
    task: ReceptionTask,
}

/// SocketCAN transport reading one frame per blocking call
pub struct BlockingCanBus {
    channel: String,
    config: BusConfig,
    reception: Arc<Reception>,
    sender: RwLock<Option<Arc<CanSocket>>>,
    connection: Mutex<Option<Connection>>,
}

impl BlockingCanBus {
    /// Create a disconnected transport; fails if the interface does not exist
    pub fn new(channel: &str, config: &BusConfig) -> Result<Self> {
        config.validate()?;
        socket::interface_index(channel)?;
        debug!("Created blocking CAN transport on {}", channel);
        Ok(Self {
            channel: channel.to_string(),
            config: config.clone(),
            reception: Reception::new(),
            sender: RwLock::new(None),
            connection: Mutex::new(None),
        })
    }

    async fn teardown(&self, conn: Connection) -> Result<()> {
        *self.sender.write() = None;
        // The reader exits on its next timeout once the socket is closed
        conn.socket.close();
        conn.task.join().await
    }
}

fn reception_loop(socket: &CanSocket, reception: &Reception) -> Result<()> {
    loop {
        match socket.read_wire() {
            Ok(raw) => deliver_wire(reception, &raw),
            Err(CanBusError::Io(e)) if socket.is_closed() => {
                debug!("Blocking reader released: {}", e);
                return Ok(());
            },
            Err(CanBusError::Io(e)) if is_transient_io(&e) => {
                if e.kind() == io::ErrorKind::Interrupted {
                    reception.stats.record_receive_error();
                }
            },
            Err(e) => {
                reception.stats.record_receive_error();
                return Err(e);
            },
        }
    }
}

#[async_trait]
impl Bus for BlockingCanBus {
    fn transport_type(&self) -> &str {
        super::SOCKETCAN_BLOCKING
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
            self.teardown(stale).await?;
        }

        let socket = Arc::new(super::open_raw_socket(
            &self.channel,
            &self.config,
            self.config.read_timeout(),
        )?);

        let reader = socket.clone();
        let reception = self.reception.clone();
        let task = ReceptionTask::spawn_blocking(
            super::SOCKETCAN_BLOCKING,
            self.reception.clone(),
            move |_token| reception_loop(&reader, &reception),
        );

        *self.sender.write() = Some(socket.clone());
        *guard = Some(Connection { socket, task });
        info!("Blocking CAN transport connected to {}", self.channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            self.teardown(conn).await?;
            info!("Blocking CAN transport disconnected from {}", self.channel);
        }
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        let socket = self.sender.read().clone().ok_or(CanBusError::NotConnected)?;
        socket.write_frame(frame)?;
        self.reception.stats.record_sent();
        Ok(())
    }

    fn subscribe(&self, listener: Box<dyn FrameListener>) {
        self.reception.listener.replace(listener);
    }

    fn is_connected(&self) -> bool {
        self.sender.read().is_some()
    }

    fn stats(&self) -> BusStats {
        self.reception.stats.snapshot()
    }

    fn reception_state(&self) -> watch::Receiver<ReceptionState> {
        self.reception.watch()
    }
}

impl std::fmt::Debug for BlockingCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCanBus")
            .field("channel", &self.channel)
            .field("connected", &self.is_connected())
            .finish()
    }
}
