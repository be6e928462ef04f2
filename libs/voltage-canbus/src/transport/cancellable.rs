//! Cancellable-Loop transport (`socketcan`)
//!
//! The baseline transport. The reception task waits on socket readiness and the
//! cancellation token at the same time, so `disconnect` never waits for a read
//! to complete. Each readiness wait is additionally bounded by
//! `read_timeout_ms`. Reads use `MSG_DONTWAIT`; the descriptor itself stays
//! blocking for `send`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::task::{deliver_wire, ReceptionTask};
use crate::bus::{Bus, BusStats, FrameListener, Reception, ReceptionState};
use crate::config::BusConfig;
use crate::error::{is_transient_io, CanBusError, Result};
use crate::frame::Frame;
use crate::socket::{self, CanSocket};
use crate::wire::WIRE_FRAME_SIZE;

struct Connection {
    task: ReceptionTask,
}

/// SocketCAN transport with a cancellable, readiness-driven reception loop
pub struct SocketCanBus {
    channel: String,
    config: BusConfig,
    reception: Arc<Reception>,
    sender: RwLock<Option<Arc<CanSocket>>>,
    connection: Mutex<Option<Connection>>,
}

impl SocketCanBus {
    /// Create a disconnected transport; fails if the interface does not exist
    pub fn new(channel: &str, config: &BusConfig) -> Result<Self> {
        config.validate()?;
        socket::interface_index(channel)?;
        debug!("Created SocketCAN transport on {}", channel);
        Ok(Self {
            channel: channel.to_string(),
            config: config.clone(),
            reception: Reception::new(),
            sender: RwLock::new(None),
            connection: Mutex::new(None),
        })
    }

    async fn teardown(&self, conn: Connection) -> Result<()> {
        // Join before the socket drops so no read runs on a closed descriptor
        let joined = conn.task.stop().await;
        if let Some(socket) = self.sender.write().take() {
            socket.close();
        }
        joined
    }
}

async fn reception_loop(
    fd: AsyncFd<Arc<CanSocket>>,
    reception: Arc<Reception>,
    read_timeout: std::time::Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; WIRE_FRAME_SIZE];
    loop {
        let readable = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            readable = tokio::time::timeout(read_timeout, fd.readable()) => readable,
        };

        let mut guard = match readable {
            // Read timeout with no data
            Err(_) => continue,
            Ok(guard) => guard?,
        };

        match guard.try_io(|inner| inner.get_ref().recv_raw(&mut buf, libc::MSG_DONTWAIT)) {
            Ok(Ok(n)) if n == WIRE_FRAME_SIZE => deliver_wire(&reception, &buf),
            Ok(Ok(n)) => {
                reception.stats.record_receive_error();
                return Err(CanBusError::ShortRead {
                    read: n,
                    expected: WIRE_FRAME_SIZE,
                });
            },
            Ok(Err(e)) if is_transient_io(&e) => {
                if e.kind() == io::ErrorKind::Interrupted {
                    reception.stats.record_receive_error();
                }
            },
            Ok(Err(e)) => {
                reception.stats.record_receive_error();
                return Err(e.into());
            },
            // Spurious readiness; cleared by try_io
            Err(_would_block) => {},
        }
    }
}

#[async_trait]
impl Bus for SocketCanBus {
    fn transport_type(&self) -> &str {
        super::SOCKETCAN
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
        let fd = AsyncFd::with_interest(socket.clone(), Interest::READABLE)
            .map_err(|e| CanBusError::resource("register CAN socket", e))?;

        let reception = self.reception.clone();
        let read_timeout = self.config.read_timeout();
        let task = ReceptionTask::spawn(super::SOCKETCAN, self.reception.clone(), move |token| {
            reception_loop(fd, reception, read_timeout, token)
        });

        *self.sender.write() = Some(socket);
        *guard = Some(Connection { task });
        info!("SocketCAN transport connected to {}", self.channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            self.teardown(conn).await?;
            info!("SocketCAN transport disconnected from {}", self.channel);
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

impl std::fmt::Debug for SocketCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanBus")
            .field("channel", &self.channel)
            .field("connected", &self.is_connected())
            .finish()
    }
}
