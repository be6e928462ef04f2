//! Batched-Receive transport (`socketcan-batch`)
//!
//! One `recvmmsg(MSG_WAITFORONE)` per iteration fills up to `batch.size` wire
//! frames. The first frame of a call is bounded by `batch.timeout_ms`
//! (`SO_RCVTIMEO`), the rest are taken without waiting, so sparse traffic
//! costs at most one timeout of latency and dense traffic costs one syscall
//! per batch.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace};

use super::task::{deliver_wire, ReceptionTask};
use crate::bus::{Bus, BusStats, FrameListener, Reception, ReceptionState};
use crate::config::BusConfig;
use crate::error::{is_transient_io, CanBusError, Result};
use crate::frame::Frame;
use crate::socket::{self, CanSocket};
use crate::wire::{WireFrame, WIRE_FRAME_SIZE};

/// Pre-allocated receive vector for one `recvmmsg` call
///
/// Holds raw pointers into its own buffers, so it is built on the thread that
/// uses it and never moved across threads.
struct BatchBuffer {
    frames: Box<[WireFrame]>,
    iovecs: Box<[libc::iovec]>,
    headers: Box<[libc::mmsghdr]>,
}

impl BatchBuffer {
    fn new(size: usize) -> Self {
        let mut frames = vec![[0u8; WIRE_FRAME_SIZE]; size].into_boxed_slice();
        let mut iovecs: Box<[libc::iovec]> = frames
            .iter_mut()
            .map(|frame| libc::iovec {
                iov_base: frame.as_mut_ptr().cast::<libc::c_void>(),
                iov_len: WIRE_FRAME_SIZE,
            })
            .collect();
        let headers = iovecs
            .iter_mut()
            .map(|iov| {
                // SAFETY: mmsghdr is plain data; all-zero is a valid empty header
                let mut header: libc::mmsghdr = unsafe { std::mem::zeroed() };
                header.msg_hdr.msg_iov = iov as *mut libc::iovec;
                header.msg_hdr.msg_iovlen = 1;
                header
            })
            .collect();
        Self {
            frames,
            iovecs,
            headers,
        }
    }

    fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Receive up to `capacity` frames; returns how many slots were filled
    fn receive(&mut self, socket: &CanSocket) -> io::Result<usize> {
        if socket.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "CAN socket closed",
            ));
        }
        debug_assert_eq!(self.iovecs.len(), self.headers.len());
        // SAFETY: headers point at iovecs which point at frames, all owned by
        // self and alive for the duration of the call
        let n = unsafe {
            libc::recvmmsg(
                socket.as_raw_fd(),
                self.headers.as_mut_ptr(),
                self.headers.len() as libc::c_uint,
                libc::MSG_WAITFORONE as _,
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn received(&self, count: usize) -> impl Iterator<Item = (&WireFrame, usize)> {
        self.frames
            .iter()
            .zip(self.headers.iter().map(|h| h.msg_len as usize))
            .take(count)
    }
}

/// Deliver the first `count` records of a batch in kernel order
///
/// A record that is not exactly one wire frame is fatal, as for single reads.
/// Returns the number of frames handed to the decoder.
pub(crate) fn deliver_batch<'a, I>(reception: &Reception, records: I) -> Result<usize>
where
    I: IntoIterator<Item = (&'a WireFrame, usize)>,
{
    let mut delivered = 0;
    for (raw, len) in records {
        if len != WIRE_FRAME_SIZE {
            return Err(CanBusError::ShortRead {
                read: len,
                expected: WIRE_FRAME_SIZE,
            });
        }
        deliver_wire(reception, raw);
        delivered += 1;
    }
    Ok(delivered)
}

fn reception_loop(
    socket: &CanSocket,
    reception: &Reception,
    batch_size: usize,
    token: &tokio_util::sync::CancellationToken,
) -> Result<()> {
    let mut batch = BatchBuffer::new(batch_size);
    debug!("Batch receive buffer ready: {} frames", batch.capacity());

    while !token.is_cancelled() {
        match batch.receive(socket) {
            Ok(0) => {
                reception.stats.record_receive_error();
                return Err(CanBusError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "batch receive returned no frames",
                )));
            },
            Ok(n) => {
                trace!("Batch of {} frames", n);
                if let Err(e) = deliver_batch(reception, batch.received(n)) {
                    reception.stats.record_receive_error();
                    return Err(e);
                }
            },
            Err(e) if is_transient_io(&e) => {
                if e.kind() == io::ErrorKind::Interrupted {
                    reception.stats.record_receive_error();
                }
            },
            Err(e) => {
                reception.stats.record_receive_error();
                return Err(e.into());
            },
        }
    }
    Ok(())
}

struct Connection {
    task: ReceptionTask,
}

/// SocketCAN transport receiving frames in batches
pub struct BatchedCanBus {
    channel: String,
    config: BusConfig,
    reception: Arc<Reception>,
    sender: RwLock<Option<Arc<CanSocket>>>,
    connection: Mutex<Option<Connection>>,
}

impl BatchedCanBus {
    /// Create a disconnected transport; fails if the interface does not exist
    pub fn new(channel: &str, config: &BusConfig) -> Result<Self> {
        config.validate()?;
        socket::interface_index(channel)?;
        debug!(
            "Created batched CAN transport on {} (batch size {})",
            channel, config.batch.size
        );
        Ok(Self {
            channel: channel.to_string(),
            config: config.clone(),
            reception: Reception::new(),
            sender: RwLock::new(None),
            connection: Mutex::new(None),
        })
    }

    async fn teardown(&self, conn: Connection) -> Result<()> {
        let joined = conn.task.stop().await;
        if let Some(socket) = self.sender.write().take() {
            socket.close();
        }
        joined
    }
}

#[async_trait]
impl Bus for BatchedCanBus {
    fn transport_type(&self) -> &str {
        super::SOCKETCAN_BATCH
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
            self.config.batch_timeout(),
        )?);

        let reader = socket.clone();
        let reception = self.reception.clone();
        let batch_size = self.config.batch.size;
        let task = ReceptionTask::spawn_blocking(
            super::SOCKETCAN_BATCH,
            self.reception.clone(),
            move |token| reception_loop(&reader, &reception, batch_size, &token),
        );

        *self.sender.write() = Some(socket);
        *guard = Some(Connection { task });
        info!("Batched CAN transport connected to {}", self.channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            self.teardown(conn).await?;
            info!("Batched CAN transport disconnected from {}", self.channel);
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

impl std::fmt::Debug for BatchedCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedCanBus")
            .field("channel", &self.channel)
            .field("batch_size", &self.config.batch.size)
            .field("connected", &self.is_connected())
            .finish()
    }
}
