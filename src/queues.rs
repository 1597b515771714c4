//! Per-multiplexer I/O workers. Each multiplexer owns one send queue and one
//!  receive queue; engines of all sockets sharing the multiplexer submit
//!  outgoing packets to the send queue, and the receive queue feeds every
//!  inbound datagram to the engine-side demultiplexer sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::channel::UdpChannel;
use crate::error::TransportError;

/// Receives every datagram a multiplexer's channel delivers. Implemented on
///  the engine side; unassociated handshakes come back into the core through
///  the listener dispatch entry point.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, data: Bytes);
}

/// Outbound worker: drains submitted packets onto the channel in submission
///  order.
pub struct SendQueue {
    tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    closing: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SendQueue {
    pub fn spawn(channel: Arc<dyn UdpChannel>) -> Arc<SendQueue> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
        let closing = Arc::new(AtomicBool::new(false));

        let worker_closing = closing.clone();
        let handle = tokio::spawn(async move {
            while let Some((to, data)) = rx.recv().await {
                if worker_closing.load(Ordering::Acquire) {
                    break;
                }
                trace!("send queue: {} bytes to {:?}", data.len(), to);
                if let Err(e) = channel.send_to(&data, to).await {
                    if worker_closing.load(Ordering::Acquire) {
                        break;
                    }
                    error!("send queue: error sending to {:?}: {}", to, e);
                }
            }
            debug!("send queue: worker exiting");
        });

        Arc::new(SendQueue {
            tx,
            closing,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a packet for sending. Fails once the queue is closing.
    pub fn submit(&self, to: SocketAddr, data: Bytes) -> Result<(), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send((to, data))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Unblock the worker and refuse further submissions. Called when the
    ///  multiplexer loses its last socket.
    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().expect("send queue lock poisoned").take() {
            handle.abort();
        }
    }
}

/// Inbound worker: reads datagrams off the channel and forwards them to the
///  sink until the queue is marked closing.
pub struct RecvQueue {
    closing: Arc<AtomicBool>,
    closing_notify: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecvQueue {
    pub fn spawn(channel: Arc<dyn UdpChannel>, sink: Arc<dyn DatagramSink>) -> Arc<RecvQueue> {
        let closing = Arc::new(AtomicBool::new(false));
        let closing_notify = Arc::new(Notify::new());

        let worker_closing = closing.clone();
        let worker_notify = closing_notify.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1 << 16];
            loop {
                if worker_closing.load(Ordering::Acquire) {
                    break;
                }
                select! {
                    received = channel.recv_from(&mut buf) => {
                        match received {
                            Ok((len, from)) => {
                                trace!("receive queue: {} bytes from {:?}", len, from);
                                sink.on_datagram(from, Bytes::copy_from_slice(&buf[..len])).await;
                            }
                            Err(e) => {
                                if worker_closing.load(Ordering::Acquire) {
                                    break;
                                }
                                error!("receive queue: socket error: {}", e);
                            }
                        }
                    }
                    _ = worker_notify.notified() => {
                        break;
                    }
                }
            }
            debug!("receive queue: worker exiting");
        });

        Arc::new(RecvQueue {
            closing,
            closing_notify,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the worker; any blocked receive is abandoned.
    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
        self.closing_notify.notify_waiters();
        if let Some(handle) = self
            .handle
            .lock()
            .expect("receive queue lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
