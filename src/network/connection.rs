use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::{Error, Result};
use crate::protocol::{GatewayCodec, OutboundCall};
use super::{Diagnostic, Shared};

/// Resolves the gateway and opens a UDP socket on an ephemeral port,
/// connected so only the gateway's datagrams are delivered
pub(crate) async fn open_socket(host: &str, port: u16) -> Result<UdpSocket> {
    let target = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::network(format!("Failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| Error::network(format!("No address found for {}:{}", host, port)))?;

    let local: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::network(format!("Failed to create socket: {}", e)))?;
    socket
        .bind(&local.into())
        .map_err(|e| Error::network(format!("Failed to bind socket: {}", e)))?;
    socket
        .connect(&target.into())
        .map_err(|e| Error::network(format!("Failed to connect socket to {}: {}", target, e)))?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())?;
    debug!(local = ?socket.local_addr().ok(), %target, "Socket opened");
    Ok(socket)
}

/// Liveness work handed to the transport loop by timers and handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Count a probe as missed and send it
    Heartbeat,
    /// Judge missed heartbeats
    Evaluate,
}

/// Receiving ends of the loop's queues; handed back on exit for a restart
pub(crate) struct Queues {
    pub(crate) outbound: mpsc::Receiver<OutboundCall>,
    pub(crate) control: mpsc::Receiver<Control>,
}

/// The single task that performs socket I/O.
///
/// Each iteration drains the outbound queue, then waits for one datagram,
/// a control command, an outbound call or shutdown, whichever comes first.
/// Every availability transition happens here, so subscribers see them in
/// the order the state changed. Timeouts and socket errors never end the
/// loop; only the shutdown token does.
pub(crate) struct TransportLoop {
    socket: UdpSocket,
    codec: GatewayCodec,
    queues: Queues,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    send_buffer: BytesMut,
    recv_buffer: BytesMut,
    datagram: Vec<u8>,
}

impl TransportLoop {
    pub(crate) fn new(
        socket: UdpSocket,
        queues: Queues,
        shared: Arc<Shared>,
        shutdown: CancellationToken,
    ) -> Self {
        let datagram = vec![0u8; shared.config.max_datagram_size];
        TransportLoop {
            socket,
            codec: GatewayCodec::new(),
            queues,
            shared,
            shutdown,
            send_buffer: BytesMut::with_capacity(512),
            recv_buffer: BytesMut::with_capacity(datagram.len()),
            datagram,
        }
    }

    /// Runs until shutdown, then hands the queues back for a later restart.
    /// The socket is closed when this returns.
    pub(crate) async fn run(mut self) -> Queues {
        info!("Transport loop started");
        if self.shared.config.probe_on_start {
            self.initial_probe().await;
        }

        let read_timeout = self.shared.config.read_timeout;
        while !self.shutdown.is_cancelled() {
            self.drain_outbound().await;

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.queues.control.recv() => match command {
                    Some(command) => self.handle_control(command).await,
                    None => break,
                },
                call = self.queues.outbound.recv() => match call {
                    Some(call) => self.send_call(call).await,
                    None => break,
                },
                received = timeout(read_timeout, self.socket.recv(&mut self.datagram)) => match received {
                    Ok(Ok(len)) => self.handle_datagram(len),
                    Ok(Err(e)) => self.socket_error("receive", &e),
                    // Read timeout is the idle steady state
                    Err(_) => {}
                },
            }
        }

        info!("Transport loop stopped");
        self.queues
    }

    /// Sends one probe and waits for any answer to set the initial state
    async fn initial_probe(&mut self) {
        debug!("Probing gateway");
        self.send_call(OutboundCall::heartbeat()).await;

        let probe_timeout = self.shared.config.initial_probe_timeout;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            received = timeout(probe_timeout, self.socket.recv(&mut self.datagram)) => match received {
                Ok(Ok(len)) => self.handle_datagram(len),
                Ok(Err(e)) => {
                    self.socket_error("receive", &e);
                    warn!("Socket error during probe; the gateway configuration may be wrong");
                    self.shared.record_probe_unanswered();
                }
                Err(_) => self.shared.record_probe_unanswered(),
            },
        }
    }

    async fn handle_control(&mut self, command: Control) {
        match command {
            Control::Heartbeat => {
                let missed = self.shared.tracker.record_probe_sent();
                trace!(missed, "Sending heartbeat");
                self.send_call(OutboundCall::heartbeat()).await;
            }
            Control::Evaluate => self.shared.evaluate_availability(),
        }
    }

    async fn drain_outbound(&mut self) {
        while let Ok(call) = self.queues.outbound.try_recv() {
            self.send_call(call).await;
        }
    }

    async fn send_call(&mut self, call: OutboundCall) {
        let id = call.id;
        self.send_buffer.clear();
        if let Err(e) = self.codec.encode(call, &mut self.send_buffer) {
            warn!(?id, error = %e, "Failed to encode call");
            if let Some(id) = id {
                self.shared.registry.timeout(id);
            }
            return;
        }

        debug!(?id, len = self.send_buffer.len(), "Sending data");
        let send_timeout = self.shared.config.send_timeout;
        match timeout(send_timeout, self.socket.send(&self.send_buffer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => self.socket_error("send", &e),
            Err(_) => debug!(?id, "Send timed out"),
        }
    }

    fn handle_datagram(&mut self, len: usize) {
        debug!(len, "Received data");
        // Liveness first, so subscribers see availability before the payload
        self.shared.record_receive();

        self.recv_buffer.clear();
        self.recv_buffer.extend_from_slice(&self.datagram[..len]);
        match self.codec.decode(&mut self.recv_buffer) {
            Ok(Some(messages)) => {
                for message in messages {
                    self.shared.route(message);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(len, error = %e, data = %String::from_utf8_lossy(&self.datagram[..len]), "Dropping datagram");
                self.shared.diagnose(Diagnostic::DecodeFailed {
                    bytes: len,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn socket_error(&self, operation: &'static str, error: &io::Error) {
        warn!(operation, %error, "Socket error");
        self.shared.diagnose(Diagnostic::SocketError {
            operation,
            reason: error.to_string(),
        });
    }
}
