//! UDP discovery: answers any probe datagram with the advertised TCP ports.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tracing::{debug, info, warn};

use remote_command_proto::{DiscoveryResponse, PortAdvertisement, PORT_NAME_COMMAND, PORT_NAME_STREAM};

const PROBE_BUFFER_SIZE: usize = 1024;

pub(crate) struct DiscoveryResponder {
    socket: UdpSocket,
    response: Vec<u8>,
    running: Arc<AtomicBool>,
}

impl DiscoveryResponder {
    /// The socket must carry a read timeout so the loop can poll `running`.
    pub(crate) fn new(socket: UdpSocket, command_port: u16, stream_port: u16, running: Arc<AtomicBool>) -> Self {
        let advertisement = DiscoveryResponse {
            ports: vec![
                PortAdvertisement::new(PORT_NAME_COMMAND, command_port),
                PortAdvertisement::new(PORT_NAME_STREAM, stream_port),
            ],
        };

        let mut response = BytesMut::with_capacity(advertisement.size());
        advertisement.encode(&mut response);

        Self {
            socket,
            response: response.to_vec(),
            running,
        }
    }

    pub(crate) fn run(self) {
        let mut buffer = [0u8; PROBE_BUFFER_SIZE];

        while self.running.load(Ordering::SeqCst) {
            let (len, peer) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(error) => {
                    debug!(%error, "Discovery receive failed");
                    continue;
                }
            };

            let probe = String::from_utf8_lossy(&buffer[..len]);
            info!(%peer, %probe, "Discovery probe");

            if let Err(error) = self.socket.send_to(&self.response, peer) {
                warn!(%error, %peer, "Failed to answer discovery probe");
            }
        }
    }
}
