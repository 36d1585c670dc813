//! Stream channel: accepts replacement stream sockets and installs them into
//! the process supervisor, one client at a time.

use std::net::{Shutdown, TcpListener};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::info;

use crate::process::ProcessSupervisor;
use crate::socket::accept_interruptible;

pub(crate) struct StreamAcceptor {
    listener: TcpListener,
    supervisor: Arc<ProcessSupervisor>,
    running: Arc<AtomicBool>,
}

impl StreamAcceptor {
    pub(crate) fn new(listener: TcpListener, supervisor: Arc<ProcessSupervisor>, running: Arc<AtomicBool>) -> Self {
        Self {
            listener,
            supervisor,
            running,
        }
    }

    pub(crate) fn run(self) {
        while let Some((stream, addr)) = accept_interruptible(&self.listener, &self.running) {
            info!(%addr, "Stream client connected");

            // Replacing the sink is atomic; the displaced socket is ours to
            // close.
            if let Some(old) = self.supervisor.set_stream_socket(Some(stream)) {
                let _ = old.shutdown(Shutdown::Both);
            }
        }

        // Clear the sink on the way out so no reader writes to a dead socket.
        if let Some(last) = self.supervisor.set_stream_socket(None) {
            let _ = last.shutdown(Shutdown::Both);
        }
    }
}
