//! Lifetime root of the server: binds the three ports, spawns the service
//! threads, and tears everything down on close.

use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::Context as _;
use parking_lot::Mutex;
use tracing::info;

use crate::command::{ClientHandle, CommandAcceptor};
use crate::discovery::DiscoveryResponder;
use crate::process::ProcessSupervisor;
use crate::socket::{bind_tcp_listener, bind_udp_socket};
use crate::stream::StreamAcceptor;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub discovery_port: u16,
    pub command_port: u16,
    pub stream_port: u16,
    /// Initial working directory; empty means the process CWD.
    pub working_directory: String,
}

/// A running server. Ends with [`close`](Self::close) (or on drop).
pub struct RemoteCommandServer {
    running: Arc<AtomicBool>,
    command_client: ClientHandle,
    command_addr: SocketAddr,
    stream_addr: SocketAddr,
    discovery_addr: SocketAddr,
    command_thread: Option<JoinHandle<()>>,
    stream_thread: Option<JoinHandle<()>>,
    discovery_thread: Option<JoinHandle<()>>,
}

impl RemoteCommandServer {
    /// Binds all three ports and starts the service threads. Port 0 binds an
    /// ephemeral port; the discovery responder always advertises the ports
    /// actually bound.
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        let command_listener = bind_tcp_listener(config.command_port)
            .with_context(|| format!("failed to bind command port {}", config.command_port))?;
        let stream_listener = bind_tcp_listener(config.stream_port)
            .with_context(|| format!("failed to bind stream port {}", config.stream_port))?;
        let discovery_socket = bind_udp_socket(config.discovery_port)
            .with_context(|| format!("failed to bind discovery port {}", config.discovery_port))?;

        let command_addr = command_listener.local_addr().context("command listener address")?;
        let stream_addr = stream_listener.local_addr().context("stream listener address")?;
        let discovery_addr = discovery_socket.local_addr().context("discovery socket address")?;

        let working_directory = crate::fs::initial_working_directory(&config.working_directory);
        info!(cwd = %working_directory.display(), "Initial working directory");

        let running = Arc::new(AtomicBool::new(true));
        let supervisor = Arc::new(ProcessSupervisor::new());
        let command_client: ClientHandle = Arc::new(Mutex::new(None));

        let command_thread = std::thread::Builder::new()
            .name("rc-command".to_owned())
            .spawn({
                let acceptor = CommandAcceptor::new(
                    command_listener,
                    working_directory,
                    Arc::clone(&supervisor),
                    Arc::clone(&running),
                    Arc::clone(&command_client),
                );
                move || acceptor.run()
            })
            .context("failed to spawn command acceptor thread")?;

        let stream_thread = std::thread::Builder::new()
            .name("rc-stream".to_owned())
            .spawn({
                let acceptor = StreamAcceptor::new(stream_listener, Arc::clone(&supervisor), Arc::clone(&running));
                move || acceptor.run()
            })
            .context("failed to spawn stream acceptor thread")?;

        let discovery_thread = std::thread::Builder::new()
            .name("rc-discovery".to_owned())
            .spawn({
                let responder = DiscoveryResponder::new(
                    discovery_socket,
                    command_addr.port(),
                    stream_addr.port(),
                    Arc::clone(&running),
                );
                move || responder.run()
            })
            .context("failed to spawn discovery thread")?;

        info!(
            %command_addr,
            %stream_addr,
            %discovery_addr,
            "Server listening"
        );

        Ok(Self {
            running,
            command_client,
            command_addr,
            stream_addr,
            discovery_addr,
            command_thread: Some(command_thread),
            stream_thread: Some(stream_thread),
            discovery_thread: Some(discovery_thread),
        })
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.command_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Orderly shutdown: flips the running flag, wakes the dispatcher's
    /// blocked read, and joins every service thread. When this returns no
    /// server socket, thread, or child process remains.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.command_thread.is_none() && self.stream_thread.is_none() && self.discovery_thread.is_none() {
            return;
        }

        self.running.store(false, Ordering::SeqCst);

        // Wake a dispatcher blocked reading the active session's socket. The
        // acceptors wake on their own 100 ms poll.
        if let Some(client) = self.command_client.lock().take() {
            let _ = client.shutdown(Shutdown::Both);
        }

        for thread in [
            self.command_thread.take(),
            self.stream_thread.take(),
            self.discovery_thread.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = thread.join();
        }

        info!("Server stopped");
    }
}

impl Drop for RemoteCommandServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
