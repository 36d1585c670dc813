//! Server core for the remote command protocol: a command channel serving a
//! blocking request/response loop, a stream channel carrying live child
//! process output, a process supervisor owning at most one child at a time,
//! and a UDP discovery responder advertising the TCP ports.

mod command;
mod discovery;
mod fs;
mod process;
mod socket;
mod stream;

pub mod server;

pub use server::{RemoteCommandServer, ServerConfig};
