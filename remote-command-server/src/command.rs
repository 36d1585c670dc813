//! Command channel: accepts one client at a time and serves its blocking
//! request/response loop until disconnect or shutdown.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info};

use remote_command_proto::{Instruction, RequestHeader, ResponseHeader};

use crate::fs;
use crate::process::{ProcessSupervisor, NO_PROCESS, PROCESS_TOKEN};
use crate::socket::accept_interruptible;

/// Shared handle to the command socket of the active session; shutdown shuts
/// it down to wake a read blocked in the dispatcher.
pub(crate) type ClientHandle = Arc<Mutex<Option<TcpStream>>>;

pub(crate) struct CommandAcceptor {
    listener: TcpListener,
    working_directory: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
    running: Arc<AtomicBool>,
    client: ClientHandle,
}

impl CommandAcceptor {
    pub(crate) fn new(
        listener: TcpListener,
        working_directory: PathBuf,
        supervisor: Arc<ProcessSupervisor>,
        running: Arc<AtomicBool>,
        client: ClientHandle,
    ) -> Self {
        Self {
            listener,
            working_directory,
            supervisor,
            running,
            client,
        }
    }

    pub(crate) fn run(mut self) {
        while let Some((stream, addr)) = accept_interruptible(&self.listener, &self.running) {
            info!(%addr, "Command client connected");

            *self.client.lock() = stream.try_clone().ok();

            let mut dispatcher = RequestDispatcher {
                stream,
                working_directory: &mut self.working_directory,
                supervisor: &self.supervisor,
                running: &self.running,
            };
            dispatcher.serve();

            // A child left behind by the client must not outlive its session.
            if self.supervisor.is_running() {
                self.supervisor.close(PROCESS_TOKEN);
            }

            *self.client.lock() = None;
            info!(%addr, "Command client disconnected");
        }
    }
}

struct Request {
    instruction: Instruction,
    payloads: [Vec<u8>; 4],
}

/// Serves one session: reads a framed request, executes it, writes the framed
/// response, repeats. Single-threaded and strictly sequential, so responses
/// never overlap.
struct RequestDispatcher<'a> {
    stream: TcpStream,
    working_directory: &'a mut PathBuf,
    supervisor: &'a ProcessSupervisor,
    running: &'a AtomicBool,
}

impl RequestDispatcher<'_> {
    fn serve(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            let request = match self.read_request() {
                Ok(request) => request,
                Err(error) => {
                    debug!(%error, "Session ended");
                    break;
                }
            };

            if let Err(error) = self.dispatch(request) {
                debug!(%error, "Session ended while responding");
                break;
            }
        }
    }

    /// Reads one request header and its four payloads. Any short read or
    /// malformed header terminates the session; no response is sent.
    fn read_request(&mut self) -> anyhow::Result<Request> {
        let mut raw = [0u8; RequestHeader::SIZE];
        self.stream.read_exact(&mut raw)?;
        let header = RequestHeader::decode(Bytes::copy_from_slice(&raw))?;

        let mut payloads: [Vec<u8>; 4] = Default::default();
        for (payload, length) in payloads.iter_mut().zip(header.payload_lengths) {
            if length > 0 {
                let mut data = vec![0u8; length as usize];
                self.stream.read_exact(&mut data)?;
                *payload = data;
            }
        }

        Ok(Request {
            instruction: header.instruction,
            payloads,
        })
    }

    fn dispatch(&mut self, request: Request) -> anyhow::Result<()> {
        let instruction = request.instruction;
        let [p0, p1, _p2, _p3] = request.payloads;

        debug!(%instruction, "Dispatching request");

        match instruction {
            Instruction::CurrentWorkingDirectory => {
                let cwd = self.working_directory.to_string_lossy().into_owned();
                self.respond(instruction, cwd.as_bytes())
            }
            Instruction::MoveCurrentWorkingDirectory => {
                let target = fs::resolve_path(self.working_directory, &text(&p0));
                let ok = target.is_dir();
                if ok {
                    *self.working_directory = target;
                }
                self.respond_flag(instruction, ok)
            }
            Instruction::DirectoryExists => {
                let target = fs::resolve_path(self.working_directory, &text(&p0));
                self.respond_flag(instruction, target.is_dir())
            }
            Instruction::ListDirectoryContents => {
                let input = text(&p0);
                let path = if input.is_empty() { "." } else { &input };
                let listing = fs::list_directory(&fs::resolve_path(self.working_directory, path));

                let mut payload = BytesMut::with_capacity(listing.size());
                listing.encode(&mut payload);
                self.respond(instruction, &payload)
            }
            Instruction::CreateDirectory => {
                let target = fs::resolve_path(self.working_directory, &text(&p0));
                self.respond_flag(instruction, fs::create_directory(&target))
            }
            Instruction::RemoveDirectory => {
                let target = fs::resolve_path(self.working_directory, &text(&p0));
                self.respond_flag(instruction, fs::remove_directory(&target))
            }
            Instruction::CopyDirectory => {
                let from = fs::resolve_path(self.working_directory, &text(&p0));
                let to = fs::resolve_path(self.working_directory, &text(&p1));
                self.respond_flag(instruction, fs::copy_directory(&from, &to))
            }
            Instruction::MoveDirectory => {
                let from = fs::resolve_path(self.working_directory, &text(&p0));
                let to = fs::resolve_path(self.working_directory, &text(&p1));
                self.respond_flag(instruction, fs::move_directory(&from, &to))
            }
            Instruction::RunCommand => {
                // Synchronous execution: the empty response goes out only
                // after the child exited and both pipes drained.
                let token = self.supervisor.execute(self.working_directory, &text(&p0));
                if token != NO_PROCESS {
                    self.supervisor.await_process(token);
                }
                self.respond(instruction, &[])
            }
            Instruction::OpenProcess => {
                let token = self.supervisor.execute(self.working_directory, &text(&p0));
                self.respond(instruction, &token.to_le_bytes())
            }
            Instruction::CloseProcess => {
                let token = match p0.get(..4) {
                    Some(bytes) => i32::from_le_bytes(bytes.try_into().expect("BUG: length checked")),
                    None => NO_PROCESS,
                };

                if token != NO_PROCESS {
                    self.supervisor.close(token);
                }
                self.respond(instruction, &[])
            }
            Instruction::UploadFile => {
                let target = fs::resolve_path(self.working_directory, &text(&p0));
                self.respond_flag(instruction, fs::write_file(&target, &p1))
            }
            Instruction::DownloadFile => {
                let target = fs::resolve_path(self.working_directory, &text(&p0));
                match fs::read_file(&target) {
                    Some(data) => {
                        let mut payload = Vec::with_capacity(1 + data.len());
                        payload.push(1);
                        payload.extend_from_slice(&data);
                        self.respond(instruction, &payload)
                    }
                    None => self.respond(instruction, &[0]),
                }
            }
        }
    }

    fn respond(&mut self, instruction: Instruction, payload: &[u8]) -> anyhow::Result<()> {
        let mut header = BytesMut::with_capacity(ResponseHeader::SIZE);
        ResponseHeader::new(instruction, payload.len() as u32).encode(&mut header);

        self.stream.write_all(&header)?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    fn respond_flag(&mut self, instruction: Instruction, flag: bool) -> anyhow::Result<()> {
        self.respond(instruction, &[u8::from(flag)])
    }
}

fn text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
