//! Minimal wire client used to exercise the server end to end. The real
//! client library is a separate project; this speaks just enough of the
//! protocol for the tests.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use remote_command_proto::{
    DirectoryListing, Instruction, RequestHeader, ResponseHeader, StreamHeader, StreamKind,
};

#[derive(Default)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct TestClient {
    command: TcpStream,
    stream_wake: TcpStream,
    stream_thread: Option<JoinHandle<()>>,
    output: Arc<Mutex<CapturedOutput>>,
}

impl TestClient {
    /// Connects the command socket first, then the stream socket, as the
    /// protocol requires, and starts capturing stream chunks.
    pub fn connect(command_addr: SocketAddr, stream_addr: SocketAddr) -> Self {
        let command = TcpStream::connect(loopback(command_addr)).expect("connect command socket");
        let stream = TcpStream::connect(loopback(stream_addr)).expect("connect stream socket");
        let stream_wake = stream.try_clone().expect("clone stream socket");

        let output = Arc::new(Mutex::new(CapturedOutput::default()));
        let stream_thread = std::thread::spawn({
            let output = Arc::clone(&output);
            move || capture_stream(stream, output)
        });

        Self {
            command,
            stream_wake,
            stream_thread: Some(stream_thread),
            output,
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().stderr).into_owned()
    }

    pub fn clear_output(&self) {
        let mut output = self.output.lock();
        output.stdout.clear();
        output.stderr.clear();
    }

    pub fn cwd(&mut self) -> String {
        let payload = self.request(Instruction::CurrentWorkingDirectory, [&[]; 4]);
        String::from_utf8(payload).expect("cwd is UTF-8")
    }

    pub fn move_cwd(&mut self, path: &str) -> bool {
        self.request_flag(Instruction::MoveCurrentWorkingDirectory, path)
    }

    pub fn directory_exists(&mut self, path: &str) -> bool {
        self.request_flag(Instruction::DirectoryExists, path)
    }

    pub fn list(&mut self, path: &str) -> DirectoryListing {
        let payload = self.request(Instruction::ListDirectoryContents, [path.as_bytes(), &[], &[], &[]]);
        DirectoryListing::decode(Bytes::from(payload)).expect("decode listing")
    }

    pub fn create_directory(&mut self, path: &str) -> bool {
        self.request_flag(Instruction::CreateDirectory, path)
    }

    pub fn remove_directory(&mut self, path: &str) -> bool {
        self.request_flag(Instruction::RemoveDirectory, path)
    }

    pub fn copy_directory(&mut self, from: &str, to: &str) -> bool {
        let payload = self.request(Instruction::CopyDirectory, [from.as_bytes(), to.as_bytes(), &[], &[]]);
        payload == [1]
    }

    pub fn move_directory(&mut self, from: &str, to: &str) -> bool {
        let payload = self.request(Instruction::MoveDirectory, [from.as_bytes(), to.as_bytes(), &[], &[]]);
        payload == [1]
    }

    /// Blocks until the server has executed the command and drained its
    /// output; the response payload is empty by contract.
    pub fn run_command(&mut self, command_line: &str) {
        let payload = self.request(Instruction::RunCommand, [command_line.as_bytes(), &[], &[], &[]]);
        assert!(payload.is_empty(), "RUN_COMMAND response carries no payload");
    }

    pub fn open_process(&mut self, command_line: &str) -> i32 {
        let payload = self.request(Instruction::OpenProcess, [command_line.as_bytes(), &[], &[], &[]]);
        i32::from_le_bytes(payload.try_into().expect("process token is 4 bytes"))
    }

    pub fn close_process(&mut self, token: i32) {
        let payload = self.request(Instruction::CloseProcess, [&token.to_le_bytes(), &[], &[], &[]]);
        assert!(payload.is_empty(), "CLOSE_PROCESS response carries no payload");
    }

    pub fn upload(&mut self, path: &str, data: &[u8]) -> bool {
        let payload = self.request(Instruction::UploadFile, [path.as_bytes(), data, &[], &[]]);
        payload == [1]
    }

    pub fn download(&mut self, path: &str) -> Option<Vec<u8>> {
        let payload = self.request(Instruction::DownloadFile, [path.as_bytes(), &[], &[], &[]]);
        match payload.split_first() {
            Some((&1, data)) => Some(data.to_vec()),
            Some((&0, rest)) => {
                assert!(rest.is_empty(), "failed download carries a single status byte");
                None
            }
            other => panic!("malformed download response: {other:?}"),
        }
    }

    fn request_flag(&mut self, instruction: Instruction, path: &str) -> bool {
        let payload = self.request(instruction, [path.as_bytes(), &[], &[], &[]]);
        payload == [1]
    }

    /// One request, one response: the command channel is strictly sequential.
    fn request(&mut self, instruction: Instruction, payloads: [&[u8]; 4]) -> Vec<u8> {
        let header = RequestHeader::new(instruction, payloads.map(|p| p.len() as u32));
        let mut buf = BytesMut::with_capacity(RequestHeader::SIZE);
        header.encode(&mut buf);

        self.command.write_all(&buf).expect("send request header");
        for payload in payloads {
            if !payload.is_empty() {
                self.command.write_all(payload).expect("send request payload");
            }
        }

        let mut raw = [0u8; ResponseHeader::SIZE];
        self.command.read_exact(&mut raw).expect("receive response header");
        let response = ResponseHeader::decode(Bytes::copy_from_slice(&raw)).expect("decode response header");
        assert_eq!(response.instruction, instruction, "response echoes the request instruction");

        let mut payload = vec![0u8; response.payload_length as usize];
        self.command.read_exact(&mut payload).expect("receive response payload");
        payload
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        let _ = self.command.shutdown(Shutdown::Both);
        let _ = self.stream_wake.shutdown(Shutdown::Both);
        if let Some(thread) = self.stream_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Decodes framed stream chunks until the socket closes. A malformed frame
/// (wrong magic, unknown kind) aborts the capture, so any mid-frame
/// interleaving on the server side would surface as missing output.
fn capture_stream(mut stream: TcpStream, output: Arc<Mutex<CapturedOutput>>) {
    loop {
        let mut raw = [0u8; StreamHeader::SIZE];
        if stream.read_exact(&mut raw).is_err() {
            break;
        }
        let Ok(header) = StreamHeader::decode(Bytes::copy_from_slice(&raw)) else {
            break;
        };

        let mut payload = vec![0u8; header.payload_length as usize];
        if stream.read_exact(&mut payload).is_err() {
            break;
        }

        let mut output = output.lock();
        match header.kind {
            StreamKind::Output => output.stdout.extend_from_slice(&payload),
            StreamKind::Error => output.stderr.extend_from_slice(&payload),
        }
    }
}

/// The server binds `0.0.0.0`; connect over loopback.
fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
}
