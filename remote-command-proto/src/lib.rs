//! Wire model for the remote command protocol.
//!
//! Three fixed-size little-endian headers share the 4-byte magic `"RMT_"`:
//! requests carry up to four length-prefixed payloads on the command channel,
//! responses carry one, and stream frames carry chunks of child-process
//! stdout/stderr on the stream channel. The discovery datagram advertises the
//! TCP ports over UDP.

use core::fmt;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

/// Magic prefix identifying every frame of the protocol.
pub const MAGIC: [u8; 4] = *b"RMT_";

/// Advertised name of the command port in discovery responses.
pub const PORT_NAME_COMMAND: &str = "RC_CMD";

/// Advertised name of the stream port in discovery responses.
pub const PORT_NAME_STREAM: &str = "RC_STREAM";

#[derive(Debug)]
pub enum Error {
    InvalidMagic {
        name: &'static str,
        found: [u8; 4],
    },
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    InvalidField {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMagic { name, found } => {
                write!(f, "Invalid magic in {}: {:02X?}", name, found)
            }
            Error::NotEnoughBytes {
                name,
                received,
                expected,
            } => write!(
                f,
                "Not enough bytes provided to decode {}: received {} bytes, expected {} bytes",
                name, received, expected
            ),
            Error::InvalidField { name, field, reason } => {
                write!(f, "Invalid `{}` in {}: {}", field, name, reason)
            }
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
    (plain $packet_struct:ident in $buf:ident) => {{
        ensure_size!($buf[$packet_struct::SIZE] for $packet_struct::NAME)
    }};
}

fn decode_magic(name: &'static str, buf: &mut Bytes) -> Result<(), Error> {
    let mut found = [0u8; 4];
    buf.copy_to_slice(&mut found);
    if found != MAGIC {
        return Err(Error::InvalidMagic { name, found });
    }
    Ok(())
}

/// Operation selector carried by every request header.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    CurrentWorkingDirectory = 0x1000_1000,
    MoveCurrentWorkingDirectory = 0x1000_1001,
    DirectoryExists = 0x1000_1002,
    ListDirectoryContents = 0x1000_1003,
    CreateDirectory = 0x1000_1004,
    RemoveDirectory = 0x1000_1005,
    CopyDirectory = 0x1000_1006,
    MoveDirectory = 0x1000_1007,
    RunCommand = 0x1000_2000,
    OpenProcess = 0x1000_2001,
    CloseProcess = 0x1000_2002,
    UploadFile = 0x1000_3000,
    DownloadFile = 0x1000_3001,
}

impl TryFrom<i32> for Instruction {
    type Error = Error;

    fn try_from(v: i32) -> Result<Instruction, Error> {
        match v {
            0x1000_1000 => Ok(Instruction::CurrentWorkingDirectory),
            0x1000_1001 => Ok(Instruction::MoveCurrentWorkingDirectory),
            0x1000_1002 => Ok(Instruction::DirectoryExists),
            0x1000_1003 => Ok(Instruction::ListDirectoryContents),
            0x1000_1004 => Ok(Instruction::CreateDirectory),
            0x1000_1005 => Ok(Instruction::RemoveDirectory),
            0x1000_1006 => Ok(Instruction::CopyDirectory),
            0x1000_1007 => Ok(Instruction::MoveDirectory),
            0x1000_2000 => Ok(Instruction::RunCommand),
            0x1000_2001 => Ok(Instruction::OpenProcess),
            0x1000_2002 => Ok(Instruction::CloseProcess),
            0x1000_3000 => Ok(Instruction::UploadFile),
            0x1000_3001 => Ok(Instruction::DownloadFile),
            _ => Err(Error::InvalidField {
                name: RequestHeader::NAME,
                field: "instruction",
                reason: "unknown value",
            }),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Instruction::CurrentWorkingDirectory => "CURRENT_WORKING_DIRECTORY",
            Instruction::MoveCurrentWorkingDirectory => "MOVE_CURRENT_WORKING_DIRECTORY",
            Instruction::DirectoryExists => "DIRECTORY_EXISTS",
            Instruction::ListDirectoryContents => "LIST_DIRECTORY_CONTENTS",
            Instruction::CreateDirectory => "CREATE_DIRECTORY",
            Instruction::RemoveDirectory => "REMOVE_DIRECTORY",
            Instruction::CopyDirectory => "COPY_DIRECTORY",
            Instruction::MoveDirectory => "MOVE_DIRECTORY",
            Instruction::RunCommand => "RUN_COMMAND",
            Instruction::OpenProcess => "OPEN_PROCESS",
            Instruction::CloseProcess => "CLOSE_PROCESS",
            Instruction::UploadFile => "UPLOAD_FILE",
            Instruction::DownloadFile => "DOWNLOAD_FILE",
        };
        f.write_str(name)
    }
}

/// Request header: magic, instruction, then the lengths of the four payloads
/// that follow on the wire.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub instruction: Instruction,
    pub payload_lengths: [u32; 4],
}

impl RequestHeader {
    pub const NAME: &'static str = "REQUEST HEADER";
    pub const SIZE: usize = 4 /* magic */ + 4 /* instruction */ + 4 * 4 /* payload lengths */;

    pub fn new(instruction: Instruction, payload_lengths: [u32; 4]) -> Self {
        Self {
            instruction,
            payload_lengths,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_i32_le(self.instruction as i32);
        for len in self.payload_lengths {
            buf.put_u32_le(len);
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);

        decode_magic(Self::NAME, &mut buf)?;
        let instruction = Instruction::try_from(buf.get_i32_le())?;
        let payload_lengths = [
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
        ];

        Ok(Self {
            instruction,
            payload_lengths,
        })
    }
}

/// Response header: echoes the request instruction and prefixes one payload.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub instruction: Instruction,
    pub payload_length: u32,
}

impl ResponseHeader {
    pub const NAME: &'static str = "RESPONSE HEADER";
    pub const SIZE: usize = 4 /* magic */ + 4 /* instruction */ + 4 /* payload length */ + 4 /* reserved */;

    pub fn new(instruction: Instruction, payload_length: u32) -> Self {
        Self {
            instruction,
            payload_length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_i32_le(self.instruction as i32);
        buf.put_u32_le(self.payload_length);
        buf.put_u32_le(0);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);

        decode_magic(Self::NAME, &mut buf)?;
        let instruction = Instruction::try_from(buf.get_i32_le())?;
        let payload_length = buf.get_u32_le();
        let _reserved = buf.get_u32_le();

        Ok(Self {
            instruction,
            payload_length,
        })
    }
}

/// Which pipe of the child process a stream chunk was read from.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Output = 0x3000,
    Error = 0x4000,
}

impl TryFrom<i32> for StreamKind {
    type Error = Error;

    fn try_from(v: i32) -> Result<StreamKind, Error> {
        match v {
            0x3000 => Ok(StreamKind::Output),
            0x4000 => Ok(StreamKind::Error),
            _ => Err(Error::InvalidField {
                name: StreamHeader::NAME,
                field: "type",
                reason: "unknown value",
            }),
        }
    }
}

/// Stream header: prefixes one chunk of child stdout or stderr.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub kind: StreamKind,
    pub payload_length: u32,
}

impl StreamHeader {
    pub const NAME: &'static str = "STREAM HEADER";
    pub const SIZE: usize = 4 /* magic */ + 4 /* type */ + 4 /* payload length */ + 4 /* reserved */;

    pub fn new(kind: StreamKind, payload_length: u32) -> Self {
        Self { kind, payload_length }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_i32_le(self.kind as i32);
        buf.put_u32_le(self.payload_length);
        buf.put_u32_le(0);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);

        decode_magic(Self::NAME, &mut buf)?;
        let kind = StreamKind::try_from(buf.get_i32_le())?;
        let payload_length = buf.get_u32_le();
        let _reserved = buf.get_u32_le();

        Ok(Self { kind, payload_length })
    }
}

/// Kind discriminant of a directory listing record.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File = 0x1000,
    Directory = 0x2000,
}

impl TryFrom<i32> for EntryKind {
    type Error = Error;

    fn try_from(v: i32) -> Result<EntryKind, Error> {
        match v {
            0x1000 => Ok(EntryKind::File),
            0x2000 => Ok(EntryKind::Directory),
            _ => Err(Error::InvalidField {
                name: DirectoryEntry::NAME,
                field: "type",
                reason: "unknown value",
            }),
        }
    }
}

/// One fixed-size record of a LIST_DIRECTORY_CONTENTS response.
///
/// The name occupies a 128-byte NUL-padded field; names longer than 127 bytes
/// are truncated at encode time, so distinct long names may collide.
#[derive(Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub kind: EntryKind,
    pub name: String,
}

impl DirectoryEntry {
    pub const NAME: &'static str = "DIRECTORY ENTRY";
    pub const NAME_FIELD_SIZE: usize = 128;
    pub const SIZE: usize = 4 /* type */ + Self::NAME_FIELD_SIZE;

    pub fn new(kind: EntryKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.kind as i32);

        let bytes = self.name.as_bytes();
        let len = bytes.len().min(Self::NAME_FIELD_SIZE - 1);
        buf.put_slice(&bytes[..len]);
        buf.put_bytes(0, Self::NAME_FIELD_SIZE - len);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);

        let kind = EntryKind::try_from(buf.get_i32_le())?;
        let field = buf.split_to(Self::NAME_FIELD_SIZE);
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let name = String::from_utf8_lossy(&field[..end]).into_owned();

        Ok(Self { kind, name })
    }
}

/// Payload of a LIST_DIRECTORY_CONTENTS response: a count followed by that
/// many fixed-size records.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct DirectoryListing {
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryListing {
    pub const NAME: &'static str = "DIRECTORY LISTING";
    pub const FIXED_PART_SIZE: usize = 4 /* count */;

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.entries.len() * DirectoryEntry::SIZE
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode(buf);
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::FIXED_PART_SIZE] for Self::NAME);

        let count = buf.get_u32_le() as usize;
        ensure_size!(buf[count * DirectoryEntry::SIZE] for Self::NAME);

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(DirectoryEntry::decode(buf.split_to(DirectoryEntry::SIZE))?);
        }

        Ok(Self { entries })
    }
}

/// One `(name, port)` pair advertised by the discovery responder.
#[derive(Debug, PartialEq, Eq)]
pub struct PortAdvertisement {
    pub name: String,
    pub port: u16,
}

impl PortAdvertisement {
    pub const NAME: &'static str = "PORT ADVERTISEMENT";
    pub const FIXED_PART_SIZE: usize = 4 /* name length */ + 4 /* port */;

    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.name.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.name.len() as u32);
        buf.put_slice(self.name.as_bytes());
        buf.put_u32_le(u32::from(self.port));
    }

    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        ensure_size!(buf[4] for Self::NAME);
        let name_len = buf.get_u32_le() as usize;
        ensure_size!(buf[name_len + 4] for Self::NAME);

        let name_bytes = buf.split_to(name_len);
        let name = std::str::from_utf8(&name_bytes)
            .map_err(|_| Error::InvalidField {
                name: Self::NAME,
                field: "name",
                reason: "not valid UTF-8",
            })?
            .to_owned();

        let port = u16::try_from(buf.get_u32_le()).map_err(|_| Error::InvalidField {
            name: Self::NAME,
            field: "port",
            reason: "does not fit in u16",
        })?;

        Ok(Self { name, port })
    }
}

/// Datagram sent back to any discovery probe, listing the server's TCP ports
/// under their well-known names.
#[derive(Debug, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub ports: Vec<PortAdvertisement>,
}

impl DiscoveryResponse {
    pub const NAME: &'static str = "DISCOVERY RESPONSE";
    pub const FIXED_PART_SIZE: usize = 4 /* magic */ + 4 /* count */;

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.ports.iter().map(PortAdvertisement::size).sum::<usize>()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u32_le(self.ports.len() as u32);
        for port in &self.ports {
            port.encode(buf);
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::FIXED_PART_SIZE] for Self::NAME);

        decode_magic(Self::NAME, &mut buf)?;
        let count = buf.get_u32_le() as usize;

        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            ports.push(PortAdvertisement::decode(&mut buf)?);
        }

        Ok(Self { ports })
    }
}
