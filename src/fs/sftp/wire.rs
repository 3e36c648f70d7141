//! Message framing for draft-ietf-secsh-filexfer-02.
//!
//! Every message is a big-endian u32 length, a type byte, a u32 request id
//! (except INIT/VERSION), then type-specific fields. Strings are a u32
//! length followed by raw bytes.

use crate::fs::{FsError, FsResult};

// Packet types (draft section 3).
pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;
pub const SSH_FXP_EXTENDED: u8 = 200;

// Attribute flag bits (draft section 5).
pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x0000_0001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x0000_0002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x0000_0004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x8000_0000;

// Open pflags (draft section 6.3).
pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;

// Status codes (draft section 7).
pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;

/// Rename extension honoured by OpenSSH servers; atomic where plain RENAME
/// refuses to replace an existing target.
pub const POSIX_RENAME_EXT: &str = "posix-rename@openssh.org";

/// Outgoing message body (everything after the length word).
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// A request carrying an id.
    pub fn new(packet_type: u8, id: u32) -> Self {
        let mut buf = Vec::with_capacity(32);
        buf.push(packet_type);
        buf.extend_from_slice(&id.to_be_bytes());
        Packet { buf }
    }

    /// The INIT handshake, which carries a version where the id would be.
    pub fn init(version: u32) -> Self {
        let mut buf = Vec::with_capacity(5);
        buf.push(SSH_FXP_INIT);
        buf.extend_from_slice(&version.to_be_bytes());
        Packet { buf }
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed string.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }
}

fn short(what: &str) -> FsError {
    FsError::Protocol(format!("truncated sftp reply: missing {what}"))
}

/// Cursor over a received message body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Positioned just past the type and request id.
    pub fn body(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 5 }
    }

    pub fn u8(&mut self) -> FsResult<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| short("byte"))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u32(&mut self) -> FsResult<u32> {
        let end = self.pos + 4;
        let raw = self.buf.get(self.pos..end).ok_or_else(|| short("u32"))?;
        self.pos = end;
        let mut word = [0u8; 4];
        word.copy_from_slice(raw);
        Ok(u32::from_be_bytes(word))
    }

    /// Length-prefixed string.
    pub fn bytes(&mut self) -> FsResult<&'a [u8]> {
        let len = self.u32()? as usize;
        let end = self.pos + len;
        let raw = self.buf.get(self.pos..end).ok_or_else(|| short("string"))?;
        self.pos = end;
        Ok(raw)
    }

    /// Skip a flag-guarded attribute block (used by READDIR entries).
    pub fn skip_attrs(&mut self) -> FsResult<()> {
        let flags = self.u32()?;
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            self.u32()?;
            self.u32()?;
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            self.u32()?;
            self.u32()?;
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            self.u32()?;
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            self.u32()?;
            self.u32()?;
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let mut count = self.u32()?;
            while count > 0 {
                self.bytes()?;
                self.bytes()?;
                count -= 1;
            }
        }
        Ok(())
    }
}

/// Packet type of a reply.
pub fn reply_type(reply: &[u8]) -> FsResult<u8> {
    reply.first().copied().ok_or_else(|| short("type"))
}

/// Request id of a reply (not valid for INIT/VERSION).
pub fn reply_id(reply: &[u8]) -> FsResult<u32> {
    let mut r = Reader::new(reply);
    r.u8()?;
    r.u32()
}

pub struct Status {
    pub code: u32,
    pub message: String,
}

/// Parse an SSH_FXP_STATUS reply. Any other packet type is a protocol error.
pub fn parse_status(reply: &[u8]) -> FsResult<Status> {
    let mut r = Reader::new(reply);
    let t = r.u8()?;
    if t != SSH_FXP_STATUS {
        return Err(FsError::Protocol(format!(
            "expected SSH_FXP_STATUS, got {t:#x}"
        )));
    }
    r.u32()?; // request id
    let code = r.u32()?;
    let message = String::from_utf8_lossy(r.bytes()?).into_owned();
    Ok(Status { code, message })
}
