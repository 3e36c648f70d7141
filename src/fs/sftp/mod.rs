//! SFTP filesystem driver: filexfer-02 version 3 over a piped `ssh`
//! subprocess, with request pipelining.
//!
//! A single connection carries everything. Replies are correlated by request
//! id into a `replies` table; ids in the `ignored` set (closed handles,
//! abandoned probes) are dropped on arrival. Before every send the driver
//! drains whatever the server already wrote, so the peer never blocks on
//! output backpressure.

pub mod wire;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::io::{BufReader, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;

use super::{FsError, FsFile, FsResult, Filesystem, OpenMode, PathType};
use crate::utils::config::SftpConsts;
use wire::{Packet, Reader};

/// Refuse replies claiming to be longer than this; a frame this size means
/// the stream is garbage, not a real server.
const MAX_REPLY_LEN: usize = 256 * 1024 * 1024;

fn path_bytes(path: &Path) -> &[u8] {
    path.as_os_str().as_bytes()
}

fn io_err(e: FsError) -> std::io::Error {
    std::io::Error::other(e)
}

pub struct SftpFilesystem {
    client: Rc<RefCell<SftpClient>>,
}

impl SftpFilesystem {
    pub fn new(user_host: &str, server_path: Option<String>, posix_rename: bool) -> Self {
        SftpFilesystem {
            client: Rc::new(RefCell::new(SftpClient {
                user_host: user_host.to_string(),
                server_path,
                posix_rename,
                child: None,
                to_server: None,
                from_server: None,
                next_id: 1,
                replies: HashMap::new(),
                ignored: HashSet::new(),
                existence: HashMap::new(),
                existence_inflight: VecDeque::new(),
            })),
        }
    }
}

impl Filesystem for SftpFilesystem {
    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        self.client.borrow_mut().rename_remote(old, new)
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        let mut c = self.client.borrow_mut();
        match c.unlink(path) {
            // Removal failure usually means it's a directory.
            Err(FsError::Sftp {
                status: wire::SSH_FX_FAILURE,
                ..
            }) => c.rmdir(path),
            r => r,
        }
    }

    fn open(&self, path: &Path, mode: OpenMode) -> FsResult<Box<dyn FsFile>> {
        let handle = self.client.borrow_mut().open_remote(path, mode)?;
        Ok(Box::new(SftpFile {
            client: Rc::clone(&self.client),
            path: path.to_path_buf(),
            handle,
            read_queue: VecDeque::new(),
            read_buf: Vec::new(),
            read_pos: 0,
            read_offset: 0,
            eof: false,
            write_queue: VecDeque::new(),
            write_offset: 0,
        }))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.client.borrow_mut().mkdir_remote(path, mode)
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        self.client.borrow_mut().exists_remote(path)
    }

    fn contents(&self, path: &Path) -> FsResult<Vec<OsString>> {
        self.client.borrow_mut().read_dir(path)
    }

    fn path_type(&self, path: &Path) -> FsResult<PathType> {
        self.client.borrow_mut().remote_type(path)
    }

    fn prefigure_exists(&self, path: &Path) -> FsResult<()> {
        self.client.borrow_mut().prefigure(path)
    }
}

struct SftpClient {
    user_host: String,
    server_path: Option<String>,
    posix_rename: bool,
    child: Option<Child>,
    to_server: Option<ChildStdin>,
    from_server: Option<BufReader<ChildStdout>>,
    next_id: u32,
    /// Replies that arrived before anyone awaited them.
    replies: HashMap<u32, Vec<u8>>,
    /// Request ids whose replies are to be discarded on arrival.
    ignored: HashSet<u32>,
    /// Prefetched existence results, consumed once per lookup.
    existence: HashMap<PathBuf, bool>,
    existence_inflight: VecDeque<(u32, PathBuf)>,
}

impl SftpClient {
    /// Connect and run the version handshake. Idempotent.
    fn init(&mut self) -> FsResult<()> {
        if self.to_server.is_some() {
            return Ok(());
        }
        log::debug!("connecting to {}", self.user_host);

        let mut cmd = Command::new("ssh");
        match &self.server_path {
            Some(server) => {
                cmd.args(["-x", "-T"]).arg(&self.user_host).arg(server);
            }
            None => {
                cmd.args(["-x", "-s"]).arg(&self.user_host).arg("sftp");
            }
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| FsError::io("executing", Path::new("ssh"), e))?;
        self.to_server = child.stdin.take();
        self.from_server = child.stdout.take().map(BufReader::new);
        self.child = Some(child);

        self.send(&Packet::init(SftpConsts::PROTO_VERSION))?;
        let reply = self.recv()?;
        let t = wire::reply_type(&reply)?;
        if t != wire::SSH_FXP_VERSION {
            return Err(FsError::Protocol(format!(
                "expected SSH_FXP_VERSION, got {t:#x}"
            )));
        }
        let mut r = Reader::new(&reply);
        r.u8()?;
        let version = r.u32()?;
        if version < SftpConsts::PROTO_VERSION {
            return Err(FsError::Protocol(format!(
                "expected SFTP version at least {}, got {version}",
                SftpConsts::PROTO_VERSION
            )));
        }
        Ok(())
    }

    /// Fresh request id. Ids start at 1 and are never reused; 0 is reserved.
    fn new_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    /// Frame and send one message, first draining anything the server has
    /// already written so it never blocks on its output pipe.
    fn send(&mut self, pkt: &Packet) -> FsResult<()> {
        while self.readable()? {
            self.poll()?;
        }
        let payload = pkt.payload();
        let out = self
            .to_server
            .as_mut()
            .ok_or_else(|| FsError::Protocol("sftp connection is not open".into()))?;
        out.write_all(&(payload.len() as u32).to_be_bytes())
            .and_then(|_| out.write_all(payload))
            .map_err(|e| FsError::Protocol(format!("writing to ssh subprocess: {e}")))
    }

    /// True if a read from the server would not block.
    fn readable(&mut self) -> FsResult<bool> {
        let Some(r) = self.from_server.as_ref() else {
            return Ok(false);
        };
        if !r.buffer().is_empty() {
            return Ok(true);
        }
        let mut fds = libc::pollfd {
            fd: r.get_ref().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let n = unsafe { libc::poll(&mut fds, 1, 0) };
            if n < 0 {
                let e = std::io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(FsError::Protocol(format!("poll: {e}")));
            }
            return Ok(n > 0);
        }
    }

    /// Read one framed message.
    fn recv(&mut self) -> FsResult<Vec<u8>> {
        let r = self
            .from_server
            .as_mut()
            .ok_or_else(|| FsError::Protocol("sftp connection is not open".into()))?;
        let mut lenbuf = [0u8; 4];
        r.read_exact(&mut lenbuf)
            .map_err(|e| FsError::Protocol(format!("reading sftp reply length: {e}")))?;
        let len = u32::from_be_bytes(lenbuf) as usize;
        if len == 0 || len > MAX_REPLY_LEN {
            return Err(FsError::Protocol(format!("bad sftp reply length {len}")));
        }
        let mut reply = vec![0u8; len];
        r.read_exact(&mut reply)
            .map_err(|e| FsError::Protocol(format!("sftp reply truncated: {e}")))?;
        Ok(reply)
    }

    /// Receive one reply and file it: dropped if its id is ignored, stored
    /// otherwise.
    fn poll(&mut self) -> FsResult<()> {
        let reply = self.recv()?;
        let id = wire::reply_id(&reply)?;
        if !self.ignored.remove(&id) {
            self.replies.insert(id, reply);
        }
        Ok(())
    }

    fn await_reply(&mut self, id: u32) -> FsResult<Vec<u8>> {
        loop {
            if let Some(reply) = self.replies.remove(&id) {
                return Ok(reply);
            }
            self.poll()?;
        }
    }

    /// True if the reply to `id` has already arrived.
    fn ready(&self, id: u32) -> bool {
        self.replies.contains_key(&id)
    }

    /// Discard the reply to `id` whenever it shows up.
    fn ignore(&mut self, id: u32) {
        self.replies.remove(&id);
        self.ignored.insert(id);
    }

    /// Turn an SSH_FXP_STATUS reply into an error unless it reports success
    /// (or EOF, where the caller allows it).
    fn check_reply(op: &'static str, path: &Path, reply: &[u8], allow_eof: bool) -> FsResult<()> {
        let st = wire::parse_status(reply)?;
        if st.code == wire::SSH_FX_OK || (allow_eof && st.code == wire::SSH_FX_EOF) {
            return Ok(());
        }
        Err(FsError::Sftp {
            op,
            path: path.to_path_buf(),
            message: st.message,
            status: st.code,
        })
    }

    fn await_status(
        &mut self,
        op: &'static str,
        path: &Path,
        id: u32,
        allow_eof: bool,
    ) -> FsResult<()> {
        let reply = self.await_reply(id)?;
        Self::check_reply(op, path, &reply, allow_eof)
    }

    /// Send CLOSE for a handle and return the request id without waiting.
    fn close_handle(&mut self, handle: &[u8]) -> FsResult<u32> {
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_CLOSE, id);
        pkt.put_bytes(handle);
        self.send(&pkt)?;
        Ok(id)
    }

    fn open_remote(&mut self, path: &Path, mode: OpenMode) -> FsResult<Vec<u8>> {
        self.init()?;
        let pflags = match mode {
            OpenMode::ReadOnly => wire::SSH_FXF_READ,
            OpenMode::Overwrite => wire::SSH_FXF_WRITE | wire::SSH_FXF_CREAT | wire::SSH_FXF_TRUNC,
            OpenMode::NoOverwrite => wire::SSH_FXF_WRITE | wire::SSH_FXF_CREAT | wire::SSH_FXF_EXCL,
        };
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_OPEN, id);
        pkt.put_bytes(path_bytes(path)).put_u32(pflags).put_u32(0); // no attrs
        self.send(&pkt)?;
        let reply = self.await_reply(id)?;
        if wire::reply_type(&reply)? != wire::SSH_FXP_HANDLE {
            Self::check_reply("opening", path, &reply, false)?;
            return Err(FsError::Protocol("unexpected reply to SSH_FXP_OPEN".into()));
        }
        Ok(Reader::body(&reply).bytes()?.to_vec())
    }

    fn rename_remote(&mut self, old: &Path, new: &Path) -> FsResult<()> {
        self.init()?;
        let id = self.new_id();
        let mut pkt;
        if self.posix_rename {
            pkt = Packet::new(wire::SSH_FXP_EXTENDED, id);
            pkt.put_bytes(wire::POSIX_RENAME_EXT.as_bytes())
                .put_bytes(path_bytes(old))
                .put_bytes(path_bytes(new));
        } else {
            pkt = Packet::new(wire::SSH_FXP_RENAME, id);
            pkt.put_bytes(path_bytes(old)).put_bytes(path_bytes(new));
        }
        self.send(&pkt)?;
        self.await_status("renaming", old, id, false)
    }

    fn unlink(&mut self, path: &Path) -> FsResult<()> {
        self.init()?;
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_REMOVE, id);
        pkt.put_bytes(path_bytes(path));
        self.send(&pkt)?;
        self.await_status("removing", path, id, false)
    }

    fn rmdir(&mut self, path: &Path) -> FsResult<()> {
        self.init()?;
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_RMDIR, id);
        pkt.put_bytes(path_bytes(path));
        self.send(&pkt)?;
        self.await_status("removing directory", path, id, false)
    }

    fn mkdir_remote(&mut self, path: &Path, mode: u32) -> FsResult<()> {
        self.init()?;
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_MKDIR, id);
        pkt.put_bytes(path_bytes(path))
            .put_u32(wire::SSH_FILEXFER_ATTR_PERMISSIONS)
            .put_u32(mode);
        self.send(&pkt)?;
        self.await_status("creating directory", path, id, false)
    }

    fn send_stat(&mut self, path: &Path) -> FsResult<u32> {
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_STAT, id);
        pkt.put_bytes(path_bytes(path));
        self.send(&pkt)?;
        Ok(id)
    }

    /// Start a speculative existence probe; a later `exists` call consumes
    /// the answer from the cache without a round trip.
    fn prefigure(&mut self, path: &Path) -> FsResult<()> {
        self.init()?;
        let id = self.send_stat(path)?;
        self.existence_inflight.push_back((id, path.to_path_buf()));
        Ok(())
    }

    fn exists_remote(&mut self, path: &Path) -> FsResult<bool> {
        self.init()?;
        // Collect every pending probe first; they pipelined behind us.
        while let Some((id, p)) = self.existence_inflight.pop_front() {
            let reply = self.await_reply(id)?;
            let found = wire::reply_type(&reply)? == wire::SSH_FXP_ATTRS;
            self.existence.insert(p, found);
        }
        if let Some(found) = self.existence.remove(path) {
            return Ok(found);
        }
        let id = self.send_stat(path)?;
        let reply = self.await_reply(id)?;
        Ok(wire::reply_type(&reply)? == wire::SSH_FXP_ATTRS)
    }

    fn read_dir(&mut self, path: &Path) -> FsResult<Vec<OsString>> {
        self.init()?;
        let id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_OPENDIR, id);
        pkt.put_bytes(path_bytes(path));
        self.send(&pkt)?;
        let reply = self.await_reply(id)?;
        if wire::reply_type(&reply)? != wire::SSH_FXP_HANDLE {
            Self::check_reply("opening directory", path, &reply, false)?;
            return Err(FsError::Protocol(
                "unexpected reply to SSH_FXP_OPENDIR".into(),
            ));
        }
        let handle = Reader::body(&reply).bytes()?.to_vec();

        let result = self.read_dir_entries(path, &handle);
        match self.close_handle(&handle) {
            Ok(close_id) => self.ignore(close_id),
            Err(e) => {
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    fn read_dir_entries(&mut self, path: &Path, handle: &[u8]) -> FsResult<Vec<OsString>> {
        let mut names = Vec::new();
        loop {
            let id = self.new_id();
            let mut pkt = Packet::new(wire::SSH_FXP_READDIR, id);
            pkt.put_bytes(handle);
            self.send(&pkt)?;
            let reply = self.await_reply(id)?;
            if wire::reply_type(&reply)? != wire::SSH_FXP_NAME {
                // Anything other than EOF is a real failure.
                Self::check_reply("reading directory", path, &reply, true)?;
                return Ok(names);
            }
            let mut r = Reader::body(&reply);
            let mut count = r.u32()?;
            while count > 0 {
                let filename = r.bytes()?;
                r.bytes()?; // longname, unused
                r.skip_attrs()?;
                if filename != b"." && filename != b".." {
                    names.push(OsString::from_vec(filename.to_vec()));
                }
                count -= 1;
            }
        }
    }

    /// The protocol has no "what kind of thing is this" request, so probe
    /// with OPEN, OPENDIR and READLINK in parallel and deduce the type from
    /// whichever succeeds.
    fn remote_type(&mut self, path: &Path) -> FsResult<PathType> {
        self.init()?;

        let open_id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_OPEN, open_id);
        pkt.put_bytes(path_bytes(path))
            .put_u32(wire::SSH_FXF_READ)
            .put_u32(0);
        self.send(&pkt)?;

        let dir_id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_OPENDIR, dir_id);
        pkt.put_bytes(path_bytes(path));
        self.send(&pkt)?;

        let link_id = self.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_READLINK, link_id);
        pkt.put_bytes(path_bytes(path));
        self.send(&pkt)?;

        let open_reply = self.await_reply(open_id)?;
        let dir_reply = self.await_reply(dir_id)?;
        let link_reply = self.await_reply(link_id)?;

        // Maybe the path doesn't exist at all.
        if wire::reply_type(&open_reply)? == wire::SSH_FXP_STATUS {
            let st = wire::parse_status(&open_reply)?;
            if st.code == wire::SSH_FX_NO_SUCH_FILE {
                return Err(FsError::Sftp {
                    op: "checking file type",
                    path: path.to_path_buf(),
                    message: st.message,
                    status: st.code,
                });
            }
        }

        let mut t = PathType::Unknown;
        if wire::reply_type(&open_reply)? == wire::SSH_FXP_HANDLE {
            t = PathType::Regular;
            let handle = Reader::body(&open_reply).bytes()?.to_vec();
            let id = self.close_handle(&handle)?;
            self.ignore(id);
        }
        if wire::reply_type(&dir_reply)? == wire::SSH_FXP_HANDLE {
            t = PathType::Directory;
            let handle = Reader::body(&dir_reply).bytes()?.to_vec();
            let id = self.close_handle(&handle)?;
            self.ignore(id);
        }
        if wire::reply_type(&link_reply)? == wire::SSH_FXP_NAME {
            t = PathType::SymLink;
        }
        Ok(t)
    }
}

impl Drop for SftpClient {
    fn drop(&mut self) {
        // Closing both pipes is what tells the subprocess to exit.
        self.to_server.take();
        self.from_server.take();
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    log::error!("sftp subprocess exited with {status}");
                }
                Ok(_) => {}
                Err(e) => log::error!("waiting for sftp subprocess: {e}"),
            }
        }
    }
}

/// An open remote file. Reads keep a queue of outstanding READs ahead of the
/// consumer; writes are fire-and-forget until `flush`, which awaits every
/// outstanding reply and surfaces deferred errors.
struct SftpFile {
    client: Rc<RefCell<SftpClient>>,
    path: PathBuf,
    handle: Vec<u8>,
    read_queue: VecDeque<u32>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_offset: u64,
    eof: bool,
    write_queue: VecDeque<u32>,
    write_offset: u64,
}

impl SftpFile {
    /// Await one write reply and drop it from the queue.
    fn reap_write(
        c: &mut SftpClient,
        queue: &mut VecDeque<u32>,
        path: &Path,
        id: u32,
    ) -> FsResult<()> {
        let reply = c.await_reply(id)?;
        if let Some(pos) = queue.iter().position(|x| *x == id) {
            queue.remove(pos);
        }
        SftpClient::check_reply("writing to", path, &reply, false)
    }

    fn sync_writes(c: &mut SftpClient, queue: &mut VecDeque<u32>, path: &Path) -> FsResult<()> {
        while let Some(&id) = queue.front() {
            Self::reap_write(c, queue, path, id)?;
        }
        Ok(())
    }
}

impl Read for SftpFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut c = self.client.borrow_mut();
        loop {
            // Keep the read queue full.
            if !self.eof {
                while self.read_queue.len() < SftpConsts::READ_QUEUE_LEN {
                    let id = c.new_id();
                    let mut pkt = Packet::new(wire::SSH_FXP_READ, id);
                    pkt.put_bytes(&self.handle)
                        .put_u64(self.read_offset)
                        .put_u32(SftpConsts::READ_CHUNK);
                    c.send(&pkt).map_err(io_err)?;
                    self.read_offset += u64::from(SftpConsts::READ_CHUNK);
                    self.read_queue.push_back(id);
                }
            }

            if self.read_pos < self.read_buf.len() {
                let n = (self.read_buf.len() - self.read_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
                self.read_pos += n;
                return Ok(n);
            }

            let Some(id) = self.read_queue.pop_front() else {
                return Ok(0); // eof, queue drained
            };
            let reply = c.await_reply(id).map_err(io_err)?;
            if wire::reply_type(&reply).map_err(io_err)? == wire::SSH_FXP_DATA {
                self.read_buf = Reader::body(&reply).bytes().map_err(io_err)?.to_vec();
                self.read_pos = 0;
            } else {
                SftpClient::check_reply("reading", &self.path, &reply, true).map_err(io_err)?;
                // EOF: nobody will consume the reads still in flight.
                while let Some(rest) = self.read_queue.pop_front() {
                    c.ignore(rest);
                }
                self.eof = true;
                return Ok(0);
            }
        }
    }
}

impl Write for SftpFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut c = self.client.borrow_mut();
        let id = c.new_id();
        let mut pkt = Packet::new(wire::SSH_FXP_WRITE, id);
        pkt.put_bytes(&self.handle)
            .put_u64(self.write_offset)
            .put_bytes(buf);
        c.send(&pkt).map_err(io_err)?;
        self.write_offset += buf.len() as u64;
        self.write_queue.push_back(id);

        // Reap whatever replies already came back; deferred errors surface
        // as early as possible.
        while let Some(ready) = self.write_queue.iter().copied().find(|id| c.ready(*id)) {
            Self::reap_write(&mut c, &mut self.write_queue, &self.path, ready).map_err(io_err)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut c = self.client.borrow_mut();
        Self::sync_writes(&mut c, &mut self.write_queue, &self.path).map_err(io_err)
    }
}

impl FsFile for SftpFile {}

impl Drop for SftpFile {
    fn drop(&mut self) {
        let mut c = self.client.borrow_mut();
        if let Err(e) = Self::sync_writes(&mut c, &mut self.write_queue, &self.path) {
            log::error!("{e}");
        }
        // Close is fire-and-forget: the reply id goes straight to ignored.
        match c.close_handle(&self.handle) {
            Ok(id) => c.ignore(id),
            Err(e) => log::error!("closing {}: {e}", self.path.display()),
        }
        // So do reads nobody will collect.
        while let Some(id) = self.read_queue.pop_front() {
            c.ignore(id);
        }
    }
}
