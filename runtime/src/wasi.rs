//! WASI Preview 1 syscall layer.
//!
//! Only the subset the WAJS toolchain links against is provided: argv and
//! environment, the realtime clock, stdout/stderr, and a read-only
//! filesystem with a single preopened root (fd 3) whose files are fetched
//! whole from a [`FileBacking`].
//!
//! Errors are `Errno` values handed back to the guest; nothing in this
//! module is fatal except `proc_exit`, which produces a [`HostFault`].

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backing::FileBacking;
use crate::handles::HandleTable;
use crate::memory::{GuestMemory, OutOfBounds};
use crate::session::{FaultCategory, HostFault, HostSink};
use crate::{strings, RuntimeConfig};

/// Standard input.
pub const FD_STDIN: u32 = 0;
/// Standard output.
pub const FD_STDOUT: u32 = 1;
/// Standard error.
pub const FD_STDERR: u32 = 2;
/// The preopened root directory.
pub const ROOT_PREOPEN_FD: u32 = 3;
/// Guest fd of descriptor-table handle `id` is `id + FD_OFFSET`.
pub const FD_OFFSET: u32 = 3;

/// Size of one `iovec` / `ciovec` entry.
const IOVEC_SIZE: u32 = 8;
/// Size of the `fdstat` struct.
const FDSTAT_SIZE: usize = 24;

/// WASI error codes (Preview 1).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// Success.
    #[error("success")]
    Success = 0,
    /// Bad file descriptor.
    #[error("bad file descriptor")]
    BadF = 8,
    /// Bad address.
    #[error("bad address")]
    Fault = 21,
    /// Invalid argument.
    #[error("invalid argument")]
    Inval = 28,
    /// I/O error.
    #[error("I/O error")]
    Io = 29,
    /// Function not supported.
    #[error("function not supported")]
    NoSys = 52,
}

impl Errno {
    /// Value returned to the guest.
    pub fn raw(self) -> i32 {
        self as u16 as i32
    }

    /// Collapse a syscall result into the guest return value.
    pub fn from_result(result: Result<(), Errno>) -> i32 {
        match result {
            Ok(()) => Errno::Success.raw(),
            Err(errno) => errno.raw(),
        }
    }
}

impl From<OutOfBounds> for Errno {
    fn from(_: OutOfBounds) -> Self {
        Errno::Fault
    }
}

/// Clock identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClockId {
    Realtime = 0,
    Monotonic = 1,
    ProcessCputime = 2,
    ThreadCputime = 3,
}

impl ClockId {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ClockId::Realtime),
            1 => Some(ClockId::Monotonic),
            2 => Some(ClockId::ProcessCputime),
            3 => Some(ClockId::ThreadCputime),
            _ => None,
        }
    }
}

/// File descriptor types (WASI Preview 1 filetype values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FdType {
    /// Unknown.
    Unknown = 0,
    /// Character device.
    CharDevice = 2,
    /// Directory.
    Directory = 3,
    /// Regular file.
    RegularFile = 4,
}

bitflags::bitflags! {
    /// File descriptor rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdRights: u64 {
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const PATH_OPEN = 1 << 13;
        const FD_FILESTAT_GET = 1 << 21;
    }
}

impl FdRights {
    /// Rights of an opened read-only file.
    pub fn read_only_file() -> Self {
        FdRights::FD_READ | FdRights::FD_SEEK | FdRights::FD_TELL | FdRights::FD_FILESTAT_GET
    }
}

/// Seek whence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Seek from beginning.
    Set = 0,
    /// Seek from current position.
    Cur = 1,
    /// Seek back from the end.
    End = 2,
}

impl Whence {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Open flags for path_open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OFlags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

/// An open, fully fetched, read-only file.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Backing-side descriptor.
    pub remote_fd: u32,
    /// Whole file contents.
    pub data: Vec<u8>,
    /// Read cursor, always within `0..=data.len()`.
    pub cursor: u32,
    /// Root-relative name the file was opened with.
    pub display_name: String,
}

impl Descriptor {
    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor as usize
    }
}

/// Open files keyed by guest fd.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    table: HandleTable<Descriptor>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a descriptor and return its guest fd.
    pub fn insert(&mut self, descriptor: Descriptor) -> u32 {
        self.table.allocate(descriptor) + FD_OFFSET
    }

    pub fn get(&self, fd: u32) -> Option<&Descriptor> {
        self.table.get(Self::handle_of(fd)?)
    }

    pub fn get_mut(&mut self, fd: u32) -> Option<&mut Descriptor> {
        self.table.get_mut(Self::handle_of(fd)?)
    }

    pub fn remove(&mut self, fd: u32) -> Option<Descriptor> {
        self.table.release(Self::handle_of(fd)?)
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Guest fds of all open descriptors.
    pub fn fds(&self) -> Vec<u32> {
        self.table.iter().map(|(id, _)| id + FD_OFFSET).collect()
    }

    fn handle_of(fd: u32) -> Option<u32> {
        match fd.checked_sub(FD_OFFSET) {
            Some(0) | None => None,
            Some(id) => Some(id),
        }
    }
}

/// Per-call environment handed to the syscall layer.
pub struct CallContext<'a> {
    /// View of guest memory for this call.
    pub memory: GuestMemory<'a>,
    /// Output sink.
    pub sink: &'a mut dyn HostSink,
}

impl<'a> CallContext<'a> {
    pub fn new(memory: GuestMemory<'a>, sink: &'a mut dyn HostSink) -> Self {
        CallContext { memory, sink }
    }
}

/// WASI Preview 1 functions provided to the module.
///
/// Pointers are guest addresses; results are written through them.
pub trait WasiPreview1 {
    fn args_sizes_get(&mut self, cx: &mut CallContext<'_>, argc_ptr: u32, buf_size_ptr: u32) -> Result<(), Errno>;

    fn args_get(&mut self, cx: &mut CallContext<'_>, argv_ptr: u32, argv_buf_ptr: u32) -> Result<(), Errno>;

    fn environ_sizes_get(&mut self, cx: &mut CallContext<'_>, count_ptr: u32, buf_size_ptr: u32) -> Result<(), Errno>;

    fn environ_get(&mut self, cx: &mut CallContext<'_>, environ_ptr: u32, environ_buf_ptr: u32) -> Result<(), Errno>;

    fn clock_time_get(&mut self, cx: &mut CallContext<'_>, clock_id: u32, precision: u64, time_ptr: u32) -> Result<(), Errno>;

    fn fd_prestat_get(&mut self, cx: &mut CallContext<'_>, fd: u32, prestat_ptr: u32) -> Result<(), Errno>;

    fn fd_prestat_dir_name(&mut self, cx: &mut CallContext<'_>, fd: u32, path_ptr: u32, path_len: u32) -> Result<(), Errno>;

    fn fd_fdstat_get(&mut self, cx: &mut CallContext<'_>, fd: u32, stat_ptr: u32) -> Result<(), Errno>;

    fn fd_fdstat_set_flags(&mut self, cx: &mut CallContext<'_>, fd: u32, flags: u32) -> Result<(), Errno>;

    #[allow(clippy::too_many_arguments)]
    fn path_open(
        &mut self,
        cx: &mut CallContext<'_>,
        dirfd: u32,
        dirflags: u32,
        path_ptr: u32,
        path_len: u32,
        oflags: u32,
        rights_base: u64,
        rights_inheriting: u64,
        fdflags: u32,
        fd_ptr: u32,
    ) -> Result<(), Errno>;

    fn fd_read(&mut self, cx: &mut CallContext<'_>, fd: u32, iovs: u32, iovs_len: u32, nread_ptr: u32) -> Result<(), Errno>;

    fn fd_seek(&mut self, cx: &mut CallContext<'_>, fd: u32, offset: i64, whence: u32, newoffset_ptr: u32) -> Result<(), Errno>;

    fn fd_write(&mut self, cx: &mut CallContext<'_>, fd: u32, iovs: u32, iovs_len: u32, nwritten_ptr: u32) -> Result<(), Errno>;

    fn fd_close(&mut self, cx: &mut CallContext<'_>, fd: u32) -> Result<(), Errno>;

    /// Build the fault that ends the session.
    fn proc_exit(&mut self, code: i32) -> HostFault;
}

/// The host's WASI state: argv, environment and open files.
pub struct SyscallLayer {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    root_dir: String,
    descriptors: DescriptorTable,
    backing: Box<dyn FileBacking>,
}

impl SyscallLayer {
    pub fn new(config: &RuntimeConfig, backing: Box<dyn FileBacking>) -> Self {
        SyscallLayer {
            args: config.args.clone(),
            env: config.env.clone(),
            root_dir: config.root_dir.clone(),
            descriptors: DescriptorTable::new(),
            backing,
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Close every open descriptor.
    pub fn close_all(&mut self) {
        for fd in self.descriptors.fds() {
            if let Some(descriptor) = self.descriptors.remove(fd) {
                self.backing.close(descriptor.remote_fd);
            }
        }
    }

    fn environ(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Resolve a guest path below the root; `.` and `..` never leave it.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn offset(ptr: u32, delta: u32) -> Result<u32, Errno> {
    ptr.checked_add(delta).ok_or(Errno::Fault)
}

/// Size of a list of strings laid out NUL-terminated.
fn list_sizes(items: &[String]) -> (u32, u32) {
    let total: usize = items.iter().map(|s| s.len() + 1).sum();
    (items.len() as u32, total as u32)
}

/// Write a pointer table plus NUL-terminated strings.
fn write_list(mem: &mut GuestMemory<'_>, items: &[String], mut table_ptr: u32, mut buf_ptr: u32) -> Result<(), Errno> {
    for item in items {
        mem.write_u32(table_ptr, buf_ptr)?;
        mem.write_bytes(buf_ptr, item.as_bytes())?;
        mem.write_u8(offset(buf_ptr, item.len() as u32)?, 0)?;
        buf_ptr = offset(buf_ptr, item.len() as u32 + 1)?;
        table_ptr = offset(table_ptr, 4)?;
    }
    Ok(())
}

/// Read iovec `index` of the list at `iovs`.
fn read_iovec(mem: &GuestMemory<'_>, iovs: u32, index: u32) -> Result<(u32, u32), Errno> {
    let entry = offset(iovs, index.checked_mul(IOVEC_SIZE).ok_or(Errno::Fault)?)?;
    let ptr = mem.read_u32(entry)?;
    let len = mem.read_u32(offset(entry, 4)?)?;
    Ok((ptr, len))
}

impl WasiPreview1 for SyscallLayer {
    fn args_sizes_get(&mut self, cx: &mut CallContext<'_>, argc_ptr: u32, buf_size_ptr: u32) -> Result<(), Errno> {
        let (count, size) = list_sizes(&self.args);
        cx.memory.write_u32(argc_ptr, count)?;
        cx.memory.write_u32(buf_size_ptr, size)?;
        Ok(())
    }

    fn args_get(&mut self, cx: &mut CallContext<'_>, argv_ptr: u32, argv_buf_ptr: u32) -> Result<(), Errno> {
        write_list(&mut cx.memory, &self.args, argv_ptr, argv_buf_ptr)
    }

    fn environ_sizes_get(&mut self, cx: &mut CallContext<'_>, count_ptr: u32, buf_size_ptr: u32) -> Result<(), Errno> {
        let (count, size) = list_sizes(&self.environ());
        cx.memory.write_u32(count_ptr, count)?;
        cx.memory.write_u32(buf_size_ptr, size)?;
        Ok(())
    }

    fn environ_get(&mut self, cx: &mut CallContext<'_>, environ_ptr: u32, environ_buf_ptr: u32) -> Result<(), Errno> {
        write_list(&mut cx.memory, &self.environ(), environ_ptr, environ_buf_ptr)
    }

    fn clock_time_get(&mut self, cx: &mut CallContext<'_>, clock_id: u32, _precision: u64, time_ptr: u32) -> Result<(), Errno> {
        match ClockId::from_u32(clock_id) {
            Some(ClockId::Realtime) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                cx.memory.write_u64(time_ptr, now)?;
                Ok(())
            }
            _ => Err(Errno::NoSys),
        }
    }

    fn fd_prestat_get(&mut self, cx: &mut CallContext<'_>, fd: u32, prestat_ptr: u32) -> Result<(), Errno> {
        if fd != ROOT_PREOPEN_FD {
            return Err(Errno::BadF);
        }
        // Tag 0 is `dir`.
        cx.memory.write_u8(prestat_ptr, 0)?;
        cx.memory.write_u32(offset(prestat_ptr, 4)?, self.root_dir.len() as u32)?;
        Ok(())
    }

    fn fd_prestat_dir_name(&mut self, cx: &mut CallContext<'_>, fd: u32, path_ptr: u32, path_len: u32) -> Result<(), Errno> {
        if fd != ROOT_PREOPEN_FD {
            return Err(Errno::BadF);
        }
        if path_len as usize != self.root_dir.len() {
            return Err(Errno::Inval);
        }
        cx.memory.write_bytes(path_ptr, self.root_dir.as_bytes())?;
        Ok(())
    }

    fn fd_fdstat_get(&mut self, cx: &mut CallContext<'_>, fd: u32, stat_ptr: u32) -> Result<(), Errno> {
        let (filetype, base, inheriting) = match fd {
            FD_STDIN => (FdType::CharDevice, FdRights::FD_READ, FdRights::empty()),
            FD_STDOUT | FD_STDERR => (FdType::CharDevice, FdRights::FD_WRITE, FdRights::empty()),
            ROOT_PREOPEN_FD => (FdType::Directory, FdRights::PATH_OPEN, FdRights::read_only_file()),
            _ if self.descriptors.get(fd).is_some() => {
                (FdType::RegularFile, FdRights::read_only_file(), FdRights::empty())
            }
            _ => return Err(Errno::BadF),
        };

        let stat = cx.memory.slice_mut(stat_ptr, FDSTAT_SIZE)?;
        stat.fill(0);
        stat[0] = filetype as u8;
        // fs_flags at 2 stay zero.
        stat[8..16].copy_from_slice(&base.bits().to_le_bytes());
        stat[16..24].copy_from_slice(&inheriting.bits().to_le_bytes());
        Ok(())
    }

    fn fd_fdstat_set_flags(&mut self, _cx: &mut CallContext<'_>, _fd: u32, _flags: u32) -> Result<(), Errno> {
        Err(Errno::NoSys)
    }

    fn path_open(
        &mut self,
        cx: &mut CallContext<'_>,
        dirfd: u32,
        _dirflags: u32,
        path_ptr: u32,
        path_len: u32,
        oflags: u32,
        _rights_base: u64,
        _rights_inheriting: u64,
        _fdflags: u32,
        fd_ptr: u32,
    ) -> Result<(), Errno> {
        if dirfd != ROOT_PREOPEN_FD {
            return Err(Errno::BadF);
        }
        if !OFlags::from_bits_truncate(oflags as u16).is_empty() {
            return Err(Errno::NoSys);
        }

        cx.memory.read_bytes(path_ptr, path_len as usize)?;
        cx.memory.read_u32(fd_ptr)?;
        let path = strings::decode(cx.memory.as_slice(), path_ptr, Some(path_len));
        let name = normalize_path(&path);

        let payload = match self.backing.open(&name) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("[wajs:fs] path_open {:?}: {}", name, e);
                return Err(Errno::Io);
            }
        };

        let fd = self.descriptors.insert(Descriptor {
            remote_fd: payload.fd,
            data: payload.data,
            cursor: 0,
            display_name: name,
        });
        cx.memory.write_u32(fd_ptr, fd)?;
        log::debug!("[wajs:fs] path_open {:?} -> fd {}", path, fd);
        Ok(())
    }

    fn fd_read(&mut self, cx: &mut CallContext<'_>, fd: u32, iovs: u32, iovs_len: u32, nread_ptr: u32) -> Result<(), Errno> {
        let descriptor = self.descriptors.get_mut(fd).ok_or(Errno::BadF)?;

        // Check every target span first so a bad iovec leaves the cursor alone.
        let mut spans: Vec<(u32, usize)> = Vec::new();
        let mut remaining = descriptor.remaining();
        for i in 0..iovs_len {
            if remaining == 0 {
                break;
            }
            let (ptr, len) = read_iovec(&cx.memory, iovs, i)?;
            let n = (len as usize).min(remaining);
            cx.memory.slice_mut(ptr, n)?;
            spans.push((ptr, n));
            remaining -= n;
        }
        cx.memory.slice_mut(nread_ptr, 4)?;

        let mut total: u32 = 0;
        for (ptr, n) in spans {
            let start = descriptor.cursor as usize;
            cx.memory.write_bytes(ptr, &descriptor.data[start..start + n])?;
            descriptor.cursor += n as u32;
            total += n as u32;
        }

        cx.memory.write_u32(nread_ptr, total)?;
        Ok(())
    }

    fn fd_seek(&mut self, cx: &mut CallContext<'_>, fd: u32, offset: i64, whence: u32, newoffset_ptr: u32) -> Result<(), Errno> {
        let descriptor = self.descriptors.get_mut(fd).ok_or(Errno::BadF)?;
        let whence = Whence::from_u32(whence).ok_or(Errno::Inval)?;

        let len = descriptor.data.len() as i64;
        let target = match whence {
            Whence::Set => offset,
            Whence::Cur => (descriptor.cursor as i64).saturating_add(offset),
            Whence::End => len.saturating_sub(offset),
        };
        descriptor.cursor = target.clamp(0, len) as u32;

        cx.memory.write_u64(newoffset_ptr, descriptor.cursor as u64)?;
        Ok(())
    }

    fn fd_write(&mut self, cx: &mut CallContext<'_>, fd: u32, iovs: u32, iovs_len: u32, nwritten_ptr: u32) -> Result<(), Errno> {
        if fd != FD_STDOUT && fd != FD_STDERR {
            return Err(Errno::BadF);
        }

        let mut text = String::new();
        let mut total: u32 = 0;
        for i in 0..iovs_len {
            let (ptr, len) = read_iovec(&cx.memory, iovs, i)?;
            cx.memory.read_bytes(ptr, len as usize)?;
            text.push_str(&strings::decode(cx.memory.as_slice(), ptr, Some(len)));
            total = total.wrapping_add(len);
        }

        if fd == FD_STDOUT {
            cx.sink.print(&text);
        } else {
            cx.sink.print_err(&text);
        }
        cx.memory.write_u32(nwritten_ptr, total)?;
        Ok(())
    }

    fn fd_close(&mut self, _cx: &mut CallContext<'_>, fd: u32) -> Result<(), Errno> {
        let descriptor = self.descriptors.remove(fd).ok_or(Errno::BadF)?;
        self.backing.close(descriptor.remote_fd);
        log::debug!("[wajs:fs] fd_close {} ({})", fd, descriptor.display_name);
        Ok(())
    }

    fn proc_exit(&mut self, code: i32) -> HostFault {
        log::debug!("[wajs] proc_exit({})", code);
        HostFault::new(FaultCategory::Exit(code), "proc_exit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryBacking;
    use crate::session::CaptureSink;

    const DATA: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

    fn layer(backing: &MemoryBacking) -> SyscallLayer {
        let mut config = RuntimeConfig {
            args: vec![String::from("demo"), String::from("-v")],
            ..RuntimeConfig::default()
        };
        config.env.insert(String::from("HOME"), String::from("/"));
        SyscallLayer::new(&config, Box::new(backing.clone()))
    }

    fn open(sys: &mut SyscallLayer, cx: &mut CallContext<'_>, path: &str) -> Result<u32, Errno> {
        cx.memory.write_bytes(100, path.as_bytes()).unwrap();
        sys.path_open(cx, ROOT_PREOPEN_FD, 0, 100, path.len() as u32, 0, 0, 0, 0, 200)?;
        Ok(cx.memory.read_u32(200).unwrap())
    }

    fn set_iovecs(cx: &mut CallContext<'_>, at: u32, spans: &[(u32, u32)]) {
        for (i, (ptr, len)) in spans.iter().enumerate() {
            cx.memory.write_u32(at + 8 * i as u32, *ptr).unwrap();
            cx.memory.write_u32(at + 8 * i as u32 + 4, *len).unwrap();
        }
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::Success.raw(), 0);
        assert_eq!(Errno::BadF.raw(), 8);
        assert_eq!(Errno::Inval.raw(), 28);
        assert_eq!(Errno::Io.raw(), 29);
        assert_eq!(Errno::NoSys.raw(), 52);
        assert_eq!(Errno::from_result(Err(Errno::Fault)), 21);
        assert_eq!(Errno::from_result(Ok(())), 0);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("data.bin"), "data.bin");
        assert_eq!(normalize_path("/a/./b//c"), "a/b/c");
        assert_eq!(normalize_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_path("a/../../b"), "b");
    }

    #[test]
    fn test_open_read_seek_close() {
        let backing = MemoryBacking::new().with_file("data.bin", DATA.to_vec());
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        let fd = open(&mut sys, &mut cx, "data.bin").unwrap();
        assert_eq!(fd, 4);

        // Split read: 4 bytes into the first span, the remaining 6 into the second.
        set_iovecs(&mut cx, 300, &[(400, 4), (500, 8)]);
        sys.fd_read(&mut cx, fd, 300, 2, 600).unwrap();
        assert_eq!(cx.memory.read_u32(600).unwrap(), 10);
        assert_eq!(cx.memory.read_bytes(400, 4).unwrap(), &[0, 1, 2, 3]);
        assert_eq!(cx.memory.read_bytes(500, 6).unwrap(), &[4, 5, 6, 7, 8, 9]);

        // Exhausted.
        sys.fd_read(&mut cx, fd, 300, 2, 600).unwrap();
        assert_eq!(cx.memory.read_u32(600).unwrap(), 0);

        // Seek three bytes back from the end.
        sys.fd_seek(&mut cx, fd, 3, Whence::End as u32, 700).unwrap();
        assert_eq!(cx.memory.read_u64(700).unwrap(), 7);
        set_iovecs(&mut cx, 300, &[(400, 8)]);
        sys.fd_read(&mut cx, fd, 300, 1, 600).unwrap();
        assert_eq!(cx.memory.read_u32(600).unwrap(), 3);
        assert_eq!(cx.memory.read_bytes(400, 3).unwrap(), &[7, 8, 9]);

        sys.fd_close(&mut cx, fd).unwrap();
        assert_eq!(sys.fd_close(&mut cx, fd), Err(Errno::BadF));
        assert_eq!(sys.fd_read(&mut cx, fd, 300, 1, 600), Err(Errno::BadF));
        assert_eq!(backing.closed_fds().len(), 1);
        assert!(sys.descriptors().is_empty());
    }

    #[test]
    fn test_favicon_read_to_end() {
        let icon: Vec<u8> = (0..12).collect();
        let backing = MemoryBacking::new().with_file("favicon.ico", icon.clone());
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        let fd = open(&mut sys, &mut cx, "favicon.ico").unwrap();
        set_iovecs(&mut cx, 300, &[(400, 21)]);
        sys.fd_read(&mut cx, fd, 300, 1, 600).unwrap();
        assert_eq!(cx.memory.read_u32(600).unwrap(), 12);
        assert_eq!(cx.memory.read_bytes(400, 12).unwrap(), icon.as_slice());

        sys.fd_read(&mut cx, fd, 300, 1, 600).unwrap();
        assert_eq!(cx.memory.read_u32(600).unwrap(), 0);

        sys.fd_seek(&mut cx, fd, 0, Whence::Set as u32, 700).unwrap();
        assert_eq!(cx.memory.read_u64(700).unwrap(), 0);

        sys.fd_close(&mut cx, fd).unwrap();
        assert_eq!(sys.fd_read(&mut cx, fd, 300, 1, 600), Err(Errno::BadF));
    }

    #[test]
    fn test_bad_iovec_leaves_cursor() {
        let backing = MemoryBacking::new().with_file("data.bin", DATA.to_vec());
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);
        let fd = open(&mut sys, &mut cx, "data.bin").unwrap();

        // The second span runs past the end of memory.
        set_iovecs(&mut cx, 300, &[(400, 4), (1020, 8)]);
        assert_eq!(sys.fd_read(&mut cx, fd, 300, 2, 600), Err(Errno::Fault));
        assert_eq!(sys.descriptors().get(fd).unwrap().cursor, 0);

        // A bad nread pointer is caught before anything is consumed too.
        set_iovecs(&mut cx, 300, &[(400, 4)]);
        assert_eq!(sys.fd_read(&mut cx, fd, 300, 1, 1022), Err(Errno::Fault));
        assert_eq!(sys.descriptors().get(fd).unwrap().cursor, 0);

        sys.fd_read(&mut cx, fd, 300, 1, 600).unwrap();
        assert_eq!(cx.memory.read_bytes(400, 4).unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_seek_is_clamped() {
        let backing = MemoryBacking::new().with_file("data.bin", DATA.to_vec());
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);
        let fd = open(&mut sys, &mut cx, "data.bin").unwrap();

        sys.fd_seek(&mut cx, fd, 100, Whence::Set as u32, 700).unwrap();
        assert_eq!(cx.memory.read_u64(700).unwrap(), 10);
        sys.fd_seek(&mut cx, fd, -50, Whence::Cur as u32, 700).unwrap();
        assert_eq!(cx.memory.read_u64(700).unwrap(), 0);
        sys.fd_seek(&mut cx, fd, -5, Whence::End as u32, 700).unwrap();
        assert_eq!(cx.memory.read_u64(700).unwrap(), 10);
        sys.fd_seek(&mut cx, fd, 4, Whence::Cur as u32, 700).unwrap();
        assert_eq!(cx.memory.read_u64(700).unwrap(), 10);

        assert_eq!(sys.fd_seek(&mut cx, fd, 0, 7, 700), Err(Errno::Inval));
        assert_eq!(sys.fd_seek(&mut cx, 99, 0, 0, 700), Err(Errno::BadF));
    }

    #[test]
    fn test_path_open_failures() {
        let backing = MemoryBacking::new().with_file("data.bin", DATA.to_vec());
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        assert_eq!(open(&mut sys, &mut cx, "missing.bin"), Err(Errno::Io));
        assert!(sys.descriptors().is_empty());

        cx.memory.write_bytes(100, b"data.bin").unwrap();
        assert_eq!(
            sys.path_open(&mut cx, 5, 0, 100, 8, 0, 0, 0, 0, 200),
            Err(Errno::BadF)
        );
        assert_eq!(
            sys.path_open(&mut cx, 3, 0, 100, 8, OFlags::CREAT.bits() as u32, 0, 0, 0, 200),
            Err(Errno::NoSys)
        );
        assert_eq!(
            sys.path_open(&mut cx, 3, 0, 100, 8, 0, 0, 0, 0, 2000),
            Err(Errno::Fault)
        );
        assert!(backing.open_fds().is_empty());
    }

    #[test]
    fn test_dotdot_cannot_escape_root() {
        let backing = MemoryBacking::new().with_file("data.bin", DATA.to_vec());
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        let fd = open(&mut sys, &mut cx, "../../data.bin").unwrap();
        assert_eq!(sys.descriptors().get(fd).unwrap().display_name, "data.bin");
    }

    #[test]
    fn test_fd_ids_not_reused() {
        let backing = MemoryBacking::new().with_file("a", "x").with_file("b", "y");
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        let a = open(&mut sys, &mut cx, "a").unwrap();
        sys.fd_close(&mut cx, a).unwrap();
        let b = open(&mut sys, &mut cx, "b").unwrap();
        assert_eq!((a, b), (4, 5));
    }

    #[test]
    fn test_fd_write_to_sink() {
        let backing = MemoryBacking::new();
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let sink = CaptureSink::new();
        let mut handed = sink.clone();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut handed);

        cx.memory.write_bytes(400, b"hello ").unwrap();
        cx.memory.write_bytes(500, "w\u{f6}rld\n".as_bytes()).unwrap();
        set_iovecs(&mut cx, 300, &[(400, 6), (500, 7)]);
        sys.fd_write(&mut cx, FD_STDOUT, 300, 2, 600).unwrap();
        assert_eq!(cx.memory.read_u32(600).unwrap(), 13);

        sys.fd_write(&mut cx, FD_STDERR, 300, 1, 600).unwrap();
        assert_eq!(sys.fd_write(&mut cx, 4, 300, 1, 600), Err(Errno::BadF));
        drop(cx);

        assert_eq!(sink.stdout(), "hello w\u{f6}rld\n");
        assert_eq!(sink.stderr(), "hello ");
    }

    #[test]
    fn test_prestat() {
        let backing = MemoryBacking::new();
        let mut sys = layer(&backing);
        let mut buf = vec![0xFFu8; 64];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        sys.fd_prestat_get(&mut cx, 3, 8).unwrap();
        assert_eq!(cx.memory.read_u8(8).unwrap(), 0);
        assert_eq!(cx.memory.read_u32(12).unwrap(), 1);
        assert_eq!(sys.fd_prestat_get(&mut cx, 4, 8), Err(Errno::BadF));

        sys.fd_prestat_dir_name(&mut cx, 3, 32, 1).unwrap();
        assert_eq!(cx.memory.read_u8(32).unwrap(), b'/');
        assert_eq!(sys.fd_prestat_dir_name(&mut cx, 3, 32, 4), Err(Errno::Inval));
        assert_eq!(sys.fd_prestat_dir_name(&mut cx, 0, 32, 1), Err(Errno::BadF));
    }

    #[test]
    fn test_fdstat() {
        let backing = MemoryBacking::new().with_file("data.bin", DATA.to_vec());
        let mut sys = layer(&backing);
        let mut buf = vec![0xFFu8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        sys.fd_fdstat_get(&mut cx, 1, 0).unwrap();
        assert_eq!(cx.memory.read_u8(0).unwrap(), FdType::CharDevice as u8);
        assert_eq!(cx.memory.read_u16(2).unwrap(), 0);
        assert_eq!(cx.memory.read_u64(8).unwrap(), FdRights::FD_WRITE.bits());

        sys.fd_fdstat_get(&mut cx, 3, 0).unwrap();
        assert_eq!(cx.memory.read_u8(0).unwrap(), FdType::Directory as u8);

        let fd = open(&mut sys, &mut cx, "data.bin").unwrap();
        sys.fd_fdstat_get(&mut cx, fd, 0).unwrap();
        assert_eq!(cx.memory.read_u8(0).unwrap(), FdType::RegularFile as u8);
        assert_eq!(cx.memory.read_u64(16).unwrap(), 0);

        assert_eq!(sys.fd_fdstat_get(&mut cx, 42, 0), Err(Errno::BadF));
        assert_eq!(sys.fd_fdstat_set_flags(&mut cx, 1, 0), Err(Errno::NoSys));
    }

    #[test]
    fn test_args_include_terminators() {
        let backing = MemoryBacking::new();
        let mut sys = layer(&backing);
        let mut buf = vec![0xFFu8; 256];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        sys.args_sizes_get(&mut cx, 0, 4).unwrap();
        assert_eq!(cx.memory.read_u32(0).unwrap(), 2);
        assert_eq!(cx.memory.read_u32(4).unwrap(), 8);

        sys.args_get(&mut cx, 16, 64).unwrap();
        assert_eq!(cx.memory.read_u32(16).unwrap(), 64);
        assert_eq!(cx.memory.read_u32(20).unwrap(), 69);
        assert_eq!(cx.memory.read_bytes(64, 8).unwrap(), b"demo\0-v\0");
    }

    #[test]
    fn test_environ() {
        let backing = MemoryBacking::new();
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 256];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        sys.environ_sizes_get(&mut cx, 0, 4).unwrap();
        assert_eq!(cx.memory.read_u32(0).unwrap(), 1);
        assert_eq!(cx.memory.read_u32(4).unwrap(), 7);
        sys.environ_get(&mut cx, 16, 64).unwrap();
        assert_eq!(cx.memory.read_bytes(64, 7).unwrap(), b"HOME=/\0");
    }

    #[test]
    fn test_clock() {
        let backing = MemoryBacking::new();
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 64];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);

        sys.clock_time_get(&mut cx, 0, 1, 8).unwrap();
        // Later than 2020-01-01.
        assert!(cx.memory.read_u64(8).unwrap() > 1_577_836_800_000_000_000);
        assert_eq!(sys.clock_time_get(&mut cx, 1, 1, 8), Err(Errno::NoSys));
        assert_eq!(sys.clock_time_get(&mut cx, 0, 1, 60), Err(Errno::Fault));
    }

    #[test]
    fn test_close_all() {
        let backing = MemoryBacking::new().with_file("a", "x").with_file("b", "y");
        let mut sys = layer(&backing);
        let mut buf = vec![0u8; 1024];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut buf), &mut sink);
        open(&mut sys, &mut cx, "a").unwrap();
        open(&mut sys, &mut cx, "b").unwrap();
        drop(cx);

        sys.close_all();
        assert!(sys.descriptors().is_empty());
        assert_eq!(backing.closed_fds().len(), 2);
    }

    #[test]
    fn test_proc_exit_fault() {
        let mut sys = layer(&MemoryBacking::new());
        let fault = sys.proc_exit(3);
        assert_eq!(fault.category, FaultCategory::Exit(3));
    }
}
