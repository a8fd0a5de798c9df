//! Split reads
//!
//! Reading a file of N bytes through two iovecs of sizes `a` and `b` with
//! `a + b > N` always delivers all N bytes, in order, whatever the split.

use proptest::prelude::*;
use wajs_runtime::backing::MemoryBacking;
use wajs_runtime::memory::GuestMemory;
use wajs_runtime::session::CaptureSink;
use wajs_runtime::wasi::{CallContext, SyscallLayer, WasiPreview1, ROOT_PREOPEN_FD};
use wajs_runtime::RuntimeConfig;

const PATH_PTR: u32 = 16;
const FD_PTR: u32 = 64;
const IOVS_PTR: u32 = 128;
const NREAD_PTR: u32 = 160;
const FIRST_BUF: u32 = 1024;
const SECOND_BUF: u32 = 2048;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Both spans together hold the whole file, split at `a`.
    #[test]
    fn split_read_delivers_whole_file(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        a in 0u32..600,
        extra in 1u32..64,
    ) {
        let n = data.len() as u32;
        let b = (n + extra).saturating_sub(a);
        prop_assume!(a + b > n);

        let backing = MemoryBacking::new().with_file("data.bin", data.clone());
        let mut sys = SyscallLayer::new(&RuntimeConfig::default(), Box::new(backing));
        let mut mem = vec![0u8; 4096];
        let mut sink = CaptureSink::new();
        let mut cx = CallContext::new(GuestMemory::new(&mut mem), &mut sink);

        cx.memory.write_bytes(PATH_PTR, b"data.bin").unwrap();
        sys.path_open(&mut cx, ROOT_PREOPEN_FD, 0, PATH_PTR, 8, 0, 0, 0, 0, FD_PTR).unwrap();
        let fd = cx.memory.read_u32(FD_PTR).unwrap();

        cx.memory.write_u32(IOVS_PTR, FIRST_BUF).unwrap();
        cx.memory.write_u32(IOVS_PTR + 4, a).unwrap();
        cx.memory.write_u32(IOVS_PTR + 8, SECOND_BUF).unwrap();
        cx.memory.write_u32(IOVS_PTR + 12, b).unwrap();
        sys.fd_read(&mut cx, fd, IOVS_PTR, 2, NREAD_PTR).unwrap();

        prop_assert_eq!(cx.memory.read_u32(NREAD_PTR).unwrap(), n);
        let first = a.min(n);
        let mut read = cx.memory.read_bytes(FIRST_BUF, first as usize).unwrap().to_vec();
        read.extend_from_slice(cx.memory.read_bytes(SECOND_BUF, (n - first) as usize).unwrap());
        prop_assert_eq!(read, data);

        sys.fd_read(&mut cx, fd, IOVS_PTR, 2, NREAD_PTR).unwrap();
        prop_assert_eq!(cx.memory.read_u32(NREAD_PTR).unwrap(), 0);
    }
}
