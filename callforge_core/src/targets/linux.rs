//! A slice of the Linux amd64 syscall surface.

use crate::target::{ArrayLen, Target, TargetBuilder, TargetError};

const PROT_READ: u64 = 0x1;
const PROT_WRITE: u64 = 0x2;
const MAP_PRIVATE: u64 = 0x2;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

pub(super) fn build() -> Result<Target, TargetError> {
    let mut b = TargetBuilder::new("linux", "amd64");
    let fd = b.resource("fd", &["fd"], &[u64::MAX, 0xffff_ff9c]);
    let pipe = b.resource("fd_pipe", &["fd", "fd_pipe"], &[u64::MAX]);
    let sock = b.resource("sock", &["fd", "sock"], &[u64::MAX]);
    let pid = b.resource("pid", &["pid"], &[0, u64::MAX]);

    let addr = b.vma("addr");
    let len = b.len("len", "addr", 8);
    let prot = b.flags("prot", 8, &[0, PROT_READ, PROT_WRITE, 0x4]);
    let flags = b.flags(
        "flags",
        8,
        &[0x1, MAP_PRIVATE, MAP_FIXED, MAP_ANONYMOUS, 0x100, 0x4000],
    );
    let mmap_fd = b.res("fd", fd);
    let offset = b.int("offset", 8);
    b.syscall("mmap", &[addr, len, prot, flags, mmap_fd, offset], None);
    b.mmap(
        "mmap",
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_FIXED | MAP_ANONYMOUS,
    );

    let addr = b.vma("addr");
    let len = b.len("len", "addr", 8);
    b.syscall("munmap", &[addr, len], None);

    b.syscall("sched_yield", &[], None);

    let ret = b.out(|b| b.res("pid", pid));
    b.syscall("getpid", &[], Some(ret));

    let target_pid = b.res("pid", pid);
    let sig = b.int_range("sig", 4, 0, 64);
    b.syscall("kill", &[target_pid, sig], None);

    let pipefd = b.out(|b| {
        let rfd = b.res("rfd", pipe);
        let wfd = b.res("wfd", pipe);
        b.structure("pipefd", &[rfd, wfd])
    });
    let pipefd = b.ptr("pipefd", pipefd);
    let pipe_flags = b.flags("flags", 8, &[0, 0x800, 0x4000, 0x80000]);
    b.syscall("pipe2", &[pipefd, pipe_flags], None);

    let name = b.filename("file");
    let file = b.ptr("file", name);
    let open_flags = b.flags("flags", 8, &[0, 0x1, 0x2, 0x40, 0x200, 0x400, 0x80000]);
    let mode = b.flags("mode", 8, &[0, 0x100, 0x80, 0x1ff]);
    let ret = b.out(|b| b.res("fd", fd));
    b.syscall("open", &[file, open_flags, mode], Some(ret));

    let read_fd = b.res("fd", fd);
    let buf = b.out(|b| b.blob("buf", 0, 0x1000));
    let buf = b.ptr("buf", buf);
    let count = b.len("count", "buf", 8);
    b.syscall("read", &[read_fd, buf, count], None);

    let write_fd = b.res("fd", fd);
    let buf = b.blob("buf", 0, 0x1000);
    let buf = b.ptr("buf", buf);
    let count = b.len("count", "buf", 8);
    b.syscall("write", &[write_fd, buf, count], None);

    let close_fd = b.res("fd", fd);
    b.syscall("close", &[close_fd], None);

    let oldfd = b.res("oldfd", fd);
    let ret = b.out(|b| b.res("fd", fd));
    b.syscall("dup", &[oldfd], Some(ret));

    let domain = b.flags("domain", 8, &[0x1, 0x2, 0xa, 0x10]);
    let kind = b.flags("type", 8, &[0x1, 0x2, 0x3, 0x5, 0x800, 0x80000]);
    let proto = b.int_range("proto", 4, 0, 255);
    let ret = b.out(|b| b.res("sock", sock));
    b.syscall("socket", &[domain, kind, proto], Some(ret));

    let sock_fd = b.res("fd", sock);
    let level = b.flags("level", 4, &[0x0, 0x1, 0x6, 0x29]);
    let optname = b.flags("optname", 4, &[0x2, 0x7, 0x8, 0xd, 0xf]);
    let int_opt = b.int("int", 4);
    let onoff = b.int_range("onoff", 4, 0, 1);
    let linger_secs = b.int("linger", 4);
    let linger = b.structure("linger", &[onoff, linger_secs]);
    let raw = b.blob("raw", 0, 64);
    let optval = b.union("optval", &[int_opt, linger, raw]);
    let optval = b.ptr("optval", optval);
    let optlen = b.bytesize("optlen", "optval", 8);
    b.syscall("setsockopt", &[sock_fd, level, optname, optval, optlen], None);

    let writev_fd = b.res("fd", fd);
    let base = b.blob("base", 0, 0x100);
    let base = b.ptr("base", base);
    let iov_len = b.len("len", "base", 8);
    let iovec = b.structure("iovec", &[base, iov_len]);
    let iovecs = b.array("vec", iovec, ArrayLen::Range(0, 8));
    let vec = b.ptr("vec", iovecs);
    let vlen = b.len("vlen", "vec", 8);
    b.syscall("writev", &[writev_fd, vec, vlen], None);

    b.build()
}
