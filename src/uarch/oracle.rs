//! The latency oracle: one timed touch of a candidate address
use std::arch::asm;
use std::collections::TryReserveError;

use crate::uarch::cache::CacheGeometry;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to allocate cache eviction buffer of {0} bytes: {1}")]
    AllocationError(usize, #[source] TryReserveError),
}

/// Anything that can time an access to an address, in cycles
///
/// Readings are raw: negative or wrapped deltas are passed through and
/// left to the caller's statistics.
pub trait LatencyOracle {
    fn measure(&mut self, address: u64) -> i64;
}

impl<F: FnMut(u64) -> i64> LatencyOracle for F {
    fn measure(&mut self, address: u64) -> i64 {
        self(address)
    }
}

/// The instruction used to touch the candidate address
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Probe {
    /// `prefetcht2`, fast on mapped kernel pages on Intel
    #[default]
    Prefetch,
    /// A zero-mask `vmaskmovps`, which never faults, for AMD
    MaskedLoad,
    /// Pick by CPU vendor
    Auto,
}

impl Probe {
    pub fn resolve(self) -> Probe {
        match self {
            Probe::Auto => {
                if !super::cpu_vendor_is("GenuineIntel") && super::has_avx() {
                    Probe::MaskedLoad
                } else {
                    Probe::Prefetch
                }
            }
            probe => probe,
        }
    }
}

/// Evicts with a scratch buffer the size of the last-level cache, then
/// times a single probe instruction between two `rdtscp` reads
pub struct CacheOracle {
    evict: Vec<u8>,
    line_size: usize,
    probe: Probe,
}

impl CacheOracle {
    pub fn new(geometry: CacheGeometry, probe: Probe) -> Result<CacheOracle, Error> {
        // whole lines only, the eviction loop writes a qword at every line start
        let line_size = geometry.line_size();
        let len = geometry.lines() * line_size;

        let mut evict = Vec::new();
        evict.try_reserve_exact(len)
            .map_err(|e| Error::AllocationError(len, e))?;
        evict.resize(len, 0);

        Ok(CacheOracle {
            evict,
            line_size,
            probe: probe.resolve(),
        })
    }

    pub fn probe(&self) -> Probe {
        self.probe
    }

    pub fn eviction_len(&self) -> usize {
        self.evict.len()
    }
}

impl LatencyOracle for CacheOracle {
    fn measure(&mut self, address: u64) -> i64 {
        let buf = self.evict.as_mut_ptr();
        let len = self.evict.len();
        unsafe {
            match self.probe {
                Probe::MaskedLoad => time_masked_load(address, buf, len, self.line_size),
                _ => time_prefetch(address, buf, len, self.line_size),
            }
        }
    }
}

/// SAFETY: `len` must be a non-zero multiple of `line`, `line >= 8`, and
/// `buf` must be valid for writes of `len` bytes
#[inline(never)]
unsafe fn time_prefetch(addr: u64, buf: *mut u8, len: usize, line: usize) -> i64 {
    let elapsed: u64;
    asm!(
        "2:",
        "sub {off}, {line}",
        "mov qword ptr [{buf} + {off}], 0",
        "test {off}, {off}",
        "jnz 2b",

        "mfence",
        "rdtscp",
        "shl rdx, 32",
        "or rdx, rax",
        "mov {start}, rdx",

            "prefetcht2 byte ptr [{addr}]",

        "rdtscp",
        "shl rdx, 32",
        "or rax, rdx",
        "sub rax, {start}",
        buf = in(reg) buf,
        off = inout(reg) len => _,
        line = in(reg) line,
        addr = in(reg) addr,
        start = out(reg) _,
        out("rax") elapsed,
        out("rcx") _,
        out("rdx") _,
        options(nostack),
    );
    elapsed as i64
}

/// SAFETY: as for `time_prefetch`, and the CPU must support AVX
#[inline(never)]
unsafe fn time_masked_load(addr: u64, buf: *mut u8, len: usize, line: usize) -> i64 {
    let elapsed: u64;
    asm!(
        "2:",
        "sub {off}, {line}",
        "mov qword ptr [{buf} + {off}], 0",
        "test {off}, {off}",
        "jnz 2b",

        "vxorps xmm2, xmm2, xmm2",
        "mfence",
        "rdtscp",
        "shl rdx, 32",
        "or rdx, rax",
        "mov {start}, rdx",

            "vmaskmovps xmm1, xmm2, xmmword ptr [{addr}]",

        "rdtscp",
        "shl rdx, 32",
        "or rax, rdx",
        "sub rax, {start}",
        buf = in(reg) buf,
        off = inout(reg) len => _,
        line = in(reg) line,
        addr = in(reg) addr,
        start = out(reg) _,
        out("rax") elapsed,
        out("rcx") _,
        out("rdx") _,
        out("xmm1") _,
        out("xmm2") _,
        options(nostack),
    );
    elapsed as i64
}
