//! micro-architectural plumbing for the timing side channel
pub mod cache;
pub mod oracle;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to pin to cpu thread {0}: {1}")]
    PinError(usize, String),
}

/// Pin the current thread to a specific CPU thread
///
/// Args:
/// * `cpu_idx` - The hardware thread to run all measurements on
pub fn pin_cpu(cpu_idx: usize) -> Result<(), Error> {
    let cores = affinity::get_core_num();
    if cpu_idx >= cores {
        return Err(Error::PinError(cpu_idx, format!("only {cores} cpu threads online")));
    }
    affinity::set_thread_affinity([cpu_idx])
        .map_err(|e| Error::PinError(cpu_idx, e.to_string()))
}

/// Whether the host CPU reports the given vendor string
pub fn cpu_vendor_is(vendor: &str) -> bool {
    raw_cpuid::CpuId::new()
        .get_vendor_info()
        .map(|info| info.as_str() == vendor)
        .unwrap_or(false)
}

pub fn has_avx() -> bool {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .map(|info| info.has_avx())
        .unwrap_or(false)
}
