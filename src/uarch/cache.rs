//! Host cache geometry, queried once per run
use raw_cpuid::{CacheType, CpuId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} failed: {1}")]
    QueryError(&'static str, String),

    #[error("{0} is unavailable on this host")]
    Unavailable(&'static str),

    #[error("Invalid cache geometry: {0}")]
    InvalidGeometry(String),
}

/// Where the geometry is read from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheSource {
    /// sysctl on macOS, sysconf on Linux
    #[default]
    System,
    /// The deterministic cache parameters leaf of cpuid
    Cpuid,
}

/// Only constructed through `new`, so `line_size >= 8` and
/// `cache_size >= line_size` always hold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheGeometry {
    cache_size: usize,
    line_size: usize,
}

impl CacheGeometry {
    pub fn new(cache_size: usize, line_size: usize) -> Result<CacheGeometry, Error> {
        if line_size < 8 {
            return Err(Error::InvalidGeometry(
                format!("cache line of {line_size} bytes is smaller than a qword")
            ));
        }
        if cache_size < line_size {
            return Err(Error::InvalidGeometry(
                format!("cache of {cache_size} bytes holds no {line_size} byte line")
            ));
        }
        Ok(CacheGeometry { cache_size, line_size })
    }

    pub fn probe(source: CacheSource) -> Result<CacheGeometry, Error> {
        let (cache_size, line_size) = match source {
            CacheSource::System => system_geometry()?,
            CacheSource::Cpuid => cpuid_geometry()?,
        };
        CacheGeometry::new(cache_size, line_size)
    }

    /// Total size of the last-level cache, in bytes
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn lines(&self) -> usize {
        self.cache_size / self.line_size
    }
}

#[cfg(target_os = "macos")]
fn sysctl_u32(name: &'static str) -> Result<usize, Error> {
    use std::ffi::CString;

    let cname = CString::new(name)
        .map_err(|e| Error::QueryError(name, e.to_string()))?;
    let mut value: u32 = 0;
    let mut size = std::mem::size_of::<u32>();
    let ret = unsafe {
        libc::sysctlbyname(
            cname.as_ptr(),
            &mut value as *mut u32 as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::QueryError(name, err.to_string()));
    }
    if value == 0 {
        return Err(Error::Unavailable(name));
    }
    Ok(value as usize)
}

#[cfg(target_os = "macos")]
fn system_geometry() -> Result<(usize, usize), Error> {
    Ok((sysctl_u32("hw.l3cachesize")?, sysctl_u32("hw.cachelinesize")?))
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn sysconf(name: &'static str, key: libc::c_int) -> Result<usize, Error> {
    let value = unsafe { libc::sysconf(key) };
    if value < 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::QueryError(name, err.to_string()));
    }
    // glibc reports 0 when it cannot tell
    if value == 0 {
        return Err(Error::Unavailable(name));
    }
    Ok(value as usize)
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn system_geometry() -> Result<(usize, usize), Error> {
    Ok((
        sysconf("sysconf(_SC_LEVEL3_CACHE_SIZE)", libc::_SC_LEVEL3_CACHE_SIZE)?,
        sysconf("sysconf(_SC_LEVEL1_DCACHE_LINESIZE)", libc::_SC_LEVEL1_DCACHE_LINESIZE)?,
    ))
}

#[cfg(not(any(target_os = "macos", all(target_os = "linux", target_env = "gnu"))))]
fn system_geometry() -> Result<(usize, usize), Error> {
    Err(Error::Unavailable("system cache configuration"))
}

/// Take the outermost data or unified cache described by cpuid leaf 4
fn cpuid_geometry() -> Result<(usize, usize), Error> {
    let params = CpuId::new()
        .get_cache_parameters()
        .ok_or(Error::Unavailable("cpuid cache parameters"))?;

    params
        .filter(|c| matches!(c.cache_type(), CacheType::Data | CacheType::Unified))
        .max_by_key(|c| c.level())
        .map(|c| {
            let line = c.coherency_line_size();
            (c.associativity() * c.physical_line_partitions() * line * c.sets(), line)
        })
        .ok_or(Error::Unavailable("cpuid last-level cache"))
}
