//! Recover a running kernel's KASLR slide from cache-timing side effects
pub mod context;
pub mod error;
pub mod image;
pub mod logging;
pub mod slide;
pub mod uarch;

pub use error::{Error, ErrorKind};

pub mod prelude {
    pub use crate::image::{locate_segment, KernelImage, Segment};
    pub use crate::slide::{
        RunLength, SearchConfig, SearchObserver, SlideResult, SlideSearch,
    };
    pub use crate::uarch::cache::{CacheGeometry, CacheSource};
    pub use crate::uarch::oracle::{CacheOracle, LatencyOracle, Probe};
    pub use crate::uarch::pin_cpu;
}
