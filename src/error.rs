use crate::{image, slide, uarch};

/// Broad failure classes, each fatal to a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Environment,
    Format,
    Allocation,
    Config,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    ImageError(#[from] image::Error),

    #[error("{0}")]
    CacheError(#[from] uarch::cache::Error),

    #[error("{0}")]
    OracleError(#[from] uarch::oracle::Error),

    #[error("{0}")]
    PinError(#[from] uarch::Error),

    #[error("{0}")]
    SearchError(#[from] slide::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ImageError(e) if e.is_environment() => ErrorKind::Environment,
            Error::ImageError(_) => ErrorKind::Format,
            Error::CacheError(_) | Error::PinError(_) => ErrorKind::Environment,
            Error::OracleError(_) => ErrorKind::Allocation,
            Error::SearchError(slide::Error::AllocationError(..)) => ErrorKind::Allocation,
            Error::SearchError(slide::Error::ConfigError(_)) => ErrorKind::Config,
        }
    }

    /// The stage of the run that failed, used to tag error output
    pub fn step(&self) -> &'static str {
        match self {
            Error::ImageError(e) if e.is_environment() => "image",
            Error::ImageError(_) => "segment",
            Error::CacheError(_) => "cache",
            Error::OracleError(_) => "oracle",
            Error::PinError(_) => "affinity",
            Error::SearchError(_) => "search",
        }
    }
}
