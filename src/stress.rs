//! The stress driver: iteration loop, mode policy, and size selection.
//!
//! Each iteration draws a random size (1–512 whole pages) and an allocation
//! kind, allocates, maps, touches/verifies, and releases — fully, before the
//! next iteration starts.  The first error of any kind propagates up
//! immediately; the caller terminates the process.

use crate::pattern::{self, PatternError};
use crate::provider::{
    self, GuestMemoryProvider, MappedRegion, ProviderError, VmContext, PAGE_SIZE,
};
use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use thiserror::Error;

/// Reference iteration count of the stress run.
pub const DEFAULT_ITERATIONS: u64 = 5000;

/// Largest allocation, in pages (2 MB).
pub const MAX_PAGES: usize = 512;

/// How often a progress line is emitted.
const PROGRESS_INTERVAL: u64 = 100;

/// Allocation-kind policy, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Pick anonymous or guest-backed uniformly at random per iteration.
    Mixed,
    /// Anonymous mmap only.
    Anon,
    /// guest_memfd-backed only.
    Guest,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Mixed => "mixed",
            Mode::Anon => "anon",
            Mode::Guest => "guest",
        }
    }
}

/// An unrecognized `--mode` value.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown mode: {0}")]
pub struct UnknownMode(String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mixed" => Ok(Mode::Mixed),
            "anon" => Ok(Mode::Anon),
            "guest" => Ok(Mode::Guest),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// What one iteration allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Anonymous,
    GuestBacked,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocKind::Anonymous => write!(f, "Anonymous"),
            AllocKind::GuestBacked => write!(f, "GuestMemfd"),
        }
    }
}

/// Configuration for a stress run.  No process-wide globals: the seed and
/// iteration count are injected here so runs can be replayed exactly.
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub mode: Mode,
    pub iterations: u64,
    /// Include `GUEST_MEMFD_FLAG_NO_DIRECT_MAP` when creating guest_memfds.
    pub no_direct_map: bool,
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Mixed,
            iterations: DEFAULT_ITERATIONS,
            no_direct_map: true,
            seed: 42,
        }
    }
}

/// Errors that abort a stress run.
#[derive(Error, Debug)]
pub enum StressError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("[{kind}] {source}")]
    Verify {
        kind: AllocKind,
        #[source]
        source: PatternError,
    },
}

/// Pick the allocation kind for one iteration.
pub fn select_kind(mode: Mode, rng: &mut ChaCha8Rng) -> AllocKind {
    match mode {
        Mode::Anon => AllocKind::Anonymous,
        Mode::Guest => AllocKind::GuestBacked,
        Mode::Mixed => {
            if rng.gen_bool(0.5) {
                AllocKind::Anonymous
            } else {
                AllocKind::GuestBacked
            }
        }
    }
}

/// Draw a uniformly random size of 1–512 whole pages, in bytes.
pub fn draw_size(rng: &mut ChaCha8Rng) -> usize {
    rng.gen_range(1..=MAX_PAGES) * PAGE_SIZE
}

/// Owns the loop state: configuration, RNG, and the guest-memory provider.
pub struct StressDriver<P: GuestMemoryProvider = VmContext> {
    config: StressConfig,
    rng: ChaCha8Rng,
    provider: P,
}

impl StressDriver<VmContext> {
    /// Open the KVM root handle and VM context and seed the RNG.
    pub fn new(config: StressConfig) -> Result<Self, StressError> {
        let vm = VmContext::new()?;
        if config.mode != Mode::Anon && !vm.supports_guest_memfd() {
            warn!("KVM_CAP_GUEST_MEMFD not reported; guest-backed allocations will likely fail");
        }
        Ok(Self::with_provider(config, vm))
    }
}

impl<P: GuestMemoryProvider> StressDriver<P> {
    /// Seed the RNG and drive iterations through the given provider.
    pub fn with_provider(config: StressConfig, provider: P) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        debug!("stress config: {:?}", config);
        Self {
            config,
            rng,
            provider,
        }
    }

    /// Run all iterations, stopping at the first failure.
    pub fn run(&mut self) -> Result<(), StressError> {
        println!(
            "Starting stress test in {} mode with {} iterations...",
            self.config.mode.as_str(),
            self.config.iterations,
        );

        for i in 0..self.config.iterations {
            if i % PROGRESS_INTERVAL == 0 {
                print!("Iteration {}\r", i);
                io::stdout().flush().ok();
            }

            let size = draw_size(&mut self.rng);
            match select_kind(self.config.mode, &mut self.rng) {
                AllocKind::Anonymous => self.run_anonymous(size)?,
                AllocKind::GuestBacked => self.run_guest_backed(size)?,
            }
        }

        println!("\nTest completed successfully.");
        Ok(())
    }

    /// One anonymous iteration: map, touch/verify, unmap.
    fn run_anonymous(&self, size: usize) -> Result<(), StressError> {
        let region = MappedRegion::anonymous(size)?;
        pattern::touch(&region).map_err(|source| StressError::Verify {
            kind: AllocKind::Anonymous,
            source,
        })?;
        region.unmap()?;
        Ok(())
    }

    /// One guest-backed iteration: create the guest_memfd with the composed
    /// flags, map it shared, touch/verify, unmap, close — in that order.
    fn run_guest_backed(&self, size: usize) -> Result<(), StressError> {
        let flags = provider::guest_memfd_flags(self.config.no_direct_map);
        let memfd = self.provider.create_guest_memfd(size, flags)?;
        let region = MappedRegion::from_guest_memfd(&memfd, size)?;
        pattern::touch(&region).map_err(|source| StressError::Verify {
            kind: AllocKind::GuestBacked,
            source,
        })?;
        region.unmap()?;
        memfd.close()?;
        Ok(())
    }
}
