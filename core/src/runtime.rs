//! Global worker pool shared by detection, sub-pixel refinement, residual
//! evaluation and remap table construction.

use std::env;
use std::sync::OnceLock;

use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};

pub const THREADS_ENV: &str = "CV_CALIB_THREADS";

static POOL: OnceLock<Result<usize, String>> = OnceLock::new();

/// Where the worker count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadSource {
    Argument,
    Environment,
    Default,
}

/// Builds the global pool once and returns its worker count.
///
/// An explicit `num_threads` wins over `CV_CALIB_THREADS`; without either the
/// rayon default (one worker per logical CPU) is used. Later calls return the
/// outcome of the first one, whatever they ask for.
pub fn init_global_thread_pool(num_threads: Option<usize>) -> Result<usize, String> {
    let mut first = false;
    let outcome = POOL.get_or_init(|| {
        first = true;
        let (requested, source) = match num_threads {
            Some(n) => (Some(n), ThreadSource::Argument),
            None => match env::var(THREADS_ENV) {
                Ok(raw) => (Some(parse_thread_count(&raw)?), ThreadSource::Environment),
                Err(env::VarError::NotPresent) => (None, ThreadSource::Default),
                Err(e) => return Err(format!("failed to read {THREADS_ENV}: {e}")),
            },
        };
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("cv-calib-{i}"));
        if let Some(n) = requested {
            if n == 0 {
                return Err("worker count must be >= 1".to_string());
            }
            builder = builder.num_threads(n);
        }
        builder.build_global().map_err(|e| e.to_string())?;
        let workers = rayon::current_num_threads();
        info!(workers, ?source, "calibration worker pool ready");
        Ok(workers)
    });
    if !first {
        match (outcome, num_threads) {
            (Ok(workers), Some(n)) if *workers != n => {
                warn!(requested = n, workers, "worker pool already initialised, request ignored")
            }
            _ => debug!("worker pool already initialised"),
        }
    }
    outcome.clone()
}

pub fn current_cpu_threads() -> usize {
    rayon::current_num_threads()
}

/// Parses a `CV_CALIB_THREADS` value.
fn parse_thread_count(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(format!("{THREADS_ENV} must be >= 1")),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("{THREADS_ENV} must be a positive integer, got '{raw}'")),
    }
}
