//! Configuration Module - MGC Configuration
//!
//! Defines all tunable parameters for the collector.
//!
//! Generation sizes are backend-specific. Leaving `generations` empty picks
//! the active backend's defaults; tests usually shrink them so collections
//! happen after a few hundred kilobytes of allocation.

use serde::{Deserialize, Serialize};

/// Parameters for one generation of the chain
///
/// Mirrors the generation chain of incremental collectors: a capacity that
/// triggers collection of the generation once exceeded, and the predicted
/// mortality used to estimate how much a collection will free.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Capacity in bytes before the generation is condemned
    pub capacity: usize,

    /// Expected fraction of objects that die in this generation (0.0 - 1.0)
    pub mortality: f64,
}

impl GenerationParams {
    /// Create generation parameters
    pub const fn new(capacity: usize, mortality: f64) -> Self {
        Self {
            capacity,
            mortality,
        }
    }
}

/// GcConfig - complete collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Size of one heap chunk in bytes
    ///
    /// Objects larger than a chunk get a dedicated chunk.
    /// Rounded up to the system page size.
    /// Default: 256KB
    pub chunk_size: usize,

    /// Upper bound on mapped heap memory in bytes
    ///
    /// Reservations that would exceed this fail with `OutOfMemory`
    /// after a full collection.
    /// Default: 1GB
    pub max_heap_size: usize,

    /// Generation chain, youngest first
    ///
    /// Empty selects the backend defaults. Must contain exactly three
    /// entries otherwise: nursery, intermediate, long-lived.
    pub generations: Vec<GenerationParams>,

    /// Size of a thread's private allocation buffer in bytes
    ///
    /// Default: 32KB
    pub alloc_buffer_size: usize,

    /// Number of allocations on one thread between finalization polls
    ///
    /// Default: 1000
    pub finalization_interval: usize,

    /// Most objects one thread's deferred-finalizer queue holds
    ///
    /// Finalizers deferred to a thread whose queue is full are dropped and
    /// reported as failed.
    /// Default: 4096
    pub finalizer_queue_capacity: usize,

    /// Number of freed type descriptors that triggers a type liveness sweep
    ///
    /// Default: 100
    pub type_sweep_threshold: usize,

    /// Bytes mapped up-front for the non-moving pool
    ///
    /// Keeps room for out-of-memory error objects even when the moving
    /// pools are exhausted.
    /// Default: 64KB
    pub reserve_size: usize,

    /// Enable verbose collector event logging
    pub verbose: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            chunk_size: 256 * KB,
            max_heap_size: GB,
            generations: Vec::new(),
            alloc_buffer_size: 32 * KB,
            finalization_interval: 1000,
            finalizer_queue_capacity: 4096,
            type_sweep_threshold: 100,
            reserve_size: 64 * KB,
            verbose: false,
        }
    }
}

impl GcConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mgc::GcConfig;
    ///
    /// let config = GcConfig {
    ///     chunk_size: 0,
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < 4 * KB {
            return Err(ConfigError::InvalidChunkSize(
                "chunk_size must be at least 4KB".to_string(),
            ));
        }

        if self.max_heap_size < self.chunk_size {
            return Err(ConfigError::InvalidHeapSize(
                "max_heap_size must hold at least one chunk".to_string(),
            ));
        }

        if !self.generations.is_empty() {
            if self.generations.len() != GENERATION_COUNT {
                return Err(ConfigError::InvalidGenerations(format!(
                    "expected {} generations, got {}",
                    GENERATION_COUNT,
                    self.generations.len()
                )));
            }

            for gen in &self.generations {
                if gen.capacity == 0 {
                    return Err(ConfigError::InvalidGenerations(
                        "generation capacity must be > 0".to_string(),
                    ));
                }
                if !(0.0..=1.0).contains(&gen.mortality) {
                    return Err(ConfigError::InvalidGenerations(
                        "mortality must be between 0.0 and 1.0".to_string(),
                    ));
                }
            }
        }

        if self.alloc_buffer_size < 256 || self.alloc_buffer_size > self.chunk_size {
            return Err(ConfigError::InvalidBufferSize(
                "alloc_buffer_size must be between 256 bytes and chunk_size".to_string(),
            ));
        }

        if self.finalization_interval == 0 {
            return Err(ConfigError::InvalidInterval(
                "finalization_interval must be > 0".to_string(),
            ));
        }

        if self.finalizer_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(
                "finalizer_queue_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Generation chain, falling back to `defaults` when none is configured
    pub fn generations_or(&self, defaults: &[GenerationParams]) -> Vec<GenerationParams> {
        if self.generations.is_empty() {
            defaults.to_vec()
        } else {
            self.generations.clone()
        }
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - MGC_CHUNK_SIZE
    /// - MGC_MAX_HEAP
    /// - MGC_FINALIZATION_INTERVAL
    /// - MGC_FINALIZER_QUEUE
    /// - MGC_VERBOSE
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MGC_CHUNK_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("MGC_MAX_HEAP") {
            if let Ok(size) = val.parse::<usize>() {
                config.max_heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("MGC_FINALIZATION_INTERVAL") {
            if let Ok(n) = val.parse::<usize>() {
                config.finalization_interval = n;
            }
        }

        if let Ok(val) = std::env::var("MGC_FINALIZER_QUEUE") {
            if let Ok(n) = val.parse::<usize>() {
                config.finalizer_queue_capacity = n;
            }
        }

        if let Ok(val) = std::env::var("MGC_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid generations: {0}")]
    InvalidGenerations(String),

    #[error("Invalid allocation buffer size: {0}")]
    InvalidBufferSize(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid queue capacity: {0}")]
    InvalidQueueCapacity(String),
}

/// Number of generations every backend runs with
pub const GENERATION_COUNT: usize = 3;

pub(crate) const KB: usize = 1024;
pub(crate) const MB: usize = 1024 * 1024;
const GB: usize = 1024 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.finalization_interval, 1000);
        assert_eq!(config.type_sweep_threshold, 100);
        assert_eq!(config.finalizer_queue_capacity, 4096);
    }

    #[test]
    fn test_empty_finalizer_queue_rejected() {
        let config = GcConfig {
            finalizer_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQueueCapacity(_))));
    }

    #[test]
    fn test_invalid_generation_count() {
        let config = GcConfig {
            generations: vec![GenerationParams::new(MB, 0.9)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_mortality() {
        let config = GcConfig {
            generations: vec![
                GenerationParams::new(MB, 1.5),
                GenerationParams::new(MB, 0.5),
                GenerationParams::new(MB, 0.1),
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generations_fallback() {
        let defaults = [
            GenerationParams::new(MB, 0.9),
            GenerationParams::new(10 * MB, 0.5),
            GenerationParams::new(100 * MB, 0.1),
        ];
        let config = GcConfig::default();
        assert_eq!(config.generations_or(&defaults), defaults.to_vec());
    }
}
