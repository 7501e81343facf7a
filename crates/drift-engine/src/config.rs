//! Engine configuration.

use drift_cdc::{ChunkingStrategy, DEFAULT_READ_BUFFER_SIZE};

use crate::EngineError;

/// Chunks in flight per hashing worker when `max_in_flight` is left at 0.
pub const IN_FLIGHT_PER_WORKER: usize = 2;

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How files are cut into chunks
    pub strategy: ChunkingStrategy,
    /// Hashing workers; 0 means one per available core
    pub workers: usize,
    /// Chunks read but not yet committed; 0 means
    /// `IN_FLIGHT_PER_WORKER` per worker.
    ///
    /// Bounds memory to roughly `max_in_flight * max_chunk_size`.
    pub max_in_flight: usize,
    /// Bytes requested from a source file per read
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::default(),
            workers: 0,
            max_in_flight: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with the given strategy.
    pub fn new(strategy: ChunkingStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Sets the number of hashing workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the in-flight chunk bound.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Sets the read buffer size.
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// Returns the number of hashing workers to start.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Returns the in-flight chunk bound.
    pub fn effective_max_in_flight(&self) -> usize {
        if self.max_in_flight > 0 {
            return self.max_in_flight;
        }
        self.effective_workers() * IN_FLIGHT_PER_WORKER
    }

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.strategy
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        if self.read_buffer_size == 0 {
            return Err(EngineError::InvalidConfig(
                "read_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_cdc::CdcParams;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.effective_workers() >= 1);
        assert_eq!(
            config.effective_max_in_flight(),
            config.effective_workers() * IN_FLIGHT_PER_WORKER
        );
    }

    #[test]
    fn test_explicit_values_win() {
        let config = EngineConfig::default()
            .with_workers(3)
            .with_max_in_flight(5);
        assert_eq!(config.effective_workers(), 3);
        assert_eq!(config.effective_max_in_flight(), 5);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let config = EngineConfig::new(ChunkingStrategy::ContentDefined(CdcParams::new(
            4096, 1024, 16384,
        )));
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        let config = EngineConfig::default().with_read_buffer_size(0);
        assert!(config.validate().is_err());
    }
}
