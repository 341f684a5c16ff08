//! Engine tuning knobs shared by the listener, connections, and exchanges.
//!
//! `EngineConfig` is plain data with builder-style setters; it is validated
//! once when the server binds, so the hot path never re-checks limits.

use thiserror::Error;

use crate::pool::PoolConfig;

/// Default number of writable bytes requested per read event.
pub const DEFAULT_READ_CHUNK: usize = 2048;
/// Default cap on a connection's intake store.
pub const DEFAULT_MAX_INPUT_BUFFER: usize = 1024 * 1024;
/// Default cap on the request line plus header block.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;
/// Default cap on a request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
/// Default unsent-byte threshold that pauses intake.
pub const DEFAULT_OUTPUT_BACKLOG_LIMIT: usize = 64 * 1024;

/// Errors detected while validating an [`EngineConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `read_chunk` was zero.
    #[error("read chunk must be greater than zero")]
    ZeroReadChunk,
    /// The intake cap cannot hold a single read chunk.
    #[error("max input buffer {max} is smaller than read chunk {chunk}")]
    InputBufferTooSmall { max: usize, chunk: usize },
    /// The head limit exceeds what the intake store may ever hold.
    #[error("max head bytes {head} exceeds max input buffer {max}")]
    HeadExceedsInputBuffer { head: usize, max: usize },
    /// `output_backlog_limit` was zero, which would pause intake permanently.
    #[error("output backlog limit must be greater than zero")]
    ZeroBacklogLimit,
}

/// Tunable limits for the socket engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Writable bytes requested from the intake store per read event.
    pub read_chunk: usize,
    /// Upper bound on the intake store; exceeding it ends the connection.
    pub max_input_buffer: usize,
    /// Upper bound on the request line plus header block.
    pub max_head_bytes: usize,
    /// Upper bound on a request body.
    pub max_body_bytes: usize,
    /// Unsent output bytes beyond which intake pauses.
    pub output_backlog_limit: usize,
    /// Free-list capacities for the server's buffer pool.
    pub pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            max_input_buffer: DEFAULT_MAX_INPUT_BUFFER,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            output_backlog_limit: DEFAULT_OUTPUT_BACKLOG_LIMIT,
            pool: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the documented defaults.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Set the per-read pin size.
    #[must_use]
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes;
        self
    }

    /// Set the intake store cap.
    #[must_use]
    pub fn max_input_buffer(mut self, bytes: usize) -> Self {
        self.max_input_buffer = bytes;
        self
    }

    /// Set the request head cap.
    #[must_use]
    pub fn max_head_bytes(mut self, bytes: usize) -> Self {
        self.max_head_bytes = bytes;
        self
    }

    /// Set the request body cap.
    #[must_use]
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Set the unsent-output threshold that pauses intake.
    #[must_use]
    pub fn output_backlog_limit(mut self, bytes: usize) -> Self {
        self.output_backlog_limit = bytes;
        self
    }

    /// Set the buffer pool's free-list capacities.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Check the limits for internal consistency.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk == 0 {
            return Err(ConfigError::ZeroReadChunk);
        }
        if self.max_input_buffer < self.read_chunk {
            return Err(ConfigError::InputBufferTooSmall {
                max: self.max_input_buffer,
                chunk: self.read_chunk,
            });
        }
        if self.max_head_bytes > self.max_input_buffer {
            return Err(ConfigError::HeadExceedsInputBuffer {
                head: self.max_head_bytes,
                max: self.max_input_buffer,
            });
        }
        if self.output_backlog_limit == 0 {
            return Err(ConfigError::ZeroBacklogLimit);
        }
        Ok(())
    }
}
