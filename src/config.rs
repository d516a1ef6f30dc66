use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StreamError},
    logger::{Logger, TracingLogger},
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_READ_POOL_SIZE: usize = 16;

fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

/// What a stream does with writes that arrive after it was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterClose {
    /// Accept the bytes, report their length, drop them.
    #[default]
    Discard,
    /// Fail the write with `StreamError::Closed`.
    Reject,
}

/// Configuration for a hijacked stream.
///
/// - drain_partial_immediately: after a partial send inside `flush`, retry the
///   remainder in the same notification cycle instead of yielding back to the
///   reactor. Favors throughput over fairness between streams.
/// - flush_on_close: make one non-blocking drain attempt before detaching.
///   Whatever does not fit into the socket is still discarded.
/// - after_close: policy for writes submitted after `close()`.
#[derive(Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub drain_partial_immediately: bool,
    pub flush_on_close: bool,
    pub after_close: AfterClose,
    /// Logger for stream events
    #[serde(skip, default = "default_logger")]
    pub logger: Arc<dyn Logger>,
}

impl StreamConfig {
    /// Create a new builder for StreamConfig
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::new()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            drain_partial_immediately: true,
            flush_on_close: false,
            after_close: AfterClose::Discard,
            logger: default_logger(),
        }
    }
}

/// Builder for StreamConfig.
///
/// Unset fields fall back to StreamConfig::default().
#[derive(Default)]
pub struct StreamConfigBuilder {
    drain_partial_immediately: Option<bool>,
    flush_on_close: Option<bool>,
    after_close: Option<AfterClose>,
    logger: Option<Arc<dyn Logger>>,
}

impl StreamConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain_partial_immediately(mut self, enabled: bool) -> Self {
        self.drain_partial_immediately = Some(enabled);
        self
    }

    pub fn flush_on_close(mut self, enabled: bool) -> Self {
        self.flush_on_close = Some(enabled);
        self
    }

    pub fn after_close(mut self, policy: AfterClose) -> Self {
        self.after_close = Some(policy);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> StreamConfig {
        let default = StreamConfig::default();
        StreamConfig {
            drain_partial_immediately: self
                .drain_partial_immediately
                .unwrap_or(default.drain_partial_immediately),
            flush_on_close: self.flush_on_close.unwrap_or(default.flush_on_close),
            after_close: self.after_close.unwrap_or(default.after_close),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

/// Configuration for the [`EventLoop`](crate::event_loop::EventLoop).
///
/// ## Resource Limits
///
/// - events_capacity: maximum readiness events handled per poll iteration
/// - read_buffer_size: size of each pooled receive buffer
/// - read_pool_size: receive buffers allocated up front
#[derive(Clone, Serialize, Deserialize)]
pub struct EventLoopConfig {
    pub events_capacity: usize,
    pub poll_timeout: Duration,
    pub read_buffer_size: usize,
    pub read_pool_size: usize,
    #[serde(skip, default = "default_logger")]
    pub logger: Arc<dyn Logger>,
}

impl EventLoopConfig {
    pub fn builder() -> EventLoopConfigBuilder {
        EventLoopConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(StreamError::Configuration(
                "events_capacity must be greater than zero".into(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(StreamError::Configuration(
                "read_buffer_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_pool_size: DEFAULT_READ_POOL_SIZE,
            logger: default_logger(),
        }
    }
}

#[derive(Default)]
pub struct EventLoopConfigBuilder {
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    read_buffer_size: Option<usize>,
    read_pool_size: Option<usize>,
    logger: Option<Arc<dyn Logger>>,
}

impl EventLoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of events handled per poll
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    /// Set the poll timeout (balance between shutdown latency and wakeups)
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn read_pool_size(mut self, size: usize) -> Self {
        self.read_pool_size = Some(size);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> EventLoopConfig {
        let default = EventLoopConfig::default();
        EventLoopConfig {
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            read_buffer_size: self.read_buffer_size.unwrap_or(default.read_buffer_size),
            read_pool_size: self.read_pool_size.unwrap_or(default.read_pool_size),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}
