use std::sync::Mutex;
use std::time::Duration;

use crate::error::Error;

/// Polling backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Edge-triggered epoll (Linux).
    Epoll,
    /// poll(2), watch set rebuilt every call.
    Poll,
    /// select(2), limited to `FD_SETSIZE` descriptors.
    Select,
}

/// Configuration for a [`Reactor`](crate::Reactor).
///
/// Chosen once at construction; a reactor never changes backend or wheel
/// geometry afterwards. Process-wide defaults can be installed with
/// [`set_default`] before the first reactor is built.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend override. `None` selects automatically: epoll on Linux,
    /// then poll, then select. The `EDDYLINE_BACKEND` environment
    /// variable (`epoll` / `poll` / `select`) narrows automatic
    /// selection the same way.
    pub backend: Option<BackendKind>,
    /// Number of timer wheel slots. One revolution spans
    /// `wheel_slots * tick_resolution_ms` milliseconds; longer delays
    /// ride extra revolutions.
    pub wheel_slots: usize,
    /// Timer wheel tick resolution in milliseconds. Timer firing is
    /// accurate to one tick.
    pub tick_resolution_ms: u64,
    /// Read fairness budget: max read-pump iterations per readiness
    /// notification per descriptor.
    pub read_limit: u8,
    /// Write fairness budget, symmetric to `read_limit`.
    pub write_limit: u8,
    /// Size of each scratch region filled by one vectored read. Each
    /// filled region is delivered to `on_read` as one `Buffer`.
    pub read_buffer_size: usize,
    /// Max consecutive buffer entries sent in a single `writev`.
    pub write_batch: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Max events drained per epoll_wait call.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: None,
            wheel_slots: 256,
            tick_resolution_ms: 100,
            read_limit: 4,
            write_limit: 4,
            read_buffer_size: 2048,
            write_batch: 8,
            backlog: 1024,
            max_events: 256,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is
    /// out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.wheel_slots == 0 {
            return Err(Error::Config("wheel_slots must be > 0".into()));
        }
        if self.tick_resolution_ms == 0 {
            return Err(Error::Config("tick_resolution_ms must be > 0".into()));
        }
        if self.read_limit == 0 || self.write_limit == 0 {
            return Err(Error::Config("pump limits must be > 0".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be > 0".into()));
        }
        if self.write_batch == 0 || self.write_batch > 64 {
            return Err(Error::Config("write_batch must be in 1..=64".into()));
        }
        if self.max_events == 0 {
            return Err(Error::Config("max_events must be > 0".into()));
        }
        Ok(())
    }

    /// Wheel tick resolution as a `Duration`.
    pub(crate) fn tick_resolution(&self) -> Duration {
        Duration::from_millis(self.tick_resolution_ms)
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from the process-wide default configuration.
    pub fn new() -> Self {
        ConfigBuilder {
            config: default_config(),
        }
    }

    /// Force a specific polling backend.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = Some(kind);
        self
    }

    /// Set the timer wheel slot count.
    pub fn wheel_slots(mut self, slots: usize) -> Self {
        self.config.wheel_slots = slots;
        self
    }

    /// Set the timer wheel tick resolution in milliseconds.
    pub fn tick_resolution_ms(mut self, ms: u64) -> Self {
        self.config.tick_resolution_ms = ms;
        self
    }

    /// Set the read fairness budget.
    pub fn read_limit(mut self, limit: u8) -> Self {
        self.config.read_limit = limit;
        self
    }

    /// Set the write fairness budget.
    pub fn write_limit(mut self, limit: u8) -> Self {
        self.config.write_limit = limit;
        self
    }

    /// Set the scratch region size for vectored reads.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the writev batch size.
    pub fn write_batch(mut self, batch: usize) -> Self {
        self.config.write_batch = batch;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

static DEFAULT: Mutex<Option<Config>> = Mutex::new(None);

/// Install a process-wide default configuration.
///
/// Affects every reactor subsequently built with
/// [`Reactor::new`](crate::Reactor::new); reactors built with an explicit
/// config are unaffected. Call before the first reactor is constructed.
pub fn set_default(config: Config) {
    *DEFAULT.lock().unwrap() = Some(config);
}

/// The current process-wide default configuration.
pub(crate) fn default_config() -> Config {
    DEFAULT.lock().unwrap().clone().unwrap_or_default()
}
