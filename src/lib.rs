//! eddyline — a single-threaded, readiness-based I/O reactor.
//!
//! eddyline multiplexes non-blocking descriptors and timers over one of
//! several interchangeable polling backends (edge-triggered epoll on
//! Linux, poll and select everywhere else) and layers a buffered,
//! vectored-I/O [`Stream`] abstraction plus TCP client/server helpers
//! on top. Everything is callback-driven and cooperative: a reactor and
//! all of its descriptors live on one thread, readiness is served in
//! fairness-bounded pump cycles, and [`Reactor::run`] returns once
//! every descriptor has closed and every timer has fired.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eddyline::{Buffer, Reactor, Stream};
//!
//! fn main() -> Result<(), eddyline::Error> {
//!     let reactor = Reactor::new()?;
//!     let (read_end, write_end) = eddyline::pipe()?;
//!     let rx = Stream::open(&reactor, read_end)?;
//!     let tx = Stream::open(&reactor, write_end)?;
//!
//!     rx.on_read(|stream, buffer| {
//!         println!("got {} bytes", buffer.len());
//!         stream.close();
//!     });
//!
//!     tx.push_buffer(&Buffer::from("hello"), 0, 0)?;
//!     tx.shutdown(); // drain, then close
//!     reactor.run()?;
//!     Ok(())
//! }
//! ```
//!
//! # Threading
//!
//! There is no locking and no work-stealing: one reactor, one thread.
//! Other threads hand work in through [`wake_channel`], which pairs a
//! message queue with a self-pipe registered like any other stream.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod io;
pub(crate) mod metrics;
pub(crate) mod reactor;
pub(crate) mod stream;
pub(crate) mod tcp;
pub(crate) mod timer;
pub(crate) mod wake;
pub(crate) mod wheel;

// ── Public modules ──────────────────────────────────────────────────────
pub mod backend;
pub mod config;
pub mod error;

// ── Re-exports: core types ──────────────────────────────────────────────

/// Refcounted immutable byte range with zero-copy views.
pub use buffer::Buffer;
/// Reactor configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// Polling backend selector.
pub use config::BackendKind;
/// Install a process-wide default [`Config`].
pub use config::set_default;
/// Reactor errors.
pub use error::Error;
/// The event loop: descriptor table, timer wheel, backend.
pub use reactor::Reactor;
/// One-shot timer on the reactor's wheel.
pub use timer::Timer;

// ── Re-exports: streams and TCP ─────────────────────────────────────────

/// Buffered stream over a registered descriptor.
pub use stream::Stream;
/// Outbound TCP connection (derefs to [`Stream`]).
pub use tcp::TcpClient;
/// Listening TCP socket delivering accepted descriptors.
pub use tcp::TcpServer;

// ── Re-exports: backend surface ─────────────────────────────────────────

/// OS polling facility adapter; implement to inject a custom backend.
pub use backend::Backend;
/// Readiness report from [`Backend::wait`].
pub use backend::Ready;
/// A registered descriptor, as seen by backends.
pub use io::Registration;

// ── Re-exports: cross-thread wakeup ─────────────────────────────────────

/// Sending half of a [`wake_channel`].
pub use wake::WakeSender;
/// Create a close-on-exec pipe.
pub use wake::pipe;
/// Message queue + self-pipe wakeup onto a reactor.
pub use wake::wake_channel;
