//! eddyline runtime metrics.
//!
//! Counters for descriptor lifecycle, bytes moved, timer activity, and
//! backend waits. Registered with metriken for exposition by whatever
//! admin surface the embedding application provides.

use metriken::{Counter, Gauge, metric};

// ── Descriptor lifecycle ─────────────────────────────────────────

#[metric(
    name = "eddyline/descriptors/registered",
    description = "Total descriptors registered with a reactor"
)]
pub static DESCRIPTORS_REGISTERED: Counter = Counter::new();

#[metric(
    name = "eddyline/descriptors/closed",
    description = "Total descriptors closed"
)]
pub static DESCRIPTORS_CLOSED: Counter = Counter::new();

#[metric(
    name = "eddyline/descriptors/active",
    description = "Currently registered descriptors"
)]
pub static DESCRIPTORS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "eddyline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "eddyline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(name = "eddyline/timers/armed", description = "Total timer arms")]
pub static TIMERS_ARMED: Counter = Counter::new();

#[metric(name = "eddyline/timers/fired", description = "Total timer firings")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "eddyline/timers/cancelled",
    description = "Total timer cancellations"
)]
pub static TIMERS_CANCELLED: Counter = Counter::new();

// ── Reactor ──────────────────────────────────────────────────────

#[metric(
    name = "eddyline/backend/waits",
    description = "Total backend wait calls"
)]
pub static BACKEND_WAITS: Counter = Counter::new();

#[metric(
    name = "eddyline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "eddyline/connections/established",
    description = "Total outbound connections established"
)]
pub static CONNECTIONS_ESTABLISHED: Counter = Counter::new();

#[metric(
    name = "eddyline/wake/notifications",
    description = "Total cross-thread wake bytes written"
)]
pub static WAKE_NOTIFICATIONS: Counter = Counter::new();
