//! Runtime metrics.
//!
//! Static counters and gauges for connection lifecycle, byte flow, and
//! loop activity. Registered with `metriken` so a host application can
//! expose them alongside its own metrics.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "loopline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "loopline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "loopline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "loopline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "loopline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Loop activity ────────────────────────────────────────────────

#[metric(
    name = "loopline/loop/wakeups",
    description = "Cross-thread wakeups delivered via eventfd"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "loopline/loop/tasks",
    description = "Pending tasks executed by loops"
)]
pub static LOOP_TASKS: Counter = Counter::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(name = "loopline/timers/fired", description = "Timer callbacks fired")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(name = "loopline/timers/cancelled", description = "Timers cancelled before firing")]
pub static TIMERS_CANCELLED: Counter = Counter::new();

// ── Acceptor ─────────────────────────────────────────────────────

#[metric(
    name = "loopline/accept/fd_exhausted_recoveries",
    description = "Idle-reserve recoveries after accept hit the descriptor limit"
)]
pub static ACCEPT_FD_EXHAUSTED_RECOVERIES: Counter = Counter::new();
