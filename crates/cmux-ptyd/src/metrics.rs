//! Process-wide counters rendered in the Prometheus text format.
//!
//! Counters are plain atomics so the metrics endpoint never takes the
//! registry lock. Session gauges are written by the registry after every
//! mutation, while it still holds its lock.

use std::{
    fmt::Write as _,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

use crate::ring::Eviction;

#[derive(Debug, Default)]
pub struct Metrics {
    sessions_active: AtomicU64,
    sessions_connected: AtomicU64,
    sessions_disconnected: AtomicU64,
    sessions_idle: AtomicU64,

    sessions_created: AtomicU64,
    sessions_resumed: AtomicU64,
    sessions_reaped: AtomicU64,
    sessions_exited: AtomicU64,
    admissions_rejected: AtomicU64,
    spawn_failures: AtomicU64,
    auth_failures: AtomicU64,
    resume_failures: AtomicU64,
    keepalive_timeouts: AtomicU64,
    fault_refusals: AtomicU64,
    readonly_blocked: AtomicU64,
    output_bytes: AtomicU64,
    output_dropped_bytes: AtomicU64,
    output_dropped_frames: AtomicU64,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_active: u64,
    pub sessions_connected: u64,
    pub sessions_disconnected: u64,
    pub sessions_idle: u64,
    pub sessions_created: u64,
    pub sessions_resumed: u64,
    pub sessions_reaped: u64,
    pub sessions_exited: u64,
    pub admissions_rejected: u64,
    pub spawn_failures: u64,
    pub auth_failures: u64,
    pub resume_failures: u64,
    pub keepalive_timeouts: u64,
    pub fault_refusals: u64,
    pub readonly_blocked: u64,
    pub output_bytes: u64,
    pub output_dropped_bytes: u64,
    pub output_dropped_frames: u64,
}

/// Session counts by state, as seen by the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionGauges {
    pub active: u64,
    pub connected: u64,
    pub disconnected: u64,
    pub idle: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sessions(&self, gauges: SessionGauges) {
        self.sessions_active.store(gauges.active, Ordering::Relaxed);
        self.sessions_connected
            .store(gauges.connected, Ordering::Relaxed);
        self.sessions_disconnected
            .store(gauges.disconnected, Ordering::Relaxed);
        self.sessions_idle.store(gauges.idle, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        bump(&self.sessions_created);
    }

    pub fn session_resumed(&self) {
        bump(&self.sessions_resumed);
    }

    pub fn session_reaped(&self) {
        bump(&self.sessions_reaped);
    }

    pub fn session_exited(&self) {
        bump(&self.sessions_exited);
    }

    pub fn admission_rejected(&self) {
        bump(&self.admissions_rejected);
    }

    pub fn spawn_failed(&self) {
        bump(&self.spawn_failures);
    }

    pub fn auth_failed(&self) {
        bump(&self.auth_failures);
    }

    pub fn resume_failed(&self) {
        bump(&self.resume_failures);
    }

    pub fn keepalive_timed_out(&self) {
        bump(&self.keepalive_timeouts);
    }

    pub fn fault_refused(&self) {
        bump(&self.fault_refusals);
    }

    pub fn readonly_blocked(&self) {
        bump(&self.readonly_blocked);
    }

    pub fn record_output(&self, bytes: usize, eviction: Eviction) {
        self.output_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if !eviction.is_empty() {
            self.output_dropped_bytes
                .fetch_add(eviction.bytes, Ordering::Relaxed);
            self.output_dropped_frames
                .fetch_add(eviction.frames, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_active: load(&self.sessions_active),
            sessions_connected: load(&self.sessions_connected),
            sessions_disconnected: load(&self.sessions_disconnected),
            sessions_idle: load(&self.sessions_idle),
            sessions_created: load(&self.sessions_created),
            sessions_resumed: load(&self.sessions_resumed),
            sessions_reaped: load(&self.sessions_reaped),
            sessions_exited: load(&self.sessions_exited),
            admissions_rejected: load(&self.admissions_rejected),
            spawn_failures: load(&self.spawn_failures),
            auth_failures: load(&self.auth_failures),
            resume_failures: load(&self.resume_failures),
            keepalive_timeouts: load(&self.keepalive_timeouts),
            fault_refusals: load(&self.fault_refusals),
            readonly_blocked: load(&self.readonly_blocked),
            output_bytes: load(&self.output_bytes),
            output_dropped_bytes: load(&self.output_dropped_bytes),
            output_dropped_frames: load(&self.output_dropped_frames),
        }
    }

    pub fn render_prometheus(&self) -> String {
        self.snapshot().render_prometheus()
    }
}

impl MetricsSnapshot {
    pub fn render_prometheus(&self) -> String {
        let gauges: [(&str, &str, u64); 4] = [
            (
                "ptyd_sessions_active",
                "Sessions in the registry",
                self.sessions_active,
            ),
            (
                "ptyd_sessions_connected",
                "Sessions with an attached client",
                self.sessions_connected,
            ),
            (
                "ptyd_sessions_disconnected",
                "Sessions waiting for a reconnect",
                self.sessions_disconnected,
            ),
            (
                "ptyd_sessions_idle",
                "Disconnected sessions past the grace period",
                self.sessions_idle,
            ),
        ];
        let counters: [(&str, &str, u64); 14] = [
            (
                "ptyd_sessions_created_total",
                "Sessions created",
                self.sessions_created,
            ),
            (
                "ptyd_sessions_resumed_total",
                "Successful reconnects",
                self.sessions_resumed,
            ),
            (
                "ptyd_sessions_reaped_total",
                "Sessions reaped after idling",
                self.sessions_reaped,
            ),
            (
                "ptyd_sessions_exited_total",
                "Sessions whose process exited",
                self.sessions_exited,
            ),
            (
                "ptyd_admissions_rejected_total",
                "Session requests rejected by admission caps",
                self.admissions_rejected,
            ),
            (
                "ptyd_spawn_failures_total",
                "Sessions that failed to start their process",
                self.spawn_failures,
            ),
            (
                "ptyd_auth_failures_total",
                "Connections rejected by the auth gate",
                self.auth_failures,
            ),
            (
                "ptyd_resume_failures_total",
                "Rejected reconnect attempts",
                self.resume_failures,
            ),
            (
                "ptyd_keepalive_timeouts_total",
                "Connections dropped for missing pongs",
                self.keepalive_timeouts,
            ),
            (
                "ptyd_fault_refusals_total",
                "Connections refused by fault injection",
                self.fault_refusals,
            ),
            (
                "ptyd_readonly_blocked_total",
                "Input chunks dropped in read-only mode",
                self.readonly_blocked,
            ),
            (
                "ptyd_output_bytes_total",
                "PTY output bytes buffered",
                self.output_bytes,
            ),
            (
                "ptyd_output_dropped_bytes_total",
                "Output bytes dropped by replay buffer eviction",
                self.output_dropped_bytes,
            ),
            (
                "ptyd_output_dropped_frames_total",
                "Output frames dropped by replay buffer eviction",
                self.output_dropped_frames,
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}
