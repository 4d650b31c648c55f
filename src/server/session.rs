//! Per-peer server state and the slab registry that owns it.
//!
//! Each connected peer (TCP) or known peer address (UDP) gets a
//! `ClientSession` holding its rate window, report clock, and the time it
//! was last heard from.

use crate::rate::{RateWindow, ReportClock};
use slab::Slab;
use std::time::{Duration, Instant};

/// Rate tracking for one peer.
#[derive(Debug, Clone)]
pub struct ClientSession {
    window: RateWindow,
    clock: ReportClock,
    last_activity: Instant,
}

impl ClientSession {
    /// Create a session first seen at `now`.
    pub fn new(now: Instant, report_interval: Duration) -> Self {
        Self {
            window: RateWindow::default(),
            clock: ReportClock::new(now, report_interval),
            last_activity: now,
        }
    }

    /// Record `n` bytes received at `now`; returns a rate when a report is due.
    pub fn record(&mut self, n: usize, now: Instant) -> Option<f64> {
        self.last_activity = now;
        self.window.record(n, now);
        self.clock.poll(&self.window, now)
    }

    /// Time since the peer was last heard from (or since the session began).
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Clear the window if its newest sample is older than `stale_after`.
    ///
    /// Returns true when the window was cleared.
    pub fn reset_if_stale(&mut self, now: Instant, stale_after: Duration) -> bool {
        match self.window.last_sample() {
            Some(last) if now.saturating_duration_since(last) > stale_after => {
                self.window.clear();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn window(&self) -> &RateWindow {
        &self.window
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations, and refuses new
/// entries once `max_connections` are held.
pub struct SessionRegistry<C> {
    connections: Slab<C>,
    max_connections: usize,
}

impl<C> SessionRegistry<C> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: C) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut C> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<C> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &C)> {
        self.connections.iter()
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = C> + '_ {
        self.connections.drain()
    }
}
