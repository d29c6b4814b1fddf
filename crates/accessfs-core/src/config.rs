// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for AccessFS Core

/// Resource limits
#[derive(Clone, Debug)]
pub struct CoreLimits {
    /// Maximum number of concurrently open primitives (handles + streams)
    pub max_open_primitives: usize,
    /// Maximum number of live change subscriptions
    pub max_subscriptions: usize,
}

impl Default for CoreLimits {
    fn default() -> Self {
        Self {
            max_open_primitives: 1024,
            max_subscriptions: 256,
        }
    }
}

/// Change delivery policy.
///
/// Delivery is best-effort and batched: raw mutation signals inside the
/// coalescing window may be merged into a single record per entry.
#[derive(Clone, Debug)]
pub struct NotifyPolicy {
    /// How long the delivery worker keeps draining before flushing a batch,
    /// in milliseconds. Zero flushes whatever is immediately pending.
    pub coalesce_window_ms: u64,
    /// Upper bound on raw signals folded into one batch
    pub max_batch: usize,
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 0,
            max_batch: 256,
        }
    }
}

/// Top-level engine configuration
#[derive(Clone, Debug, Default)]
pub struct CoreConfig {
    /// Whether mutations produce change records at all
    pub track_changes: bool,
    pub limits: CoreLimits,
    pub notify: NotifyPolicy,
}
