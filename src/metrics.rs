//! Prometheus metrics for the market feed

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{FeedError, Result};

/// Counters and gauges of one feed instance
///
/// Each instance owns its own [`Registry`] so that several feeds (or tests)
/// can coexist in one process.
#[derive(Clone)]
pub struct FeedMetrics {
    registry: Registry,
    pub frames_received: IntCounter,
    pub decode_errors: IntCounter,
    pub dropped_frames: IntCounterVec,
    pub dispatched: IntCounter,
    pub callback_panics: IntCounter,
    pub reconnects: IntCounter,
    pub connection_state: IntGauge,
    pub live_channels: IntGauge,
}

impl FeedMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames_received = IntCounter::new(
            "market_feed_frames_received_total",
            "Text frames received from the upstream connection",
        )?;
        let decode_errors = IntCounter::new(
            "market_feed_decode_errors_total",
            "Frames dropped because they could not be decoded",
        )?;
        let dropped_frames = IntCounterVec::new(
            Opts::new(
                "market_feed_dropped_frames_total",
                "Decoded frames dropped without dispatch",
            ),
            &["reason"],
        )?;
        let dispatched = IntCounter::new(
            "market_feed_dispatched_total",
            "Payload deliveries to subscriber callbacks",
        )?;
        let callback_panics = IntCounter::new(
            "market_feed_callback_panics_total",
            "Subscriber callbacks that panicked during dispatch",
        )?;
        let reconnects = IntCounter::new(
            "market_feed_reconnects_total",
            "Reconnect attempts after a failed or lost connection",
        )?;
        let connection_state = IntGauge::new(
            "market_feed_connection_state",
            "0 = disconnected, 1 = connecting, 2 = connected",
        )?;
        let live_channels = IntGauge::new(
            "market_feed_live_channels",
            "Channel keys with at least one subscriber",
        )?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(dropped_frames.clone()))?;
        registry.register(Box::new(dispatched.clone()))?;
        registry.register(Box::new(callback_panics.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(live_channels.clone()))?;

        Ok(Self {
            registry,
            frames_received,
            decode_errors,
            dropped_frames,
            dispatched,
            callback_panics,
            reconnects,
            connection_state,
            live_channels,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count of frames dropped for `reason`
    pub fn dropped(&self, reason: &str) -> u64 {
        self.dropped_frames.with_label_values(&[reason]).get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| FeedError::MetricsError(e.to_string()))
    }
}
