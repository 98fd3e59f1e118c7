//! Message router
//!
//! Decodes inbound frames and hands each payload to the registry. Nothing
//! here returns an error to the transport: bad frames are counted and dropped.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::metrics::FeedMetrics;
use crate::parser::ParsedFrame;
use crate::registry::ChannelRegistry;

pub struct MessageRouter {
    registry: Arc<ChannelRegistry>,
    metrics: FeedMetrics,
}

impl MessageRouter {
    pub fn new(registry: Arc<ChannelRegistry>, metrics: FeedMetrics) -> Self {
        Self { registry, metrics }
    }

    /// Process one raw text frame; returns the number of callback deliveries
    pub fn on_frame(&self, raw: &str) -> usize {
        self.metrics.frames_received.inc();
        match ParsedFrame::parse(raw) {
            Ok(frame) => self.route(frame),
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(error = %e, len = raw.len(), "Dropping undecodable frame");
                0
            }
        }
    }

    /// Process one binary frame, which must hold UTF-8 JSON
    pub fn on_binary(&self, data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(text) => self.on_frame(text),
            Err(e) => {
                self.metrics.frames_received.inc();
                self.metrics.decode_errors.inc();
                warn!(error = %e, len = data.len(), "Dropping binary frame that is not UTF-8");
                0
            }
        }
    }

    fn route(&self, frame: ParsedFrame) -> usize {
        match frame {
            ParsedFrame::Event { key, event } => {
                let delivered = self.registry.dispatch(&key, &event);
                if delivered == 0 {
                    trace!(channel = %key, "No subscribers for frame");
                }
                delivered
            }
            ParsedFrame::Batch(items) => items.into_iter().map(|item| self.route_item(item)).sum(),
            ParsedFrame::Ack(message) => {
                debug!(message = %message, "Server acknowledged control message");
                0
            }
            ParsedFrame::Rejected(message) => {
                self.metrics
                    .dropped_frames
                    .with_label_values(&["server_error"])
                    .inc();
                warn!(message = %message, "Server rejected request");
                0
            }
            ParsedFrame::Unrouted(kind) => {
                self.metrics
                    .dropped_frames
                    .with_label_values(&["unknown_channel"])
                    .inc();
                trace!(kind = %kind, "Dropping frame for unknown channel kind");
                0
            }
        }
    }

    fn route_item(&self, item: Value) -> usize {
        match ParsedFrame::from_value(item) {
            Ok(frame) => self.route(frame),
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(error = %e, "Dropping undecodable batch item");
                0
            }
        }
    }
}
