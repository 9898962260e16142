//! Span helpers for scheduler runs and queue items.

use tracing::Span;
use uuid::Uuid;

use crate::model::{ItemId, Status};

/// Span covering one scheduler invocation.
pub fn start_run_span(run_id: &Uuid) -> Span {
    tracing::info_span!("queue.run", "run.id" = %run_id)
}

/// Span covering one pick of one item.
///
/// `item.outcome` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_item_span(id: ItemId, topic: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "queue.item",
        "item.id" = %id,
        "item.topic" = topic,
        "item.attempt" = attempt,
        "item.outcome" = tracing::field::Empty,
    )
}

/// Record a status transition on the given span.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("item.outcome", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
