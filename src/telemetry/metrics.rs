//! Metric instrument factories for researchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("researchq")
}

/// Counter: queue items inserted.
/// Labels: `result` ("created" | "existing" | "synced").
pub fn items_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("researchq.items.enqueued")
        .with_description("Number of queue items inserted")
        .build()
}

/// Counter: items picked for execution.
/// Labels: `model`.
pub fn items_picked() -> Counter<u64> {
    meter()
        .u64_counter("researchq.items.picked")
        .with_description("Number of queue items picked for execution")
        .build()
}

/// Counter: queue item status transitions.
/// Labels: `from`, `to`.
pub fn item_transitions() -> Counter<u64> {
    meter()
        .u64_counter("researchq.items.transitions")
        .with_description("Number of queue item status transitions")
        .build()
}

/// Counter: validation outcomes.
/// Labels: `result` ("valid" | "invalid").
pub fn validation_results() -> Counter<u64> {
    meter()
        .u64_counter("researchq.validation.results")
        .with_description("Number of artifact validations")
        .build()
}

/// Counter: lease acquisition attempts.
/// Labels: `result` ("acquired" | "taken_over" | "held").
pub fn lease_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("researchq.lease.acquisitions")
        .with_description("Number of lease acquisition attempts")
        .build()
}

/// Counter: origin records promoted into the queue by sync.
pub fn sync_promoted() -> Counter<u64> {
    meter()
        .u64_counter("researchq.sync.promoted")
        .with_description("Number of origin records promoted by sync")
        .build()
}

/// Histogram: external task duration in milliseconds.
/// Labels: `outcome` ("success" | "failure" | "timeout").
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("researchq.task.duration_ms")
        .with_description("External task duration in milliseconds")
        .with_unit("ms")
        .build()
}
