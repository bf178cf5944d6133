// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors returned by the demultiplexer's public surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sample pool is exhausted and configured not to block.
    #[error("Sample pool exhausted: {in_flight} of {capacity} batches in flight")]
    Overflow { in_flight: usize, capacity: usize },

    #[error("Sample pool is closed")]
    PoolClosed,

    #[error("Aggregation worker is stopped")]
    WorkerStopped,

    #[error("Flush was accepted but never completed: {0}")]
    FlushAborted(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Failures reported by the serializer or forwarder. Never fatal to a flush.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to prepare payload: {0}")]
    Payload(String),

    #[error("Failed to deliver payload to {endpoint}: {reason}")]
    Destination { endpoint: String, reason: String },

    #[error("Forwarder is not running")]
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("parse failure: {0}")]
    Raw(String),

    #[error("unsupported metric type: {0}")]
    UnsupportedType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::InvalidConfig("bucket width must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: bucket width must be positive"
        );

        let error = Error::Overflow {
            in_flight: 4,
            capacity: 4,
        };
        assert_eq!(
            error.to_string(),
            "Sample pool exhausted: 4 of 4 batches in flight"
        );
    }

    #[test]
    fn test_delivery_error_converts() {
        let error: Error = DeliveryError::Stopped.into();
        assert!(matches!(error, Error::Delivery(DeliveryError::Stopped)));
        assert_eq!(error.to_string(), "Delivery failed: Forwarder is not running");
    }
}
