// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of serialized payloads.
//!
//! The network transport lives outside this crate; the demultiplexer only
//! needs something it can start, stop, and hand payloads to. Two forwarders
//! are provided: [`CaptureForwarder`] keeps payloads in memory and
//! [`WriterForwarder`] writes them to any [`std::io::Write`] sink.

use crate::errors::DeliveryError;
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

/// A serialized payload addressed to an intake endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub endpoint: &'static str,
    pub body: Vec<u8>,
}

impl Payload {
    /// The body as text, replacing invalid UTF-8.
    #[must_use]
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    fn start(&self) -> Result<(), DeliveryError>;

    fn stop(&self);

    async fn submit(&self, payload: Payload) -> Result<(), DeliveryError>;
}

/// Records every payload it receives. Can be told to fail submissions.
#[derive(Debug, Default)]
pub struct CaptureForwarder {
    running: AtomicBool,
    failing: AtomicBool,
    fail_remaining: AtomicUsize,
    payloads: Mutex<Vec<Payload>>,
}

impl CaptureForwarder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent submissions fail with a destination error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Makes only the next `count` submissions fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::Release);
    }

    fn take_failure(&self) -> bool {
        self.failing.load(Ordering::Acquire)
            || self
                .fail_remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn payloads(&self) -> Vec<Payload> {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn payloads_for(&self, endpoint: &str) -> Vec<Payload> {
        self.payloads()
            .into_iter()
            .filter(|p| p.endpoint == endpoint)
            .collect()
    }
}

#[async_trait]
impl Forwarder for CaptureForwarder {
    fn start(&self) -> Result<(), DeliveryError> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    async fn submit(&self, payload: Payload) -> Result<(), DeliveryError> {
        if !self.is_running() {
            return Err(DeliveryError::Stopped);
        }
        if self.take_failure() {
            return Err(DeliveryError::Destination {
                endpoint: payload.endpoint.to_string(),
                reason: "submission rejected".to_string(),
            });
        }
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);
        Ok(())
    }
}

/// Writes each payload as `<endpoint> <body>` on its own line.
pub struct WriterForwarder<W> {
    running: AtomicBool,
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterForwarder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            running: AtomicBool::new(false),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> Forwarder for WriterForwarder<W> {
    fn start(&self) -> Result<(), DeliveryError> {
        self.running.store(true, Ordering::Release);
        debug!("Writer forwarder started");
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.flush() {
            error!("Failed to flush writer forwarder on stop: {e}");
        }
        debug!("Writer forwarder stopped");
    }

    async fn submit(&self, payload: Payload) -> Result<(), DeliveryError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(DeliveryError::Stopped);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut line = Vec::with_capacity(payload.endpoint.len() + payload.body.len() + 2);
        line.extend_from_slice(payload.endpoint.as_bytes());
        line.push(b' ');
        line.extend_from_slice(&payload.body);
        line.push(b'\n');
        writer
            .write_all(&line)
            .map_err(|e| DeliveryError::Destination {
                endpoint: payload.endpoint.to_string(),
                reason: e.to_string(),
            })
    }
}
