use std::sync::Arc;

use tracing::{error, info, warn};

use crate::engine::error::{PipelineError, Result};
use crate::engine::format::{FormatDescriptor, SinkCapabilities};
use crate::engine::output::{AudioOutput, OutputHost};
use crate::engine::session::SessionConsumer;

/// Owns the sink of a session and reopens it when the device goes away.
pub struct OutputManager {
    host: Arc<dyn OutputHost>,
    backend: Option<Box<dyn AudioOutput>>,
    reopen_attempts: u32,
    /// Consumer and format the sink is rendering, kept for restarts.
    running: Option<(SessionConsumer, FormatDescriptor)>,
}

impl OutputManager {
    /// Open a sink, trying at most `reopen_attempts` times.
    pub fn open(host: Arc<dyn OutputHost>, reopen_attempts: u32) -> Result<Self> {
        let mut manager = Self {
            host,
            backend: None,
            reopen_attempts: reopen_attempts.max(1),
            running: None,
        };
        manager.try_reconnect()?;
        Ok(manager)
    }

    fn try_reconnect(&mut self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.reopen_attempts {
            match self.host.open_output() {
                Ok(backend) => {
                    info!("Opened audio output '{}' (attempt {})", backend.name(), attempt);
                    self.backend = Some(backend);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Failed to open audio output (attempt {}/{}): {}",
                        attempt, self.reopen_attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        error!("Audio output unavailable: {}", reason);
        Err(PipelineError::DeviceUnavailable(reason))
    }

    pub fn capabilities(&self) -> SinkCapabilities {
        self.backend
            .as_ref()
            .map(|backend| backend.capabilities())
            .unwrap_or_default()
    }

    /// Format the sink is currently rendering.
    pub fn running_format(&self) -> Option<FormatDescriptor> {
        self.running.as_ref().map(|(_, format)| *format)
    }

    /// (Re)start the sink in `format`.
    pub fn start(&mut self, consumer: SessionConsumer, format: FormatDescriptor) -> Result<()> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| PipelineError::DeviceUnavailable("no audio backend".into()))?;
        backend.stop();
        backend.start(consumer.clone(), format)?;
        self.running = Some((consumer, format));
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        match &mut self.backend {
            Some(backend) => backend.pause(),
            None => Ok(()),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match &mut self.backend {
            Some(backend) => backend.resume(),
            None => Err(PipelineError::DeviceUnavailable("no audio backend".into())),
        }
    }

    /// Stop rendering; the device stays open.
    pub fn stop(&mut self) {
        if let Some(backend) = &mut self.backend {
            backend.stop();
        }
        self.running = None;
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            Some(backend) => backend.is_healthy(),
            None => false,
        }
    }

    /// Reopen the sink if it failed, resuming whatever it was rendering.
    ///
    /// Returns `Ok(true)` when a reconnect happened.
    pub fn check_connection(&mut self) -> Result<bool> {
        if self.is_healthy() {
            return Ok(false);
        }

        warn!("Audio output unhealthy, reconnecting");
        if let Some(mut backend) = self.backend.take() {
            backend.stop();
        }
        self.try_reconnect()?;

        if let Some((consumer, format)) = self.running.clone() {
            if let Err(e) = self.start(consumer, format) {
                error!("Reopened audio output rejected {}: {}", format, e);
                // Next check reconnects and retries with the same stream.
                self.backend = None;
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Stop and close the device. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop();
        self.backend = None;
    }
}
