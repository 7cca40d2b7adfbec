//! Output session: the pipeline between one producer and one sink.
//!
//! The session owns the buffer pool, the synchronized queue, the clock sync,
//! the format negotiator and the sink. The producer talks to the session
//! directly; the sink pulls through a [`SessionConsumer`].

mod consumer;
mod events;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::buffer::{Buffer, BufferPool, ProducerReturns};
use crate::engine::clock::ClockSync;
use crate::engine::config::{EngineConfig, FormatChangePolicy};
use crate::engine::error::{PipelineError, Result};
use crate::engine::fixed::Fixed32;
use crate::engine::format::{FormatDescriptor, SinkCapabilities, SPDIF_FRAME_SIZE};
use crate::engine::negotiate::{ConversionPlan, FormatNegotiator, PassthroughSwitch, SwitchState};
use crate::engine::output::{OutputHost, OutputManager};
use crate::engine::queue::{Rejected, SynchronizedQueue};
use crate::engine::Timestamp;

use consumer::Shared;
pub use consumer::{NextBuffer, SessionConsumer};
pub use events::{PipelineEvent, PipelineStats, StatsSnapshot};

/// An open input stream. Returned by [`OutputSession::open_input`].
///
/// Buffers submitted on this stream must be in [`sink_format`](Self::sink_format):
/// any conversion the plan calls for happens before submission.
#[derive(Debug)]
pub struct InputHandle {
    id: u64,
    format: FormatDescriptor,
    plan: ConversionPlan,
    sink_format: FormatDescriptor,
}

impl InputHandle {
    /// Format the producer declared.
    pub fn format(&self) -> FormatDescriptor {
        self.format
    }

    pub fn plan(&self) -> ConversionPlan {
        self.plan
    }

    /// Format buffers must carry when submitted.
    pub fn sink_format(&self) -> FormatDescriptor {
        self.sink_format
    }
}

/// What happened to a submitted buffer that was not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Already over at submission; skipped and counted as an underrun.
    DiscardedLate,
    /// The queue was flushed (resync or format change) while the buffer waited
    /// for space. The stream is still open.
    Flushed,
}

#[derive(Debug, Clone, Copy)]
struct ActiveInput {
    id: u64,
    format: FormatDescriptor,
    plan: ConversionPlan,
    sink_format: FormatDescriptor,
}

struct Control {
    output: OutputManager,
    negotiator: FormatNegotiator,
    switch: PassthroughSwitch,
    active: Option<ActiveInput>,
    next_input_id: u64,
}

pub struct OutputSession {
    config: EngineConfig,
    shared: Arc<Shared>,
    control: Mutex<Control>,
    producer_returns: Mutex<Option<ProducerReturns>>,
    events: Receiver<PipelineEvent>,
}

impl OutputSession {
    /// Open a session on a sink from `host`.
    ///
    /// The host gets `reopen_attempts` tries before the session gives up with
    /// `DeviceUnavailable`.
    pub fn open(host: Arc<dyn OutputHost>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let output = OutputManager::open(host, config.reopen_attempts)?;
        let caps = output.capabilities();
        if caps.is_empty() {
            return Err(PipelineError::DeviceUnavailable(
                "sink advertises no formats".into(),
            ));
        }

        let (pool, producer_returns) =
            BufferPool::new(config.max_outstanding_bytes, config.producer_return_capacity);
        let pool = Arc::new(pool);
        let queue = SynchronizedQueue::new(config.max_buffered(), pool.clone());
        let (events_sink, events) = events::EventSink::new(config.event_capacity);
        let shared = Arc::new(Shared::new(
            pool,
            queue,
            ClockSync::new(&config),
            config.silence_timeout(),
            events_sink,
        ));

        info!("Output session open, sink offers {} formats", caps.len());
        for format in caps.iter() {
            debug!("  sink format: {}", format);
        }

        Ok(Self {
            config,
            shared,
            control: Mutex::new(Control {
                output,
                negotiator: FormatNegotiator::new(caps),
                switch: PassthroughSwitch::new(),
                active: None,
                next_input_id: 1,
            }),
            producer_returns: Mutex::new(Some(producer_returns)),
            events,
        })
    }

    /// Stop the sink, flush the queue and release every buffer. Idempotent.
    ///
    /// A producer blocked in [`submit_buffer`](Self::submit_buffer) wakes up
    /// with `StreamClosed`.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut control = self.control.lock();
        self.shared.input_open.store(false, Ordering::Release);
        let flushed = self.shared.queue.close();
        PipelineStats::add(&self.shared.stats.flushed, flushed);
        control.output.shutdown();
        control.switch.close();
        control.active = None;
        info!("Output session closed ({} buffers flushed)", flushed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> SinkCapabilities {
        self.control.lock().negotiator.capabilities().clone()
    }

    /// A zeroed pool buffer of `byte_size` bytes.
    pub fn allocate_buffer(&self, byte_size: usize) -> Result<Buffer> {
        self.ensure_open()?;
        self.shared.pool.allocate(byte_size)
    }

    /// Give a buffer back without submitting it.
    pub fn release_buffer(&self, buffer: Buffer) {
        self.shared.pool.release(buffer);
    }

    /// The producer's end of the path borrowed buffers come back on. Can be
    /// taken once.
    pub fn take_producer_returns(&self) -> Option<ProducerReturns> {
        self.producer_returns.lock().take()
    }

    /// Plan for `format` against the sink, without opening anything.
    pub fn negotiate_format(&self, format: &FormatDescriptor) -> Result<ConversionPlan> {
        self.control.lock().negotiator.negotiate(format)
    }

    /// Open the input stream. Only one may be open at a time.
    pub fn open_input(&self, format: FormatDescriptor) -> Result<InputHandle> {
        self.ensure_open()?;
        let mut control = self.control.lock();
        if control.active.is_some() {
            return Err(PipelineError::InvalidState(
                "an input stream is already open".into(),
            ));
        }

        control.switch.open()?;
        let (plan, sink_format) = match self.resolve(&mut control, &format) {
            Ok(resolved) => resolved,
            Err(e) => {
                control.switch.close();
                return Err(e);
            }
        };

        let id = control.next_input_id;
        control.next_input_id += 1;
        control.active = Some(ActiveInput {
            id,
            format,
            plan,
            sink_format,
        });
        // Drop anything a stale producer slipped in after the last close.
        self.shared.flush();
        self.shared.reset_timeline();
        self.shared.input_open.store(true, Ordering::Release);

        info!("Input opened: {} ({:?}, sink {})", format, plan, sink_format);
        self.shared.emit(PipelineEvent::InputOpened { format, plan });
        Ok(InputHandle {
            id,
            format,
            plan,
            sink_format,
        })
    }

    /// Hand a filled, stamped buffer to the pipeline.
    ///
    /// Blocks while the queue is full. The session owns the buffer from here
    /// on, whatever the outcome. An overlapping or malformed buffer aborts the
    /// stream: the queue is flushed and the input must be reopened.
    pub fn submit_buffer(&self, input: &InputHandle, buffer: Buffer) -> Result<SubmitOutcome> {
        let active = match self.active_input(input.id) {
            Some(active) => active,
            None => {
                self.shared.pool.release(buffer);
                return Err(PipelineError::StreamClosed);
            }
        };
        PipelineStats::bump(&self.shared.stats.submitted);

        let (start, end) = match validate_buffer(&active, &buffer) {
            Ok(interval) => interval,
            Err(e) => {
                self.shared.pool.release(buffer);
                self.abort_stream(input.id, &e);
                return Err(e);
            }
        };

        if let Some(now) = self.shared.stream_now() {
            if end < now {
                PipelineStats::bump(&self.shared.stats.underruns);
                PipelineStats::bump(&self.shared.stats.discarded_late);
                warn!("Late buffer [{}, {}) submitted at {}, discarded", start, end, now);
                self.shared.pool.release(buffer);
                self.shared.emit(PipelineEvent::Underrun { start, end });
                return Ok(SubmitOutcome::DiscardedLate);
            }
        }

        match self.shared.queue.enqueue(buffer) {
            Ok(()) => Ok(SubmitOutcome::Queued),
            Err(Rejected { buffer, error }) => {
                self.shared.pool.release(buffer);
                match error {
                    PipelineError::StreamClosed if self.active_input(input.id).is_some() => {
                        Ok(SubmitOutcome::Flushed)
                    }
                    e @ PipelineError::OverlappingBuffer { .. } => {
                        self.abort_stream(input.id, &e);
                        Err(e)
                    }
                    e => Err(e),
                }
            }
        }
    }

    /// Switch the open stream to `format`.
    ///
    /// Queued buffers are drained or discarded per the configured policy,
    /// then the new format is negotiated. If that fails the stream is closed.
    pub fn change_input_format(
        &self,
        input: &mut InputHandle,
        format: FormatDescriptor,
    ) -> Result<ConversionPlan> {
        self.ensure_open()?;
        let mut control = self.control.lock();
        let previous = match control.active {
            Some(active) if active.id == input.id => active,
            _ => return Err(PipelineError::StreamClosed),
        };

        control.switch.format_changed()?;
        if self.config.format_change_policy == FormatChangePolicy::Drain
            && !self.shared.queue.wait_drained(self.config.drain_timeout())
        {
            debug!("Drain timed out, discarding the rest");
        }
        let flushed = self.shared.flush();
        self.shared.reset_timeline();

        let (plan, sink_format) = match self.resolve(&mut control, &format) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Renegotiation for {} failed: {}", format, e);
                self.deactivate(&mut control);
                return Err(e);
            }
        };

        control.active = Some(ActiveInput {
            sink_format,
            format,
            plan,
            ..previous
        });
        input.format = format;
        input.plan = plan;
        input.sink_format = sink_format;

        info!(
            "Input format changed: {} -> {} ({:?}, {} buffers flushed)",
            previous.format, format, plan, flushed
        );
        self.shared.emit(PipelineEvent::FormatChanged {
            from: previous.format,
            to: format,
            plan,
        });
        Ok(plan)
    }

    /// Wait up to the drain timeout for the consumer to play out everything
    /// queued. Returns false on timeout.
    pub fn drain_input(&self, input: &InputHandle) -> bool {
        if self.active_input(input.id).is_none() {
            return true;
        }
        self.shared.queue.wait_drained(self.config.drain_timeout())
    }

    /// Close the stream, flushing its queued buffers.
    pub fn close_input(&self, input: InputHandle) {
        let mut control = self.control.lock();
        if !matches!(control.active, Some(active) if active.id == input.id) {
            return;
        }
        let flushed = self.deactivate(&mut control);
        debug!("Input closed ({} buffers flushed)", flushed);
        self.shared.emit(PipelineEvent::InputClosed { flushed });
    }

    /// Close whatever input is open from outside the producer. A producer
    /// blocked in submission wakes up with `StreamClosed`.
    pub fn interrupt_input(&self) {
        let mut control = self.control.lock();
        if control.active.is_none() {
            return;
        }
        let flushed = self.deactivate(&mut control);
        debug!("Input interrupted ({} buffers flushed)", flushed);
        self.shared.emit(PipelineEvent::InputClosed { flushed });
    }

    /// Rate multiplier the producer should apply to stay in step with the sink.
    pub fn correction_factor(&self) -> Fixed32 {
        self.shared.timeline.lock().sync.correction_factor()
    }

    pub fn consumer(&self) -> SessionConsumer {
        SessionConsumer::new(self.shared.clone())
    }

    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn switch_state(&self) -> SwitchState {
        self.control.lock().switch.state()
    }

    /// Format the sink currently renders.
    pub fn sink_format(&self) -> Option<FormatDescriptor> {
        self.control.lock().output.running_format()
    }

    /// Pause the sink. Queued buffers stay queued and the hardware clock holds.
    pub fn pause_output(&self) -> Result<()> {
        self.ensure_open()?;
        self.control.lock().output.pause()
    }

    pub fn resume_output(&self) -> Result<()> {
        self.ensure_open()?;
        self.control.lock().output.resume()
    }

    /// Reopen the sink if the device failed.
    pub fn check_output(&self) -> Result<()> {
        self.ensure_open()?;
        let mut control = self.control.lock();
        match control.output.check_connection() {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.shared.reset_timeline();
                self.shared.emit(PipelineEvent::DeviceRecovered);
                Ok(())
            }
            Err(e) => {
                self.shared.emit(PipelineEvent::DeviceLost);
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PipelineError::StreamClosed);
        }
        Ok(())
    }

    fn active_input(&self, id: u64) -> Option<ActiveInput> {
        self.control.lock().active.filter(|active| active.id == id)
    }

    /// Negotiate `format`, settle the switch and make sure the sink renders
    /// the resulting format.
    fn resolve(
        &self,
        control: &mut Control,
        format: &FormatDescriptor,
    ) -> Result<(ConversionPlan, FormatDescriptor)> {
        let plan = control.negotiator.negotiate(format)?;
        let sink_format = control.negotiator.sink_format(format, &plan);
        if control.output.running_format() != Some(sink_format) {
            control.output.start(self.consumer(), sink_format)?;
            self.shared.emit(PipelineEvent::SinkRestarted { format: sink_format });
        }
        control.switch.resolve(plan)?;
        Ok((plan, sink_format))
    }

    fn deactivate(&self, control: &mut Control) -> usize {
        self.shared.input_open.store(false, Ordering::Release);
        let flushed = self.shared.flush();
        self.shared.reset_timeline();
        control.switch.close();
        control.active = None;
        flushed
    }

    fn abort_stream(&self, id: u64, error: &PipelineError) {
        let mut control = self.control.lock();
        if !matches!(control.active, Some(active) if active.id == id) {
            return;
        }
        let flushed = self.deactivate(&mut control);
        PipelineStats::bump(&self.shared.stats.aborted_streams);
        warn!("Stream aborted ({} buffers flushed): {}", flushed, error);
        self.shared.emit(PipelineEvent::StreamAborted {
            reason: error.to_string(),
        });
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Check a buffer against the stream it is submitted on. Returns its interval.
fn validate_buffer(active: &ActiveInput, buffer: &Buffer) -> Result<(Timestamp, Timestamp)> {
    let (start, end) = buffer
        .interval()
        .ok_or_else(|| PipelineError::InvalidFormat("buffer has no presentation time".into()))?;

    let format = active.sink_format;
    if buffer.rate() != Some(format.rate) {
        return Err(PipelineError::InvalidFormat(format!(
            "buffer stamped at {:?}Hz on a {} stream",
            buffer.rate(),
            format
        )));
    }

    if active.plan == ConversionPlan::Passthrough {
        if buffer.byte_size() != SPDIF_FRAME_SIZE {
            return Err(PipelineError::InvalidFormat(format!(
                "passthrough buffers must be {} bytes, got {}",
                SPDIF_FRAME_SIZE,
                buffer.byte_size()
            )));
        }
    } else if let Some(frame_bytes) = format.frame_bytes() {
        let expected = buffer.sample_count() * frame_bytes;
        if buffer.byte_size() != expected {
            return Err(PipelineError::InvalidFormat(format!(
                "{} frames of {} need {} bytes, got {}",
                buffer.sample_count(),
                format,
                expected,
                buffer.byte_size()
            )));
        }
    }
    Ok((start, end))
}
