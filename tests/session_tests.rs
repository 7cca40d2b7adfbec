mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use audio_output_engine::engine::format::{SPDIF_FRAME_SAMPLES, SPDIF_FRAME_SIZE};
use audio_output_engine::engine::{
    AllocationKind, Buffer, Channels, ConversionPlan, Encoding, EngineConfig, FormatChangePolicy,
    FormatDescriptor, NextBuffer, OutputSession, PipelineError, PipelineEvent, SubmitOutcome,
    SwitchState,
};

use common::*;

fn expect_buffer(next: NextBuffer) -> Buffer {
    match next {
        NextBuffer::Buffer(buffer) => buffer,
        NextBuffer::Silence { until } => panic!("expected a buffer, got silence until {until:?}"),
    }
}

#[test]
fn test_identity_stream_plays_in_timestamp_order() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());

    let input = session.open_input(s16_48k()).unwrap();
    assert_eq!(input.plan(), ConversionPlan::Identity);
    assert_eq!(host.running_format(), Some(s16_48k()));
    assert_eq!(session.switch_state(), SwitchState::Converting);

    // Submitted out of order, released in order.
    submit_10ms(&session, &input, 10);
    submit_10ms(&session, &input, 0);

    let consumer = host.consumer();
    let first = expect_buffer(consumer.next_due_buffer(1_000_000));
    assert_eq!(first.start_time(), Some(0));
    consumer.release(first);

    match consumer.next_due_buffer(1_005_000) {
        NextBuffer::Silence { until } => assert_eq!(until, Some(1_010_000)),
        NextBuffer::Buffer(b) => panic!("buffer released early: {b:?}"),
    }

    let second = expect_buffer(consumer.next_due_buffer(1_010_000));
    assert_eq!(second.start_time(), Some(10_000));
    consumer.release(second);

    let stats = session.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.played, 2);
    assert_eq!(stats.underruns, 0);
    assert_eq!(session.correction_factor(), audio_output_engine::engine::fixed::FIXED32_ONE);
}

#[test]
fn test_consumer_skips_expired_buffer_as_underrun() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let input = session.open_input(s16_48k()).unwrap();

    submit_10ms(&session, &input, 0);
    submit_10ms(&session, &input, 10);
    submit_10ms(&session, &input, 30);

    let consumer = host.consumer();
    consumer.release(expect_buffer(consumer.next_due_buffer(0)));

    // [10, 20) ms is over by 25 ms; nothing else is due yet.
    match consumer.next_due_buffer(25_000) {
        NextBuffer::Silence { until } => assert_eq!(until, Some(30_000)),
        NextBuffer::Buffer(b) => panic!("expired buffer released: {b:?}"),
    }

    let stats = session.stats();
    assert_eq!(stats.underruns, 1);
    assert_eq!(stats.discarded_late, 0);
    assert!(drain_events(&session).contains(&PipelineEvent::Underrun {
        start: 10_000,
        end: 20_000
    }));
}

#[test]
fn test_buffer_already_over_at_submission_is_discarded() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let input = session.open_input(s16_48k()).unwrap();
    let consumer = host.consumer();

    submit_10ms(&session, &input, 0);
    consumer.release(expect_buffer(consumer.next_due_buffer(0)));
    assert!(matches!(
        consumer.next_due_buffer(50_000),
        NextBuffer::Silence { until: None }
    ));

    let late = pcm_buffer(&session, 10_000, FRAMES_10MS);
    assert_eq!(
        session.submit_buffer(&input, late).unwrap(),
        SubmitOutcome::DiscardedLate
    );
    let stats = session.stats();
    assert_eq!(stats.discarded_late, 1);
    assert_eq!(stats.underruns, 1);

    // Still on time.
    submit_10ms(&session, &input, 60);
}

#[test]
fn test_overlapping_buffer_aborts_the_stream() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let input = session.open_input(s16_48k()).unwrap();

    submit_10ms(&session, &input, 0);
    let overlapping = pcm_buffer(&session, 5_000, FRAMES_10MS);
    assert!(matches!(
        session.submit_buffer(&input, overlapping),
        Err(PipelineError::OverlappingBuffer {
            start: 5_000,
            end: 15_000
        })
    ));

    assert_eq!(session.switch_state(), SwitchState::Idle);
    assert_eq!(session.stats().aborted_streams, 1);
    assert!(drain_events(&session)
        .iter()
        .any(|e| matches!(e, PipelineEvent::StreamAborted { .. })));

    let after = pcm_buffer(&session, 20_000, FRAMES_10MS);
    assert!(matches!(
        session.submit_buffer(&input, after),
        Err(PipelineError::StreamClosed)
    ));

    // The queue was flushed with the stream; a new one starts clean.
    let input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);
}

#[test]
fn test_buffer_size_must_match_sample_count() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let input = session.open_input(s16_48k()).unwrap();

    let mut short = session.allocate_buffer(1000).unwrap();
    short.stamp(0, FRAMES_10MS, 48_000);
    assert!(matches!(
        session.submit_buffer(&input, short),
        Err(PipelineError::InvalidFormat(_))
    ));
    assert_eq!(session.switch_state(), SwitchState::Idle);
}

#[test]
fn test_buffer_rate_must_match_sink() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());

    let source = FormatDescriptor::with_count(Encoding::Float32, 96_000, 2).unwrap();
    let input = session.open_input(source).unwrap();
    assert_eq!(input.plan(), ConversionPlan::Resample(s16_48k()));
    assert_eq!(input.sink_format(), s16_48k());

    let mut unconverted = session.allocate_buffer(FRAMES_10MS * 4).unwrap();
    unconverted.stamp(0, FRAMES_10MS, 96_000);
    assert!(matches!(
        session.submit_buffer(&input, unconverted),
        Err(PipelineError::InvalidFormat(_))
    ));
}

#[test]
fn test_passthrough_accepts_only_whole_spdif_frames() {
    let host = FakeHost::new(spdif_caps());
    let session = open_session(&host, EngineConfig::default());

    let ac3_6ch = FormatDescriptor::new(Encoding::Ac3, 48_000, Channels::Count(6)).unwrap();
    let input = session.open_input(ac3_6ch).unwrap();
    assert_eq!(input.plan(), ConversionPlan::Passthrough);
    assert_eq!(session.switch_state(), SwitchState::Passthrough);
    assert_eq!(host.running_format(), Some(ac3_6ch));

    let payload: Vec<u8> = (0..SPDIF_FRAME_SIZE).map(|i| (i * 7 % 251) as u8).collect();
    let mut frame = session.allocate_buffer(SPDIF_FRAME_SIZE).unwrap();
    frame.data_mut().copy_from_slice(&payload);
    frame.stamp(0, SPDIF_FRAME_SAMPLES, 48_000);
    assert_eq!(session.submit_buffer(&input, frame).unwrap(), SubmitOutcome::Queued);

    let consumer = host.consumer();
    let played = expect_buffer(consumer.next_due_buffer(0));
    assert_eq!(played.start_time(), Some(0));
    assert_eq!(played.data(), &payload[..]);
    consumer.release(played);

    let mut partial = session.allocate_buffer(4096).unwrap();
    partial.stamp(32_000, 1024, 48_000);
    assert!(matches!(
        session.submit_buffer(&input, partial),
        Err(PipelineError::InvalidFormat(_))
    ));
}

#[test]
fn test_unsupported_bitstream_leaves_session_usable() {
    let host = FakeHost::new(spdif_caps());
    let session = open_session(&host, EngineConfig::default());

    let dts = FormatDescriptor::with_count(Encoding::Dts, 48_000, 6).unwrap();
    assert!(matches!(
        session.open_input(dts),
        Err(PipelineError::UnsupportedFormat(_))
    ));
    assert_eq!(session.switch_state(), SwitchState::Idle);

    let input = session.open_input(s16_48k()).unwrap();
    assert_eq!(input.plan(), ConversionPlan::Identity);
}

#[test]
fn test_only_one_input_at_a_time() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());

    let input = session.open_input(s16_48k()).unwrap();
    assert!(matches!(
        session.open_input(f32_44k()),
        Err(PipelineError::InvalidState(_))
    ));

    session.close_input(input);
    assert_eq!(session.switch_state(), SwitchState::Idle);
    assert!(session.open_input(f32_44k()).is_ok());
}

#[test]
fn test_format_change_discards_queue_and_restarts_sink() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let mut input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);
    submit_10ms(&session, &input, 10);

    let plan = session.change_input_format(&mut input, f32_44k()).unwrap();
    assert_eq!(plan, ConversionPlan::Identity);
    assert_eq!(input.sink_format(), f32_44k());
    assert_eq!(host.running_format(), Some(f32_44k()));
    assert_eq!(session.stats().flushed, 2);

    let events = drain_events(&session);
    assert!(events.contains(&PipelineEvent::FormatChanged {
        from: s16_48k(),
        to: f32_44k(),
        plan: ConversionPlan::Identity,
    }));
    assert!(events.contains(&PipelineEvent::SinkRestarted { format: f32_44k() }));
}

#[test]
fn test_format_change_drains_when_configured() {
    let config = EngineConfig {
        format_change_policy: FormatChangePolicy::Drain,
        drain_timeout_ms: 2000,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, config);
    let mut input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);
    submit_10ms(&session, &input, 10);

    let consumer = host.consumer();
    let sink = thread::spawn(move || {
        for step in 0..200 {
            if let NextBuffer::Buffer(buffer) = consumer.next_due_buffer(step * 5_000) {
                consumer.release(buffer);
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    session.change_input_format(&mut input, f32_44k()).unwrap();
    sink.join().unwrap();
    let stats = session.stats();
    assert_eq!(stats.played, 2);
    assert_eq!(stats.flushed, 0);
}

#[test]
fn test_full_queue_blocks_until_consumer_pulls() {
    let config = EngineConfig {
        max_buffered_ms: 20,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = Arc::new(open_session(&host, config));
    let input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);
    submit_10ms(&session, &input, 10);

    let producer = {
        let session = session.clone();
        thread::spawn(move || {
            let buffer = pcm_buffer(&session, 20_000, FRAMES_10MS);
            session.submit_buffer(&input, buffer)
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!producer.is_finished());

    let consumer = host.consumer();
    consumer.release(expect_buffer(consumer.next_due_buffer(0)));
    assert_eq!(producer.join().unwrap().unwrap(), SubmitOutcome::Queued);
}

#[test]
fn test_hard_resync_flushes_and_wakes_blocked_producer() {
    let config = EngineConfig {
        max_buffered_ms: 20,
        max_drift_ms: 50,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = Arc::new(open_session(&host, config));
    let input = session.open_input(s16_48k()).unwrap();
    let consumer = host.consumer();

    submit_10ms(&session, &input, 0);
    submit_10ms(&session, &input, 10);
    consumer.release(expect_buffer(consumer.next_due_buffer(0)));
    submit_10ms(&session, &input, 20);

    // 20 ms does not fit next to the 20 ms already queued.
    let producer = {
        let session = session.clone();
        thread::spawn(move || {
            let buffer = pcm_buffer(&session, 30_000, 2 * FRAMES_10MS);
            session.submit_buffer(&input, buffer)
        })
    };
    thread::sleep(Duration::from_millis(100));

    // The sink jumped 100 ms ahead: far beyond the drift limit.
    assert!(matches!(
        consumer.next_due_buffer(100_000),
        NextBuffer::Silence { until: None }
    ));
    assert_eq!(producer.join().unwrap().unwrap(), SubmitOutcome::Flushed);

    let stats = session.stats();
    assert_eq!(stats.resyncs, 1);
    assert_eq!(stats.underruns, 1);
    assert!(drain_events(&session)
        .iter()
        .any(|e| matches!(e, PipelineEvent::HardResync { drift: -90_000, flushed: 1 })));
}

#[test]
fn test_resync_on_due_buffer_counts_it_as_flushed() {
    let config = EngineConfig {
        max_buffered_ms: 2_000,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, config);
    let input = session.open_input(s16_48k()).unwrap();
    let consumer = host.consumer();

    submit_10ms(&session, &input, 0);
    let long = pcm_buffer(&session, 10_000, 48_000);
    assert_eq!(session.submit_buffer(&input, long).unwrap(), SubmitOutcome::Queued);
    consumer.release(expect_buffer(consumer.next_due_buffer(0)));

    // Still inside the one second buffer, but 590 ms behind it.
    assert!(matches!(
        consumer.next_due_buffer(600_000),
        NextBuffer::Silence { until: None }
    ));

    let stats = session.stats();
    assert_eq!(stats.resyncs, 1);
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.played + stats.underruns + stats.flushed, stats.submitted);
    assert!(drain_events(&session)
        .iter()
        .any(|e| matches!(e, PipelineEvent::HardResync { drift: -590_000, flushed: 1 })));
}

#[test]
fn test_close_wakes_blocked_producer_and_is_idempotent() {
    let config = EngineConfig {
        max_buffered_ms: 10,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = Arc::new(open_session(&host, config));
    let input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);

    let producer = {
        let session = session.clone();
        thread::spawn(move || {
            let buffer = pcm_buffer(&session, 10_000, FRAMES_10MS);
            session.submit_buffer(&input, buffer)
        })
    };
    thread::sleep(Duration::from_millis(100));

    session.close();
    assert!(matches!(
        producer.join().unwrap(),
        Err(PipelineError::StreamClosed)
    ));
    assert_eq!(host.running_format(), None);

    session.close();
    assert!(session.is_closed());
    assert!(matches!(
        session.open_input(s16_48k()),
        Err(PipelineError::StreamClosed)
    ));
    assert!(matches!(
        session.allocate_buffer(16),
        Err(PipelineError::StreamClosed)
    ));
}

#[test]
fn test_interrupt_input_wakes_blocked_producer() {
    let config = EngineConfig {
        max_buffered_ms: 10,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = Arc::new(open_session(&host, config));
    let input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);

    let producer = {
        let session = session.clone();
        thread::spawn(move || {
            let buffer = pcm_buffer(&session, 10_000, FRAMES_10MS);
            session.submit_buffer(&input, buffer)
        })
    };
    thread::sleep(Duration::from_millis(100));

    session.interrupt_input();
    assert!(matches!(
        producer.join().unwrap(),
        Err(PipelineError::StreamClosed)
    ));
    assert!(!session.is_closed());
    assert!(session.open_input(s16_48k()).is_ok());
}

#[test]
fn test_device_unavailable_after_reopen_attempts() {
    let config = EngineConfig {
        reopen_attempts: 3,
        ..EngineConfig::default()
    };
    let host = FakeHost::failing(pcm_caps(), 5);
    assert!(matches!(
        OutputSession::open(host.clone(), config.clone()),
        Err(PipelineError::DeviceUnavailable(_))
    ));
    assert_eq!(host.opens(), 3);

    let host = FakeHost::failing(pcm_caps(), 2);
    assert!(OutputSession::open(host.clone(), config).is_ok());
    assert_eq!(host.opens(), 3);
}

#[test]
fn test_sink_without_formats_is_unavailable() {
    let host = FakeHost::new(Default::default());
    assert!(matches!(
        OutputSession::open(host, EngineConfig::default()),
        Err(PipelineError::DeviceUnavailable(_))
    ));
}

#[test]
fn test_lost_device_is_reopened_and_resumed() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let _input = session.open_input(s16_48k()).unwrap();
    drain_events(&session);

    host.set_healthy(false);
    session.check_output().unwrap();
    assert_eq!(host.running_format(), Some(s16_48k()));
    assert!(drain_events(&session).contains(&PipelineEvent::DeviceRecovered));

    host.set_healthy(false);
    host.fail_next(10);
    assert!(matches!(
        session.check_output(),
        Err(PipelineError::DeviceUnavailable(_))
    ));
    assert!(drain_events(&session).contains(&PipelineEvent::DeviceLost));
}

#[test]
fn test_failed_restart_is_retried_on_next_check() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let _input = session.open_input(s16_48k()).unwrap();
    drain_events(&session);

    // The device comes back but refuses the stream once.
    host.set_healthy(false);
    host.fail_next_start(1);
    assert!(matches!(
        session.check_output(),
        Err(PipelineError::DeviceUnavailable(_))
    ));
    assert_eq!(host.running_format(), None);
    assert!(drain_events(&session).contains(&PipelineEvent::DeviceLost));

    session.check_output().unwrap();
    assert_eq!(host.running_format(), Some(s16_48k()));
    assert!(drain_events(&session).contains(&PipelineEvent::DeviceRecovered));
}

#[test]
fn test_borrowed_buffers_go_back_to_the_producer() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let mut returns = session.take_producer_returns().unwrap();
    assert!(session.take_producer_returns().is_none());

    let input = session.open_input(s16_48k()).unwrap();
    let mut buffer = Buffer::borrowed(vec![7u8; FRAMES_10MS * 4]);
    buffer.stamp(0, FRAMES_10MS, 48_000);
    session.submit_buffer(&input, buffer).unwrap();

    let consumer = host.consumer();
    consumer.release(expect_buffer(consumer.next_due_buffer(0)));

    let returned = returns.try_recv().unwrap();
    assert_eq!(returned.allocation_kind(), AllocationKind::BorrowedFromProducer);
    assert!(returned.data().iter().all(|&b| b == 7));
}

#[test]
fn test_overflowing_events_are_counted() {
    let config = EngineConfig {
        event_capacity: 1,
        ..EngineConfig::default()
    };
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, config);

    // SinkRestarted fills the channel; InputOpened overflows it.
    let _input = session.open_input(s16_48k()).unwrap();
    assert_eq!(session.stats().events_dropped, 1);
    assert_eq!(
        drain_events(&session),
        vec![PipelineEvent::SinkRestarted { format: s16_48k() }]
    );
}

#[test]
fn test_pause_and_resume_reach_the_sink() {
    let host = FakeHost::new(pcm_caps());
    let session = open_session(&host, EngineConfig::default());
    let input = session.open_input(s16_48k()).unwrap();
    submit_10ms(&session, &input, 0);

    session.pause_output().unwrap();
    assert!(host.is_paused());
    session.resume_output().unwrap();
    assert!(!host.is_paused());

    session.close();
    assert!(matches!(
        session.pause_output(),
        Err(PipelineError::StreamClosed)
    ));
}
