//! E2E tests for the control path
//!
//! Drives a running engine through its control channel with simulated
//! session, feeding and transport collaborators.

mod common;

use a2dp_media::codec::sbc::SamplingFrequency;
use a2dp_media::engine::io::StreamState;
use a2dp_media::{ControlCommand, EncoderConfig, EngineError, FeedingConfig, MediaTaskState};
use common::{wait_for, Harness};

const CHECK_READY: u8 = ControlCommand::CheckReady as u8;
const START: u8 = ControlCommand::Start as u8;
const STOP: u8 = ControlCommand::Stop as u8;
const SUSPEND: u8 = ControlCommand::Suspend as u8;
const GET_AUDIO_CONFIG: u8 = ControlCommand::GetAudioConfig as u8;
const OFFLOAD_START: u8 = ControlCommand::OffloadStart as u8;

const SUCCESS: u8 = 0;
const FAILURE: u8 = 1;
const INCALL_FAILURE: u8 = 2;
const UNSUPPORTED: u8 = 3;

/// Test STOP while idle acks success twice without side effects
#[test]
fn test_stop_when_idle_is_idempotent() {
    let harness = Harness::new();
    harness.send(STOP);
    harness.send(STOP);
    assert_eq!(harness.acks(2), vec![SUCCESS, SUCCESS]);
    harness.assert_no_ack();

    let snapshot = harness.snapshot();
    assert!(!snapshot.streaming);
    assert_eq!(snapshot.tx_queue_len, 0);
    assert_eq!(harness.session.state(), StreamState::Ready);
}

/// Test a full start, stream, stop cycle
#[test]
fn test_start_streams_until_stopped() {
    let mut harness = Harness::new();
    harness.writer.write(&vec![0u8; 44_100 * 4]);

    harness.send(START);
    assert_eq!(harness.ack(), SUCCESS);
    assert_eq!(harness.session.state(), StreamState::Started);
    assert!(
        wait_for(|| harness.counters.packets() > 0),
        "No packets reached the transport"
    );
    assert!(harness.snapshot().streaming);

    harness.send(STOP);
    assert_eq!(harness.ack(), SUCCESS);
    let snapshot = harness.snapshot();
    assert!(!snapshot.streaming);
    assert_eq!(harness.session.state(), StreamState::Ready);
    assert!(snapshot.stats.tx_frames > 0);

    harness.send(STOP);
    assert_eq!(harness.ack(), SUCCESS);
    harness.assert_no_ack();
}

/// Test that SUSPEND completes through the session and stops TX
#[test]
fn test_suspend_stops_tx() {
    let harness = Harness::new();
    harness.send(START);
    assert_eq!(harness.ack(), SUCCESS);

    harness.send(SUSPEND);
    assert_eq!(harness.ack(), SUCCESS);
    assert!(!harness.snapshot().streaming);
}

/// Test CHECK_READY follows the session's stream state
#[test]
fn test_check_ready_follows_session() {
    let harness = Harness::new();
    harness.send(CHECK_READY);
    assert_eq!(harness.ack(), SUCCESS);

    harness.session.set_state(StreamState::Idle);
    harness.send(CHECK_READY);
    assert_eq!(harness.ack(), FAILURE);
}

/// Test START is refused while a call holds the audio path
#[test]
fn test_start_refused_during_call() {
    let harness = Harness::new();
    harness.session.set_call_active(true);
    harness.send(START);
    assert_eq!(harness.ack(), INCALL_FAILURE);
    assert!(!harness.snapshot().streaming);
}

/// Test START is refused when the stream is not openable
#[test]
fn test_start_refused_when_idle() {
    let harness = Harness::new();
    harness.session.set_state(StreamState::Idle);
    harness.send(START);
    assert_eq!(harness.ack(), FAILURE);
}

/// Test unknown command bytes get a failure ack
#[test]
fn test_unknown_command_acks_failure() {
    let harness = Harness::new();
    harness.send(0x7F);
    assert_eq!(harness.ack(), FAILURE);
    harness.send(CHECK_READY);
    assert_eq!(harness.ack(), SUCCESS);
}

/// Test a superseded command still gets exactly one ack
#[test]
fn test_superseded_command_acked_once() {
    let harness = Harness::new();
    harness.session.set_stalled(true);
    harness.send(START);
    harness.assert_no_ack();

    harness.send(STOP);
    // FAILURE for the superseded START, then SUCCESS for STOP
    assert_eq!(harness.acks(2), vec![FAILURE, SUCCESS]);
    harness.assert_no_ack();
}

/// Test GET_AUDIO_CONFIG reports the encoder's rate and channels
#[test]
fn test_get_audio_config() {
    let harness = Harness::new();
    harness.send(GET_AUDIO_CONFIG);
    let mut expected = vec![SUCCESS];
    expected.extend_from_slice(&44_100u32.to_le_bytes());
    expected.push(2);
    assert_eq!(harness.acks(expected.len()), expected);
}

/// Test offload requests the simulation cannot serve
#[test]
fn test_offload_unsupported() {
    let harness = Harness::new();
    harness.send(OFFLOAD_START);
    assert_eq!(harness.ack(), UNSUPPORTED);
}

/// Test configuration adapts the encoder to a low-rate mono feed
#[test]
fn test_configure_adapts_to_feeding() {
    let harness = Harness::new();
    let feeding = FeedingConfig {
        sample_rate: 16_000,
        channels: 1,
        ..FeedingConfig::default()
    };
    let encoder = harness
        .handle
        .configure(EncoderConfig::default(), feeding)
        .unwrap();
    assert_eq!(encoder.sampling_frequency, SamplingFrequency::Hz48000);
    assert!((2..=53).contains(&encoder.bitpool));

    harness.send(GET_AUDIO_CONFIG);
    let mut expected = vec![SUCCESS];
    expected.extend_from_slice(&48_000u32.to_le_bytes());
    expected.push(2);
    assert_eq!(harness.acks(expected.len()), expected);
    assert_eq!(harness.snapshot().feeding, feeding);
}

/// Test rejected configurations keep the last good one
#[test]
fn test_rejected_configuration_keeps_previous() {
    let harness = Harness::new();
    let before = harness.snapshot().encoder;

    let bad_range = EncoderConfig {
        min_bitpool: 40,
        max_bitpool: 20,
        ..EncoderConfig::default()
    };
    let result = harness.handle.configure(bad_range, FeedingConfig::default());
    assert!(matches!(result, Err(EngineError::Negotiation(_))));

    let bad_feed = FeedingConfig {
        channels: 3,
        ..FeedingConfig::default()
    };
    let result = harness.handle.configure(EncoderConfig::default(), bad_feed);
    assert!(matches!(result, Err(EngineError::Config(_))));

    assert_eq!(harness.snapshot().encoder, before);
}

/// Test the engine refuses work while stopped and restarts cleanly
#[test]
fn test_stop_and_restart() {
    let mut harness = Harness::new();
    assert_eq!(harness.engine.task_state(), MediaTaskState::On);

    harness.engine.stop().unwrap();
    assert_eq!(harness.engine.task_state(), MediaTaskState::Off);
    assert!(matches!(
        harness.handle.stats_snapshot(),
        Err(EngineError::NotRunning)
    ));
    assert!(matches!(
        harness
            .handle
            .configure(EncoderConfig::default(), FeedingConfig::default()),
        Err(EngineError::NotRunning)
    ));
    // Stopping twice is a no-op
    harness.engine.stop().unwrap();

    harness.engine.start().unwrap();
    assert!(matches!(
        harness.engine.start(),
        Err(EngineError::AlreadyRunning)
    ));
    let snapshot = harness.snapshot();
    assert_eq!(snapshot.task_state, MediaTaskState::On);
    assert!(!snapshot.streaming);
}
