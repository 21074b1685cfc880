//! End-to-end session scenarios against mock devices and a mock remote

use std::sync::Arc;
use std::time::{Duration, Instant};

use duplex_voice::audio::{MockInput, MockInputControl, MockOutput, MockOutputControl};
use duplex_voice::remote::{MockConnector, MockRemote};
use duplex_voice::{
    ConnectionError, DeviceError, EngineConfig, EngineError, InterruptionSignal, SessionHandle,
    SessionState,
};

const FRAME: usize = 256;
const WAIT: Duration = Duration::from_secs(5);

/// Chunk size and count of the scripted reply: 200 x 20ms = 4s of audio
const REPLY_CHUNK: usize = 480;
const REPLY_CHUNKS: usize = 200;
const REPLY_VALUE: i16 = 500;

struct Harness {
    session: SessionHandle,
    mic: MockInputControl,
    speaker: MockOutputControl,
    remote: MockRemote,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.turn.silence_duration_ms = 100;
    config.retry.base_delay_ms = 10;
    config
}

fn start(config: EngineConfig) -> Harness {
    let (input, mic) = MockInput::new(config.audio.input_sample_rate);
    let (output, speaker) = MockOutput::new(config.audio.output_sample_rate);
    let (connector, remote) = MockConnector::new();

    let mut session = SessionHandle::new(config).unwrap();
    session.start(input, output, Arc::new(connector)).unwrap();

    Harness {
        session,
        mic,
        speaker,
        remote,
    }
}

async fn wait_for_state(session: &SessionHandle, state: SessionState) {
    let mut rx = session.subscribe();
    // Match in place so the watch guard is released immediately
    let reached = matches!(
        tokio::time::timeout(WAIT, rx.wait_for(|snapshot| snapshot.state == state)).await,
        Ok(Ok(_))
    );
    assert!(
        reached,
        "timed out waiting for {}, still {}",
        state,
        session.current_state()
    );
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One short utterance followed by silence, which commits the turn
fn speak(mic: &MockInputControl, frames: usize) {
    mic.push_constant(3000, FRAME * frames);
}

/// Drive the session into `BotSpeaking` with a long scripted reply
async fn bot_speaking(h: &Harness) {
    h.remote
        .respond_on_commit(vec![vec![REPLY_VALUE; REPLY_CHUNK]; REPLY_CHUNKS], 24000);
    wait_for_state(&h.session, SessionState::Listening).await;
    speak(&h.mic, 10);
    wait_for_state(&h.session, SessionState::BotSpeaking).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_preserves_order_and_payload() {
    let config = test_config();
    let (input, mic) = MockInput::new(16000);
    let (output, _speaker) = MockOutput::new(24000);
    let (connector, remote) = MockConnector::new();

    // Distinct payload per frame, scripted before capture starts
    let utterance: Vec<Vec<i16>> = (0..20).map(|i| vec![1000 + i as i16 * 10; FRAME]).collect();
    for frame in &utterance {
        mic.push_samples(frame);
    }

    let mut session = SessionHandle::new(config).unwrap();
    session.start(input, output, Arc::new(connector)).unwrap();

    wait_for_state(&session, SessionState::AwaitingResponse).await;
    let report = session.stop().await.unwrap();

    let frames = remote.frames(0);
    assert!(frames.len() >= utterance.len());
    for (i, (sequence, samples)) in frames.iter().enumerate() {
        assert_eq!(*sequence, i as u64, "sequence gap at {}", i);
        if let Some(expected) = utterance.get(i) {
            assert_eq!(samples, expected, "payload mismatch at {}", i);
        }
    }
    assert_eq!(remote.commits(0), 1);
    assert_eq!(report.metrics.queries_committed, 1);
    assert_eq!(report.final_state, SessionState::ShuttingDown);
    assert!(remote.is_closed(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silence_while_bot_speaks_never_interrupts() {
    let mut h = start(test_config());
    bot_speaking(&h).await;

    // Reply plays to the end over a silent microphone
    let mut rx = h.session.subscribe();
    let back = matches!(
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| s.state == SessionState::Listening && s.turn == 1),
        )
        .await,
        Ok(Ok(_))
    );
    assert!(back);

    // The finished cycle's connection is replaced for the next turn
    wait_until("fresh connection", || h.remote.connections() == 2).await;
    assert!(h.remote.is_closed(0));

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.metrics.flushes, 0);
    assert_eq!(report.metrics.interrupts_detected, 0);
    assert_eq!(report.metrics.chunks_received, REPLY_CHUNKS as u64);

    // Played completely and in order
    let written = h.speaker.written();
    assert_eq!(written.len(), REPLY_CHUNK * REPLY_CHUNKS);
    assert!(written.iter().all(|&s| s == REPLY_VALUE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loud_frame_interrupts_playback() {
    let mut h = start(test_config());
    bot_speaking(&h).await;

    // Let some of the reply reach the speaker, then barge in with one frame
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.mic.push_constant(8000, FRAME);

    wait_until("flush", || h.session.metrics().flushes == 1).await;
    wait_for_state(&h.session, SessionState::Listening).await;
    assert_eq!(h.remote.connections(), 2);
    assert!(h.remote.is_closed(0));

    // Nothing from the old reply is written after the flush
    let played = h.speaker.written().len();
    assert!(played < REPLY_CHUNK * REPLY_CHUNKS);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.speaker.written().len(), played);
    assert!(h.speaker.discards() >= 1);

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.metrics.flushes, 1);
    assert_eq!(report.metrics.reconnects, 1);
    assert!(report.metrics.interrupts_detected >= 1);

    // The barge-in frame predates the flush and reaches neither connection
    for connection in 0..2 {
        assert!(h
            .remote
            .frames(connection)
            .iter()
            .all(|(_, samples)| samples[0] != 8000));
    }
    let old_last = h.remote.sequences(0).last().copied().unwrap_or(0);
    assert!(h.remote.sequences(1).iter().all(|&seq| seq > old_last));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_reply_cycle_gets_a_fresh_connection() {
    let mut h = start(test_config());
    // 200ms reply
    h.remote
        .respond_on_commit(vec![vec![REPLY_VALUE; REPLY_CHUNK]; 10], 24000);
    wait_for_state(&h.session, SessionState::Listening).await;

    for cycle in 0..2u64 {
        speak(&h.mic, 10);

        let mut rx = h.session.subscribe();
        let done = matches!(
            tokio::time::timeout(
                WAIT,
                rx.wait_for(|s| s.state == SessionState::Listening && s.turn == cycle + 1),
            )
            .await,
            Ok(Ok(_))
        );
        assert!(done, "cycle {} did not finish", cycle);

        let expected = cycle as usize + 2;
        wait_until("next connection", || h.remote.connections() == expected).await;
    }

    // One query per connection, each closed once its reply finished
    for connection in 0..2 {
        assert_eq!(h.remote.commits(connection), 1);
        assert!(h.remote.is_closed(connection));
    }

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.metrics.flushes, 0);
    assert_eq!(report.metrics.queries_committed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_flush_once() {
    let mut h = start(test_config());
    bot_speaking(&h).await;

    let trigger = h.session.flush_trigger().unwrap();
    let generation = h.session.snapshot().generation;
    let signal = InterruptionSignal {
        rms: 0.5,
        energy_delta: 0.5,
        zcr: 0.0,
        interrupt: true,
    };

    let barrier = Arc::new(std::sync::Barrier::new(16));
    let threads: Vec<_> = (0..16)
        .map(|_| {
            let trigger = trigger.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                trigger.fire(generation, signal)
            })
        })
        .collect();
    let winners = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|&won| won)
        .count();
    assert!(winners >= 1);

    wait_for_state(&h.session, SessionState::Listening).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.metrics.flushes, 1);
    assert_eq!(report.metrics.reconnects, 1);
    assert_eq!(h.remote.connections(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_interrupt_only_while_bot_speaks() {
    let mut h = start(test_config());
    wait_for_state(&h.session, SessionState::Listening).await;
    assert!(!h.session.interrupt());

    h.remote
        .respond_on_commit(vec![vec![REPLY_VALUE; REPLY_CHUNK]; REPLY_CHUNKS], 24000);
    speak(&h.mic, 10);
    wait_for_state(&h.session, SessionState::BotSpeaking).await;
    assert!(h.session.is_bot_speaking());

    assert!(h.session.interrupt());
    wait_for_state(&h.session, SessionState::Listening).await;

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.metrics.flushes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unresponsive_close_does_not_stall_flush() {
    let mut h = start(test_config());
    h.remote.stall_close();
    bot_speaking(&h).await;

    assert!(h.session.interrupt());
    wait_until("flush", || h.session.metrics().flushes == 1).await;
    wait_for_state(&h.session, SessionState::Listening).await;
    assert_eq!(h.remote.connections(), 2);

    let report = tokio::time::timeout(WAIT, h.session.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.final_state, SessionState::ShuttingDown);
    assert_eq!(report.metrics.reconnects, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_reconnect_during_flush_is_fatal() {
    let mut h = start(test_config());
    bot_speaking(&h).await;

    h.remote.fail_next_connects(10);
    assert!(h.session.interrupt());

    let report = tokio::time::timeout(WAIT, h.session.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.final_state, SessionState::Idle);
    assert_eq!(report.metrics.flushes, 1);
    assert_eq!(report.metrics.reconnects, 0);
    // One successful open, then the capped retries
    assert_eq!(h.remote.connect_attempts(), 4);
    assert!(h.remote.is_closed(0));
    assert!(matches!(
        report.error(),
        Some(EngineError::Connection(ConnectionError::RetriesExhausted {
            attempts: 3,
            ..
        }))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn input_failure_ends_session_idle() {
    let mut h = start(test_config());
    wait_for_state(&h.session, SessionState::Listening).await;

    h.mic.fail("microphone unplugged");

    let report = tokio::time::timeout(WAIT, h.session.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.final_state, SessionState::Idle);
    assert_eq!(h.session.current_state(), SessionState::Idle);
    assert!(matches!(
        report.error(),
        Some(EngineError::Device(DeviceError::ReadFailed(_)))
    ));
    assert!(report.fatal_error.unwrap().contains("microphone unplugged"));
    assert!(h.remote.is_closed(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn output_failure_ends_session_idle() {
    let mut h = start(test_config());
    wait_for_state(&h.session, SessionState::Listening).await;

    h.speaker.fail("speaker gone");

    let report = tokio::time::timeout(WAIT, h.session.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.final_state, SessionState::Idle);
    assert!(matches!(
        report.into_result(),
        Err(EngineError::Device(DeviceError::WriteFailed(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_connection_reconnects() {
    let mut h = start(test_config());
    wait_for_state(&h.session, SessionState::Listening).await;
    wait_until("first connection", || h.remote.connections() == 1).await;

    h.remote.drop_connection();

    wait_until("reconnect", || h.remote.connections() == 2).await;
    wait_for_state(&h.session, SessionState::Listening).await;

    // The new connection carries the conversation on
    speak(&h.mic, 10);
    wait_for_state(&h.session, SessionState::AwaitingResponse).await;
    assert_eq!(h.remote.commits(1), 1);

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.metrics.reconnects, 1);
    assert!(report.error().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_are_fatal() {
    let config = test_config();
    let (input, _mic) = MockInput::new(16000);
    let (output, _speaker) = MockOutput::new(24000);
    let (connector, remote) = MockConnector::new();
    remote.fail_next_connects(10);

    let mut session = SessionHandle::new(config).unwrap();
    session.start(input, output, Arc::new(connector)).unwrap();

    let report = tokio::time::timeout(WAIT, session.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.final_state, SessionState::Idle);
    assert_eq!(remote.connect_attempts(), 3);
    assert!(matches!(
        report.error(),
        Some(EngineError::Connection(ConnectionError::RetriesExhausted {
            attempts: 3,
            ..
        }))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_while_bot_speaks_shuts_down() {
    let mut h = start(test_config());
    bot_speaking(&h).await;

    let report = h.session.stop().await.unwrap();
    assert_eq!(report.final_state, SessionState::ShuttingDown);
    assert!(report.error().is_none());
    assert!(h.remote.is_closed(0));

    // The handle is spent
    assert!(matches!(
        h.session.stop().await,
        Err(EngineError::ControllerClosed)
    ));
}
