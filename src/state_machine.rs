//! Session state machine for the duplex engine
//!
//! Single-writer pattern: only the controller task calls `reduce()`, which
//! returns the next snapshot and a list of effects for the controller to
//! execute. Every other task reads the published snapshot.
//!
//! ```text
//! Idle --Start--> Listening
//! Listening --QuerySent--> AwaitingResponse
//! AwaitingResponse --ResponseAudio--> BotSpeaking
//! BotSpeaking --Interrupt--> Flushing
//! Flushing --FlushComplete--> Listening
//! BotSpeaking --ResponseEnded--> Listening (fresh connection)
//! any --Stop--> ShuttingDown (terminal)
//! any --Fatal--> Idle
//! ```

use serde::Serialize;

use crate::engine::InterruptionSignal;
use crate::error::{ConnectionError, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    AwaitingResponse,
    BotSpeaking,
    Flushing,
    ShuttingDown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Listening => "Listening",
            SessionState::AwaitingResponse => "AwaitingResponse",
            SessionState::BotSpeaking => "BotSpeaking",
            SessionState::Flushing => "Flushing",
            SessionState::ShuttingDown => "ShuttingDown",
        };
        f.write_str(name)
    }
}

/// The published, authoritative session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Pipeline generation. Bumped on start, on every flush and at the end of
    /// every reply; tasks tag their events with the generation they were
    /// spawned under.
    pub generation: u64,
    /// Number of times the session has entered `BotSpeaking`
    pub turn: u64,
}

/// Why a flush was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Barge-in detected (or requested) while the bot was speaking
    Interrupt,
    /// The remote connection failed mid-cycle
    ConnectionLost,
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    /// Session owner started the session
    Start,
    /// Session owner requested shutdown
    Stop,
    /// TransmitTask committed the user's turn
    QuerySent { generation: u64 },
    /// ReceiveTask got synthesized audio
    ResponseAudio { generation: u64 },
    /// Response finished and playback drained
    ResponseEnded { generation: u64 },
    /// Barge-in trigger
    Interrupt {
        generation: u64,
        signal: InterruptionSignal,
    },
    /// Transmit or receive lost the remote connection
    ConnectionLost {
        generation: u64,
        error: ConnectionError,
    },
    /// Controller finished rebuilding the pipeline
    FlushComplete { generation: u64 },
    /// Unrecoverable error; ends the session
    Fatal { error: EngineError },
}

impl Event {
    /// Pipeline generation the event was produced under, if it is tagged
    pub fn generation(&self) -> Option<u64> {
        match self {
            Event::QuerySent { generation }
            | Event::ResponseAudio { generation }
            | Event::ResponseEnded { generation }
            | Event::Interrupt { generation, .. }
            | Event::ConnectionLost { generation, .. }
            | Event::FlushComplete { generation } => Some(*generation),
            Event::Start | Event::Stop | Event::Fatal { .. } => None,
        }
    }
}

/// Effects to be executed by the controller after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a remote connection and spawn transmit/receive for `generation`
    OpenPipeline { generation: u64 },
    /// Run the flush sequence, re-arming the pipeline as `generation`
    Flush { generation: u64, reason: FlushReason },
    /// Close the finished cycle's connection and open `generation` for the next turn
    Rotate { generation: u64 },
    /// Cancel every task and release devices and the connection
    Shutdown,
    /// Publish the new snapshot to readers
    Publish,
}

/// Reducer function: (snapshot, event) -> (next_snapshot, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale generations
/// - Emit Publish on every state change, ahead of the other effects, so
///   readers see the new state before the controller acts on it
pub fn reduce(current: &SessionSnapshot, event: Event) -> (SessionSnapshot, Vec<Effect>) {
    use Effect::*;
    use SessionState::*;

    if let Some(generation) = event.generation() {
        if generation != current.generation {
            log::debug!(
                "Dropping stale event from generation {} (current {}): {:?}",
                generation,
                current.generation,
                event
            );
            return (*current, vec![]);
        }
    }

    let to = |state: SessionState| SessionSnapshot { state, ..*current };

    // One connection per Listening..BotSpeaking cycle
    let rotate = || {
        let generation = current.generation + 1;
        (
            SessionSnapshot {
                state: Listening,
                generation,
                turn: current.turn,
            },
            vec![Publish, Rotate { generation }],
        )
    };

    let flush = |reason: FlushReason| {
        let generation = current.generation + 1;
        (
            SessionSnapshot {
                state: Flushing,
                generation,
                turn: current.turn,
            },
            vec![Publish, Flush { generation, reason }],
        )
    };

    match (current.state, event) {
        // -----------------
        // Terminal
        // -----------------
        (ShuttingDown, _) => (*current, vec![]),
        (_, Event::Stop) => (to(ShuttingDown), vec![Publish, Shutdown]),

        // -----------------
        // Fatal
        // -----------------
        (Idle, Event::Fatal { .. }) => (*current, vec![Shutdown]),
        (_, Event::Fatal { .. }) => (to(Idle), vec![Publish, Shutdown]),

        // -----------------
        // Idle
        // -----------------
        (Idle, Event::Start) => {
            let generation = current.generation + 1;
            (
                SessionSnapshot {
                    state: Listening,
                    generation,
                    turn: current.turn,
                },
                vec![Publish, OpenPipeline { generation }],
            )
        }

        // -----------------
        // Listening
        // -----------------
        (Listening, Event::QuerySent { .. }) => (to(AwaitingResponse), vec![Publish]),

        // -----------------
        // AwaitingResponse
        // -----------------
        (AwaitingResponse, Event::ResponseAudio { .. }) => (
            SessionSnapshot {
                state: BotSpeaking,
                generation: current.generation,
                turn: current.turn + 1,
            },
            vec![Publish],
        ),
        // Response carried no audio
        (AwaitingResponse, Event::ResponseEnded { .. }) => rotate(),

        // -----------------
        // BotSpeaking
        // -----------------
        (BotSpeaking, Event::ResponseEnded { .. }) => rotate(),
        (BotSpeaking, Event::Interrupt { .. }) => flush(FlushReason::Interrupt),

        (Listening | AwaitingResponse | BotSpeaking, Event::ConnectionLost { .. }) => {
            flush(FlushReason::ConnectionLost)
        }

        // -----------------
        // Flushing
        // -----------------
        (Flushing, Event::FlushComplete { .. }) => (to(Listening), vec![Publish]),

        // -----------------
        // Unhandled: no transition
        // (includes a second Interrupt while Flushing)
        // -----------------
        _ => (*current, vec![]),
    }
}
