//! Multiplexer state machine
//!
//! ```text
//!   Wait ──► Connecting ──► Ready ──► End
//!                 │                    ▲
//!                 └──► Error           │
//!   Wait ──────────────────────────────┘  (clear before any subscribe)
//! ```
//!
//! `Error` and `End` are terminal: a fresh multiplexer is needed to retry.

/// Lifecycle state of a multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultiplexerStatus {
    /// Created, no subscriber yet
    Wait,
    /// Connecting to every shard of the target
    Connecting,
    /// All shards connected, events are fanned out
    Ready,
    /// Shard setup failed
    Error,
    /// Torn down
    End,
}

impl MultiplexerStatus {
    /// Whether the multiplexer can never be used again
    pub fn is_terminal(self) -> bool {
        matches!(self, MultiplexerStatus::Error | MultiplexerStatus::End)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: MultiplexerStatus) -> bool {
        use MultiplexerStatus::*;

        matches!(
            (self, next),
            (Wait, Connecting)
                | (Wait, End)
                | (Connecting, Ready)
                | (Connecting, Error)
                | (Ready, End)
        )
    }
}

impl std::fmt::Display for MultiplexerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MultiplexerStatus::Wait => "wait",
            MultiplexerStatus::Connecting => "connecting",
            MultiplexerStatus::Ready => "ready",
            MultiplexerStatus::Error => "error",
            MultiplexerStatus::End => "end",
        };
        f.write_str(name)
    }
}
