//! Connection lifecycle states.

/// Lifecycle state of a PMU connection.
///
/// Transitions are strictly sequential: `Idle → Connecting → Connected`
/// (server mode passes through `Listening`), `Connected → Disconnecting →
/// Idle` on stop, any active state `→ Error` on an unrecoverable transport
/// fault, and `Error → Connecting` only under a bounded reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    /// Server mode: bound and waiting for the device to connect in.
    Listening,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Listening => "Listening",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Error => "Error",
        }
    }

    /// States in which the transport is (or may become) live.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Listening | ConnectionState::Connected
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
