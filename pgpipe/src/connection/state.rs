/// Connection phase, each phase gates which backend messages are legal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Startup message sent, waiting for the first authentication request.
    #[default]
    Connecting,
    AuthenticatingCleartext,
    AuthenticatingMD5,
    AuthenticatingSASL,
    /// Authenticated, collecting `BackendKeyData` and `ParameterStatus`
    /// until the first `ReadyForQuery`.
    BackendKeyWait,
    Idle,
    /// A query is in flight.
    Busy,
    /// `Terminate` was written.
    Ending,
    Ended,
}

impl ConnectionState {
    /// Whether startup completed and the connection can carry queries.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }

    pub fn is_authenticating(&self) -> bool {
        matches!(
            self,
            Self::AuthenticatingCleartext | Self::AuthenticatingMD5 | Self::AuthenticatingSASL
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Ending | Self::Ended)
    }
}
