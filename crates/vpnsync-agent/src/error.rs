pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The server refused our credentials: the gateway token was revoked, the
    /// gateway retired, or the provisioning secret was already used.
    #[error("unauthorized by server")]
    Unauthorized,

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("{tool} failed: {message}")]
    Command { tool: String, message: String },

    #[error("malformed interface dump: {0}")]
    Dump(String),

    #[error("not registered and no provisioning secret configured")]
    NotProvisioned,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Worth retrying on the next cycle without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Http(_) | AgentError::Command { .. } | AgentError::Io(_) => true,
            AgentError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
