use thiserror::Error;

/// Tunward error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Authentication error: {message}")]
    Auth {
        message: String,
        username: Option<String>,
    },

    #[error("Parse error: {message}")]
    Parse {
        message: String,
        input: Option<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: {message}")]
    Timeout {
        message: String,
        operation: Option<String>,
    },

    #[error("Routing error: {message}")]
    Routing {
        message: String,
        pattern: Option<String>,
    },

    #[error("Proxy error: {message}")]
    Proxy {
        message: String,
        target: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new network error with source
    pub fn network_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
            username: None,
        }
    }

    /// Create a new parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
            input: None,
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a new routing error
    pub fn routing<S: Into<String>>(message: S) -> Self {
        Self::Routing {
            message: message.into(),
            pattern: None,
        }
    }

    /// Create a new proxy error
    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
            target: None,
        }
    }

    /// Create a new proxy error with the target that failed
    pub fn proxy_with_target<S: Into<String>, T: Into<String>>(message: S, target: T) -> Self {
        Self::Proxy {
            message: message.into(),
            target: Some(target.into()),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Network { .. } => "NETWORK",
            Self::Protocol { .. } => "PROTOCOL",
            Self::Auth { .. } => "AUTH",
            Self::Parse { .. } => "PARSE",
            Self::Io(_) => "IO",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Routing { .. } => "ROUTING",
            Self::Proxy { .. } => "PROXY",
        }
    }

    /// Check if this is a recoverable (flow-scoped) error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Io(_) | Self::Proxy { .. } => true,
            Self::Config { .. } | Self::Parse { .. } | Self::Protocol { .. } => false,
            _ => true,
        }
    }
}
