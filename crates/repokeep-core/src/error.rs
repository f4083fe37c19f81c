use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepokeepError {
    #[error("not initialized: run 'repokeep init'")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot reach {host}: {message}")]
    Connectivity { host: String, message: String },

    #[error("slot allocation failed: {0}")]
    Allocation(String),

    #[error("backup of stanza '{stanza}' failed: {message}")]
    Backup { stanza: String, message: String },

    #[error("snapshot operation on {target} failed: {message}")]
    Snapshot { target: String, message: String },

    #[error("state store error: {0}")]
    State(String),

    #[error("step '{step}' failed on {host}: {source}")]
    Step {
        step: String,
        host: String,
        #[source]
        source: Box<RepokeepError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RepokeepError {
    pub fn connectivity(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn backup(stanza: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backup {
            stanza: stanza.into(),
            message: message.into(),
        }
    }

    pub fn snapshot(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Snapshot {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Taxonomy bucket of this error, looking through `Step` wrappers.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotInitialized | Self::Configuration(_) | Self::Yaml(_) => "configuration",
            Self::Connectivity { .. } => "connectivity",
            Self::Allocation(_) => "allocation",
            Self::Backup { .. } => "backup",
            Self::Snapshot { .. } => "snapshot",
            Self::State(_) => "state",
            Self::Step { source, .. } => source.category(),
            Self::Io(_) | Self::Json(_) => "io",
        }
    }

    /// The innermost error, with any `Step` wrappers removed.
    pub fn root_cause(&self) -> &RepokeepError {
        match self {
            Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RepokeepError>;
