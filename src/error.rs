use std::path::PathBuf;

use thiserror::Error;

use crate::git_funcs::VcsError;
use crate::review_funcs::ServiceError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Something the user can fix: a missing flag, uncommitted work, an unknown shortcut.
    #[error("{0}")]
    User(String),

    #[error("no git repository found in {} or any parent directory", .0.display())]
    NoRepositoryFound(PathBuf),

    #[error(
        "no Bitbucket server configured for {base_url}\n\
         Add it with: bpc config --server-base-url {base_url} --server-shortcut <shortcut>"
    )]
    UnconfiguredServer { base_url: String },

    #[error("{0}; the configuration is inconsistent, please report a bug")]
    Consistency(String),

    #[error("Bitbucket URL {server} is different from repository one {repository}")]
    UrlMismatch { server: String, repository: String },

    #[error("Bitbucket server error: {0}")]
    RemoteService(#[from] ServiceError),

    #[error(transparent)]
    Transport(#[from] VcsError),

    #[error(
        "configuration file '{}' is corrupted ({source}), remove it to run the initial configuration again",
        path.display()
    )]
    CorruptConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid URL '{url}': {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Error::User(message.into())
    }

    /// Process exit code: `2` for critical errors, `1` for everything the user can recover from.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Consistency(_) | Error::UrlMismatch { .. } => 2,
            _ => 1,
        }
    }
}
