use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("search request failed with status {status}")]
    HttpRequestFailed { status: StatusCode },

    #[error("malformed catalog response")]
    MalformedResponse(#[from] serde_json::Error),

    #[error("malformed acquisition timestamp '{value}'")]
    MalformedTimestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("download failed with status {status}")]
    DownloadFailed { status: StatusCode, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
