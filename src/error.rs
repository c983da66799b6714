pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid chunk list: {0}")]
    InvalidChunkList(String),

    #[error("position {0} precedes the first chunk")]
    PositionOutOfRange(u64),

    #[error("read of {len} bytes at position {position} falls outside chunk window {start}..{end}")]
    ReadOutOfWindow {
        position: u64,
        len: usize,
        start: u64,
        end: u64,
    },

    #[error("fetch failed for chunk at offset {offset}")]
    FetchFailed { offset: u64 },

    #[error("byte source is closed")]
    SourceClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Contract violations are caller errors and are never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidChunkList(_)
                | Error::PositionOutOfRange(_)
                | Error::ReadOutOfWindow { .. }
        )
    }
}
