/// Primary sqlite result codes for a database another connection is holding.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, thiserror::Error)]
/// Failure of a sqlite operation, split by whether running it again may succeed.
pub enum Error {
    #[error("sqlite temporarily unavailable: {0}")]
    /// Pool exhausted, I/O failure or a busy database.
    Transient(#[source] sqlx::Error),
    #[error("sqlite error: {0}")]
    /// Invalid statement, bad data or a broken database. Retrying the same call cannot help.
    Permanent(#[source] sqlx::Error),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        let transient = match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
            // sqlite reports extended codes, the low byte is the primary code
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
            _ => false,
        };
        if transient {
            Self::Transient(e)
        } else {
            Self::Permanent(e)
        }
    }
}
