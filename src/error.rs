use std::fmt;
use std::io;

pub(crate) type TintaResult<T> = Result<T, Error>;

/// Errors that can occur during tinta usage
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred when reading a grammar or theme file
    Io(io::Error),

    /// JSON parsing failed when loading a grammar or a theme.
    Json(serde_json::Error),

    /// The root grammar for a scope was requested but never supplied.
    /// Only raised for the scope tokenization starts from; includes pointing
    /// at missing grammars are recovered silently.
    GrammarNotFound(String),

    /// A color was requested from a frozen palette that does not contain it.
    /// This indicates a palette/theme mismatch that would silently mis-render
    /// downstream, so it is fatal.
    ColorNotFound(String),

    /// A regex compilation error occurred during tokenization.
    /// This can happen because some regex patterns are modified at runtime
    /// (back-reference substitution) so we can't validate them all ahead.
    TokenizeRegex(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "JSON parsing error: {}", err),
            Error::GrammarNotFound(scope) => {
                write!(f, "no grammar provided for <{}>", scope)
            }
            Error::ColorNotFound(color) => {
                write!(f, "missing color in frozen color map: {}", color)
            }
            Error::TokenizeRegex(message) => write!(f, "regex compilation error: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::GrammarNotFound(_) | Error::ColorNotFound(_) | Error::TokenizeRegex(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}
