use std::error::Error;

use http::StatusCode;

use crate::fs::FsError;

/// Internal error type of the method engine.
///
/// Every variant maps onto exactly one HTTP status via `statuscode()`.
#[derive(Debug)]
pub(crate) enum DavError {
    /// Error reading request XML.
    XmlReadError,
    /// XML was well-formed but not what we expected.
    XmlParseError,
    /// Request path could not be parsed.
    InvalidPath,
    /// Request path does not fall under the configured prefix.
    IllegalPath,
    /// HTTP method unknown to the engine.
    UnknownMethod,
    /// A stream lock is held by another request.
    Busy,
    /// Typed filesystem error.
    FsError(FsError),
    /// Any other condition, expressed as a bare status.
    Status(StatusCode),
    IoError(std::io::Error),
    XmlWriterError(xml::writer::Error),
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::IoError(e) => Some(e),
            DavError::XmlWriterError(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for DavError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DavError::XmlReadError => write!(f, "XML read error"),
            DavError::XmlParseError => write!(f, "XML parse error"),
            DavError::XmlWriterError(_) => write!(f, "XML generate error"),
            DavError::IoError(_) => write!(f, "I/O error"),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<std::io::Error> for DavError {
    fn from(e: std::io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        DavError::XmlWriterError(e)
    }
}

impl From<FsError> for DavError {
    fn from(e: FsError) -> Self {
        DavError::FsError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(sc: StatusCode) -> Self {
        DavError::Status(sc)
    }
}

pub(crate) fn fserror_to_status(e: FsError) -> StatusCode {
    match e {
        FsError::NotFound => StatusCode::NOT_FOUND,
        FsError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        FsError::Forbidden => StatusCode::FORBIDDEN,
        FsError::NotACollection => StatusCode::CONFLICT,
        FsError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::IllegalPath => StatusCode::NOT_FOUND,
            DavError::UnknownMethod => StatusCode::METHOD_NOT_ALLOWED,
            DavError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            DavError::FsError(e) => fserror_to_status(*e),
            DavError::Status(sc) => *sc,
            DavError::IoError(_) => StatusCode::BAD_REQUEST,
            DavError::XmlWriterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
