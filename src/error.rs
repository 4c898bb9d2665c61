use hyper::StatusCode;
use thiserror::Error;
use svn_path::escape_xml;

/// Request-level failures and their DAV wire mappings.
#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Cache(#[from] svn_bridge_cache::Error),

    #[error("checksum mismatch: client sent {expected}, server computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error(transparent)]
    Diff(#[from] svn_bridge_diff::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Loader(#[from] svn_bridge_loader::Error),

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("{0} does not exist at the requested revision")]
    NotFound(String),

    #[error(transparent)]
    Path(#[from] svn_path::Error),

    #[error(transparent)]
    Source(#[from] svn_bridge_source::Error),

    #[error("depth {0:?} is not one of 0, 1, infinity")]
    UnsupportedDepth(String),

    #[error("no handler for protocol path {0}")]
    UnsupportedProtocolPath(String),
}

impl Error {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Error::ChecksumMismatch { .. } => StatusCode::CONFLICT,
            Error::MalformedBody(_) | Error::UnsupportedDepth(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::UnsupportedProtocolPath(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Source(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The numeric code carried inside the DAV error envelope.
    pub(crate) fn dav_code(&self) -> u32 {
        match self {
            Error::ChecksumMismatch { .. } => 200_014,
            Error::NotFound(_) => 160_013,
            Error::Loader(svn_bridge_loader::Error::Cancelled) => 200_015,
            Error::Loader(_) => 175_012,
            _ => 175_002,
        }
    }

    /// The non-fatal error envelope: a numeric code plus a human-readable
    /// message under the namespace triple.
    pub(crate) fn envelope(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <D:error xmlns:D=\"DAV:\" xmlns:m=\"http://apache.org/dav/xmlns\" xmlns:C=\"svn:\">\n\
             <C:error/>\n\
             <m:human-readable errcode=\"{}\">{}</m:human-readable>\n\
             </D:error>\n",
            self.dav_code(),
            escape_xml(&self.to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_escapes_message() {
        let err = Error::NotFound(String::from("$/proj/<odd>&name"));
        let envelope = err.envelope();

        assert!(envelope.contains("errcode=\"160013\""));
        assert!(envelope.contains("&lt;odd&gt;&amp;name"));
        assert!(!envelope.contains("<odd>"));
    }

    #[test]
    fn test_status_mappings() {
        assert_eq!(
            Error::UnsupportedDepth(String::from("2")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound(String::new()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::ChecksumMismatch {
                expected: String::new(),
                computed: String::new()
            }
            .status(),
            StatusCode::CONFLICT
        );
    }
}
