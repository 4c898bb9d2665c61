use std::str::Utf8Error;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("percent-decoded bytes of {input:?} are not valid UTF-8: {source}")]
    InvalidUtf8 { input: String, source: Utf8Error },

    #[error("unknown XML entity {entity:?}")]
    UnknownEntity { entity: String },

    #[error("unterminated XML entity in {input:?}")]
    UnterminatedEntity { input: String },
}
