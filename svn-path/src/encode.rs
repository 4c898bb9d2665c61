use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::Error;

// The byte set the DAV client expects to see escaped in href payload
// segments. Everything outside 0x20..=0x7E is covered by CONTROLS plus the
// crate's always-encode rule for non-ASCII bytes.
const URI_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b'#')
    .add(b' ')
    .add(b'^')
    .add(b'{')
    .add(b'[')
    .add(b'}')
    .add(b']')
    .add(b';')
    .add(b'`')
    .add(b'&')
    .add(0x7f);

/// Percent-encodes a URI payload segment. Non-ASCII characters are encoded
/// as their UTF-8 byte sequences.
pub fn encode_uri(s: &str) -> String {
    utf8_percent_encode(s, URI_SET).to_string()
}

/// The exact inverse of [`encode_uri`].
pub fn decode_uri(s: &str) -> Result<String, Error> {
    Ok(percent_decode_str(s)
        .decode_utf8()
        .map_err(|e| Error::InvalidUtf8 {
            input: s.into(),
            source: e,
        })?
        .into_owned())
}
