use std::borrow::Cow;

use crate::Error;

/// Escapes text content for embedding in a DAV XML body. Only `&`, `<` and
/// `>` need to be escaped for text nodes; attribute quoting is handled by
/// the emitter.
pub fn escape_xml(s: &str) -> Cow<str> {
    if !s.contains(|c| c == '&' || c == '<' || c == '>') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }

    Cow::Owned(out)
}

/// The inverse of [`escape_xml`]. Accepts the quote entities as well, since
/// clients are free to send them.
pub fn unescape_xml(s: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        let end = rest.find(';').ok_or_else(|| Error::UnterminatedEntity {
            input: s.into(),
        })?;

        match &rest[..=end] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            entity => {
                return Err(Error::UnknownEntity {
                    entity: entity.into(),
                })
            }
        }

        rest = &rest[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
