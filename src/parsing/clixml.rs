//! CLIXML error stream decoding
//!
//! When a remote PowerShell pipeline writes to its error stream the text
//! arrives serialized as CLIXML:
//!
//! ```text
//! #< CLIXML
//! <Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">
//!   <S S="Error">Get-Foo : The term 'Get-Foo' is not recognized_x000D__x000A_</S>
//!   ...
//! </Objs>
//! ```
//!
//! Only the `S` elements carry message text. Progress records and type
//! metadata are dropped.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::{ParseError, ParseResult};

/// Literal marker that starts every CLIXML stream.
pub const CLIXML_MARKER: &str = "#< CLIXML";

/// Encoded CRLF used inside fragments.
const ENCODED_CRLF: &str = "_x000D__x000A_";

/// Continuation marker PowerShell puts in front of wrapped lines.
const CONTINUATION: &str = "+ ";

/// Returns true when `s` starts with the CLIXML marker.
pub fn is_clixml(s: &str) -> bool {
    s.starts_with(CLIXML_MARKER)
}

/// Extracts the raw text of every `S` element, in document order.
pub fn fragments(s: &str) -> ParseResult<Vec<String>> {
    let body = s.strip_prefix(CLIXML_MARKER).ok_or(ParseError::NotClixml)?;

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(false);

    let mut fragments = Vec::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"S" => {
                current = Some(String::new());
            }
            Event::Empty(e) if e.local_name().as_ref() == b"S" => {
                fragments.push(String::new());
            }
            Event::Text(e) => {
                if let Some(buf) = current.as_mut() {
                    buf.push_str(&e.unescape()?);
                }
            }
            Event::CData(e) => {
                if let Some(buf) = current.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"S" => {
                if let Some(buf) = current.take() {
                    fragments.push(buf);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(fragments)
}

/// Decodes a CLIXML error stream into readable text.
///
/// Input without the `#< CLIXML` marker is rejected with
/// [`ParseError::NotClixml`] and never passed through.
pub fn decode(s: &str) -> ParseResult<String> {
    let mut out = String::new();
    for fragment in fragments(s)? {
        out.push_str(&clean_fragment(&fragment));
    }
    Ok(out)
}

fn clean_fragment(fragment: &str) -> String {
    let cleaned = fragment.trim().replace(ENCODED_CRLF, "");
    match cleaned.strip_prefix(CONTINUATION) {
        Some(rest) => format!("\n{}", rest),
        None => cleaned,
    }
}
