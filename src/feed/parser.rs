use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Maximum element nesting accepted in a feed document.
/// Guards against pathological inputs built to exhaust memory.
const MAX_DEPTH: usize = 64;

/// Errors produced while decoding a feed body.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is not well-formed XML.
    #[error("XML parse error: {0}")]
    Xml(String),

    /// The document has no `<channel>` under its root element.
    #[error("Document has no <channel> element")]
    MissingChannel,

    #[error("Element nesting exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// The body ended while `{0}` was still open.
    #[error("Document ended inside <{0}>")]
    Truncated(String),
}

/// Channel metadata and items of an RSS document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedDocument {
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: Option<String>,
    /// Items in document order.
    pub items: Vec<FeedItem>,
}

/// One `<item>` as it appears in the document.
///
/// Missing child elements decode to empty strings; `pub_date` is kept raw
/// so callers decide how strictly to interpret it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub pub_date: String,
}

/// Where the reader currently is relative to the RSS schema.
enum Position {
    ChannelField,
    ItemField,
    Other,
}

fn position(stack: &[Vec<u8>]) -> Position {
    match stack {
        [_, channel, field] if channel == b"channel" && field != b"item" => Position::ChannelField,
        [_, channel, item, _] if channel == b"channel" && item == b"item" => Position::ItemField,
        _ => Position::Other,
    }
}

/// Decode an RSS 2.0 document.
///
/// Only unprefixed element names are recognized, so namespaced extensions
/// such as `<atom:link>` or `<content:encoded>` never overwrite the core
/// fields. Unknown elements are ignored.
///
/// # Errors
///
/// Returns [`ParseError`] if the body is not well-formed XML, is nested
/// deeper than the safety limit, ends with elements still open, or has no
/// `<channel>`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedDocument, ParseError> {
    // SEC-002: quick-xml (0.37) does not expand DOCTYPE entities; only the five
    // predefined XML entities are resolved by `unescape()`.
    // Text is trimmed once per field, after text and CDATA segments are joined
    let mut reader = Reader::from_reader(bytes);

    let mut doc = FeedDocument::default();
    let mut saw_channel = false;
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(e.name().as_ref().to_vec());
                if stack.len() > MAX_DEPTH {
                    return Err(ParseError::MaxDepthExceeded(MAX_DEPTH));
                }
                match stack.as_slice() {
                    [_, channel] if channel == b"channel" => saw_channel = true,
                    [_, channel, item] if channel == b"channel" && item == b"item" => {
                        current = Some(FeedItem::default());
                    }
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Empty(e)) => match (stack.as_slice(), e.name().as_ref()) {
                ([_], b"channel") => saw_channel = true,
                ([_, channel], b"item") if channel == b"channel" => {
                    doc.items.push(FeedItem::default());
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if !matches!(position(&stack), Position::Other) {
                    let unescaped = e
                        .unescape()
                        .map_err(|err| xml_error(&reader, err))?;
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(e)) => {
                if !matches!(position(&stack), Position::Other) {
                    let decoded = reader
                        .decoder()
                        .decode(&e)
                        .map_err(|err| xml_error(&reader, err))?;
                    text.push_str(&decoded);
                }
            }
            Ok(Event::End(_)) => {
                match position(&stack) {
                    Position::ChannelField => {
                        let value = text.trim().to_string();
                        match stack[2].as_slice() {
                            b"title" => doc.title = value,
                            b"link" => doc.link = value,
                            b"description" => doc.description = value,
                            b"language" if !value.is_empty() => doc.language = Some(value),
                            _ => {}
                        }
                    }
                    Position::ItemField => {
                        if let Some(item) = current.as_mut() {
                            let value = text.trim().to_string();
                            match stack[3].as_slice() {
                                b"title" => item.title = value,
                                b"link" => item.link = value,
                                b"description" if !value.is_empty() => {
                                    item.description = Some(value)
                                }
                                b"pubDate" => item.pub_date = value,
                                _ => {}
                            }
                        }
                    }
                    Position::Other => {
                        if let [_, channel, item] = stack.as_slice() {
                            if channel == b"channel" && item == b"item" {
                                if let Some(item) = current.take() {
                                    doc.items.push(item);
                                }
                            }
                        }
                    }
                }
                stack.pop();
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(&reader, e)),
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Truncated(
            String::from_utf8_lossy(open).into_owned(),
        ));
    }
    if !saw_channel {
        return Err(ParseError::MissingChannel);
    }

    Ok(doc)
}

fn xml_error(reader: &Reader<&[u8]>, err: impl std::fmt::Display) -> ParseError {
    ParseError::Xml(format!("{} (at byte {})", err, reader.error_position()))
}
