//! Source resolution: URI plus DIDL-Lite metadata to a typed [`Source`].

use quick_xml::Reader;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use serde::Serialize;

/// Media types the renderer accepts, as advertised to control points.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/ogg",
    "audio/mp4",
    "audio/3gpp",
    "audio/3gpp2",
    "audio/x-ms-asf",
    "video/MP2T",
    "video/mp4",
    "video/3gpp",
    "video/3gpp2",
    "video/mpeg",
    "video/avi",
    "image/jpeg",
    "image/gif",
    "image/png",
    "image/bmp",
];

/// What kind of pipeline a source needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Audio,
    Video,
    Image,
}

impl MediaKind {
    /// Classify a MIME type against the supported list.
    ///
    /// Parameters are ignored, comparison is case-insensitive and an `x-`
    /// subtype prefix is optional.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let wanted = normalize_mime(mime_type)?;
        let supported = SUPPORTED_MIME_TYPES
            .iter()
            .any(|m| normalize_mime(m).as_deref() == Some(wanted.as_str()));
        if !supported {
            return None;
        }
        match wanted.split('/').next() {
            Some("audio") => Some(Self::Audio),
            Some("video") => Some(Self::Video),
            Some("image") => Some(Self::Image),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image)
    }
}

fn normalize_mime(mime_type: &str) -> Option<String> {
    let essence = mime_type.split(';').next()?.trim().to_ascii_lowercase();
    let (top, sub) = essence.split_once('/')?;
    let sub = sub.strip_prefix("x-").unwrap_or(sub);
    if top.is_empty() || sub.is_empty() {
        return None;
    }
    Some(format!("{}/{}", top, sub))
}

/// Sink protocol info entries (`http-get:*:<mime>:*`).
pub fn protocol_info() -> Vec<String> {
    SUPPORTED_MIME_TYPES
        .iter()
        .map(|m| format!("http-get:*:{}:*", m))
        .collect()
}

/// A resolved, playable item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub uri: String,
    pub mime_type: String,
    pub kind: MediaKind,
    /// `dc:title` from the metadata, if any
    pub title: Option<String>,
}

impl Source {
    /// Resolve a URI and optional DIDL-Lite metadata.
    ///
    /// The MIME type comes from the first `<res protocolInfo>`; without one
    /// it is guessed from the URI's file extension.
    pub fn resolve(uri: &str, metadata: Option<&str>) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(SourceError::EmptyUri);
        }
        if !has_scheme(uri) {
            return Err(SourceError::MissingScheme(uri.to_string()));
        }

        let didl = match metadata.map(str::trim).filter(|m| !m.is_empty()) {
            Some(xml) => parse_didl(xml)?,
            None => DidlInfo::default(),
        };

        let mime_type = didl
            .protocol_info
            .as_deref()
            .and_then(mime_from_protocol_info)
            .or_else(|| guess_mime(uri).map(str::to_string))
            .ok_or_else(|| SourceError::UnknownType(uri.to_string()))?;

        let kind = MediaKind::from_mime(&mime_type)
            .ok_or_else(|| SourceError::UnsupportedType(mime_type.clone()))?;

        Ok(Self {
            uri: uri.to_string(),
            mime_type,
            kind,
            title: didl.title,
        })
    }
}

fn has_scheme(uri: &str) -> bool {
    match uri.split_once("://") {
        Some((scheme, rest)) => {
            !rest.is_empty()
                && scheme
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Third field of `protocol:network:contentFormat:additionalInfo`.
fn mime_from_protocol_info(protocol_info: &str) -> Option<String> {
    let mime = protocol_info.split(':').nth(2)?.trim();
    (!mime.is_empty() && mime != "*").then(|| mime.to_string())
}

fn guess_mime(uri: &str) -> Option<&'static str> {
    let path = uri.split(['?', '#']).next()?;
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "mp3" | "mpga" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "m4a" | "aac" => "audio/mp4",
        "wma" | "asf" => "audio/x-ms-asf",
        "ts" | "m2ts" => "video/MP2T",
        "mp4" | "m4v" => "video/mp4",
        "3gp" => "video/3gpp",
        "3g2" => "video/3gpp2",
        "mpg" | "mpeg" => "video/mpeg",
        "avi" => "video/avi",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "png" => "image/png",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime)
}

#[derive(Debug, Default)]
struct DidlInfo {
    protocol_info: Option<String>,
    title: Option<String>,
}

fn parse_didl(xml: &str) -> Result<DidlInfo, SourceError> {
    // Untrimmed: text around an entity reference arrives in separate events.
    let mut reader = Reader::from_str(xml);

    let mut info = DidlInfo::default();
    let mut title: Option<String> = None;
    let mut depth = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SourceError::Metadata(e.to_string()))?;
        match event {
            Event::Start(e) => {
                depth += 1;
                match e.local_name().as_ref() {
                    b"res" => read_protocol_info(&reader, &e, &mut info)?,
                    b"title" if info.title.is_none() => title = Some(String::new()),
                    _ => {}
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"res" {
                    read_protocol_info(&reader, &e, &mut info)?;
                }
            }
            Event::Text(e) => {
                if let Some(title) = title.as_mut() {
                    let text = e
                        .decode()
                        .map_err(|e| SourceError::Metadata(e.to_string()))?;
                    title.push_str(&text);
                }
            }
            Event::GeneralRef(e) => {
                if let Some(title) = title.as_mut() {
                    push_reference(title, &e)?;
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref() == b"title" {
                    if let Some(text) = title.take() {
                        let text = text.trim();
                        if !text.is_empty() {
                            info.title = Some(text.to_string());
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(SourceError::Metadata("unclosed element".to_string()));
    }
    Ok(info)
}

/// Append the text an entity or character reference stands for.
/// Unknown entities are kept as written.
fn push_reference(out: &mut String, reference: &BytesRef<'_>) -> Result<(), SourceError> {
    if let Some(ch) = reference
        .resolve_char_ref()
        .map_err(|e| SourceError::Metadata(e.to_string()))?
    {
        out.push(ch);
        return Ok(());
    }
    let name = reference
        .decode()
        .map_err(|e| SourceError::Metadata(e.to_string()))?;
    match resolve_predefined_entity(&name) {
        Some(text) => out.push_str(text),
        None => {
            out.push('&');
            out.push_str(&name);
            out.push(';');
        }
    }
    Ok(())
}

fn read_protocol_info(
    reader: &Reader<&[u8]>,
    element: &quick_xml::events::BytesStart<'_>,
    info: &mut DidlInfo,
) -> Result<(), SourceError> {
    if info.protocol_info.is_some() {
        return Ok(());
    }
    for attr in element.attributes() {
        let attr = attr.map_err(|e| SourceError::Metadata(e.to_string()))?;
        if attr.key.local_name().as_ref() == b"protocolInfo" {
            let value = attr
                .decode_and_unescape_value(reader.decoder())
                .map_err(|e| SourceError::Metadata(e.to_string()))?;
            info.protocol_info = Some(value.into_owned());
        }
    }
    Ok(())
}

/// Source resolution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Empty source URI")]
    EmptyUri,

    #[error("Source URI has no scheme: {0}")]
    MissingScheme(String),

    #[error("Malformed source metadata: {0}")]
    Metadata(String),

    #[error("Cannot determine media type of {0}")]
    UnknownType(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DIDL: &str = r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"
        xmlns:dc="http://purl.org/dc/elements/1.1/"
        xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">
      <item id="1" parentID="0" restricted="1">
        <dc:title>Morning Show</dc:title>
        <upnp:class>object.item.audioItem.musicTrack</upnp:class>
        <res protocolInfo="http-get:*:audio/mpeg:DLNA.ORG_PN=MP3">http://h/stream</res>
        <res protocolInfo="http-get:*:audio/ogg:*">http://h/stream.ogg</res>
      </item>
    </DIDL-Lite>"#;

    #[test]
    fn test_resolve_uses_first_res_protocol_info() {
        let source = Source::resolve("http://h/stream", Some(DIDL)).unwrap();
        assert_eq!(source.mime_type, "audio/mpeg");
        assert_eq!(source.kind, MediaKind::Audio);
        assert_eq!(source.title.as_deref(), Some("Morning Show"));
    }

    #[test]
    fn test_title_keeps_escaped_characters() {
        let didl = r#"<DIDL-Lite><item><dc:title> Tom &amp; Jerry &#8211; &lt;Live&gt; </dc:title><res protocolInfo="http-get:*:audio/mpeg:*">x</res></item></DIDL-Lite>"#;
        let source = Source::resolve("http://h/stream", Some(didl)).unwrap();
        assert_eq!(source.title.as_deref(), Some("Tom & Jerry \u{2013} <Live>"));
    }

    #[test]
    fn test_resolve_guesses_from_extension() {
        let source = Source::resolve("http://h/photos/cat.JPG?size=big", None).unwrap();
        assert_eq!(source.kind, MediaKind::Image);
        assert_eq!(source.mime_type, "image/jpeg");

        let source = Source::resolve("http://h/live/channel.ts", Some("  ")).unwrap();
        assert_eq!(source.kind, MediaKind::Video);
    }

    #[test]
    fn test_wildcard_protocol_info_falls_back_to_extension() {
        let didl = r#"<DIDL-Lite><item><res protocolInfo="http-get:*:*:*"/></item></DIDL-Lite>"#;
        let source = Source::resolve("http://h/a.mp3", Some(didl)).unwrap();
        assert_eq!(source.mime_type, "audio/mpeg");
    }

    #[test]
    fn test_resolution_failures() {
        assert!(matches!(Source::resolve("", None), Err(SourceError::EmptyUri)));
        assert!(matches!(
            Source::resolve("/local/file.mp3", None),
            Err(SourceError::MissingScheme(_))
        ));
        assert!(matches!(
            Source::resolve("http://h/stream", None),
            Err(SourceError::UnknownType(_))
        ));
        assert!(matches!(
            Source::resolve("http://h/a.flac", Some(r#"<DIDL-Lite><item><res protocolInfo="http-get:*:audio/flac:*"/></item></DIDL-Lite>"#)),
            Err(SourceError::UnsupportedType(_))
        ));
        assert!(matches!(
            Source::resolve("http://h/a.mp3", Some("<DIDL-Lite><item>")),
            Err(SourceError::Metadata(_))
        ));
    }

    #[test]
    fn test_mime_classification() {
        assert_eq!(MediaKind::from_mime("video/mp2t"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime("audio/ms-asf"), Some(MediaKind::Audio));
        assert_eq!(
            MediaKind::from_mime("image/png; charset=binary"),
            Some(MediaKind::Image)
        );
        assert_eq!(MediaKind::from_mime("audio/flac"), None);
        assert_eq!(MediaKind::from_mime("nonsense"), None);
    }

    #[test]
    fn test_protocol_info_lists_every_type() {
        let info = protocol_info();
        assert_eq!(info.len(), SUPPORTED_MIME_TYPES.len());
        assert!(info.contains(&"http-get:*:video/MP2T:*".to_string()));
    }

    proptest! {
        /// Every advertised type classifies, whatever its case
        #[test]
        fn supported_types_classify_in_any_case(index in 0..SUPPORTED_MIME_TYPES.len(), upper in any::<bool>()) {
            let mime = SUPPORTED_MIME_TYPES[index];
            let mime = if upper { mime.to_ascii_uppercase() } else { mime.to_ascii_lowercase() };
            prop_assert!(MediaKind::from_mime(&mime).is_some(), "{} did not classify", mime);
        }

        /// Classification never panics on arbitrary input
        #[test]
        fn classification_total(input in ".{0,40}") {
            let _ = MediaKind::from_mime(&input);
        }
    }
}
