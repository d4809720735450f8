//! XML request bodies and response parsing.
//!
//! The Blob and Queue services speak XML.  This module renders the few
//! request bodies the client sends and parses the responses it reads, using
//! `quick-xml` events.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::errors::{Result, StorageError};

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn xml_error(e: quick_xml::Error) -> StorageError {
    StorageError::Internal(anyhow::anyhow!("XML error: {}", e))
}

fn new_document() -> Result<XmlWriter> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_error)?;
    Ok(writer)
}

fn finish(writer: XmlWriter) -> Result<String> {
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| StorageError::Internal(anyhow::anyhow!("XML is not UTF-8: {}", e)))
}

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut XmlWriter, tag: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_error)
}

// -- Request bodies -----------------------------------------------------------

/// Render a Put Block List body committing `block_ids` in order.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <BlockList><Latest>YmxrLTAwMDAwMA==</Latest>...</BlockList>
/// ```
pub fn render_block_list(block_ids: &[String]) -> Result<String> {
    let mut writer = new_document()?;
    writer
        .write_event(Event::Start(BytesStart::new("BlockList")))
        .map_err(xml_error)?;
    for id in block_ids {
        write_text_element(&mut writer, "Latest", id)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("BlockList")))
        .map_err(xml_error)?;
    finish(writer)
}

/// Render a Put Message body.
pub fn render_queue_message(text: &str) -> Result<String> {
    let mut writer = new_document()?;
    writer
        .write_event(Event::Start(BytesStart::new("QueueMessage")))
        .map_err(xml_error)?;
    write_text_element(&mut writer, "MessageText", text)?;
    writer
        .write_event(Event::End(BytesEnd::new("QueueMessage")))
        .map_err(xml_error)?;
    finish(writer)
}

// -- Response parsing ---------------------------------------------------------

/// `<Error><Code>..</Code><Message>..</Message></Error>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Parse a service `<Error>` document. Returns `None` for bodies that are
/// not one.
pub fn parse_error(body: &[u8]) -> Option<ErrorBody> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut out = ErrorBody::default();
    let mut in_error = false;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "Error" {
                    in_error = true;
                }
            }
            Ok(Event::End(_)) => current_tag.clear(),
            Ok(Event::Text(ref e)) if in_error => {
                let text = e.unescape().unwrap_or_default().to_string();
                match current_tag.as_str() {
                    "Code" => out.code = Some(text),
                    "Message" => out.message = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    in_error.then_some(out)
}

/// One `<Blob>` entry of a List Blobs page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobItem {
    pub name: String,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
}

/// One page of List Blobs results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBlobsPage {
    pub blobs: Vec<BlobItem>,
    /// Marker for the next page; `None` on the last page.
    pub next_marker: Option<String>,
}

pub fn parse_list_blobs(body: &[u8]) -> Result<ListBlobsPage> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut page = ListBlobsPage::default();
    let mut current: Option<BlobItem> = None;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "Blob" {
                    current = Some(BlobItem::default());
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Blob" {
                    if let Some(item) = current.take() {
                        page.blobs.push(item);
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(xml_error)?.to_string();
                match (current.as_mut(), current_tag.as_str()) {
                    (Some(item), "Name") => item.name = text,
                    (Some(item), "Content-Length") => item.content_length = text.parse().ok(),
                    (Some(item), "Etag") => item.etag = Some(text),
                    (None, "NextMarker") if !text.is_empty() => page.next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_list_xml_format() {
        let ids = vec!["YmxrLTAwMDAwMA==".to_string(), "YmxrLTAwMDAwMQ==".to_string()];
        let xml = render_block_list(&ids).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains(
            "<BlockList><Latest>YmxrLTAwMDAwMA==</Latest><Latest>YmxrLTAwMDAwMQ==</Latest></BlockList>"
        ));
    }

    #[test]
    fn test_queue_message_escaped() {
        let xml = render_queue_message("a < b & c").unwrap();
        assert!(xml.contains("<MessageText>a &lt; b &amp; c</MessageText>"));
    }

    #[test]
    fn test_parse_error_body() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<Error><Code>ContainerAlreadyExists</Code><Message>The specified container already exists.
RequestId:abc</Message></Error>"#;
        let err = parse_error(body).unwrap();
        assert_eq!(err.code.as_deref(), Some("ContainerAlreadyExists"));
        assert!(err.message.unwrap().starts_with("The specified container"));
    }

    #[test]
    fn test_parse_error_rejects_other_documents() {
        assert_eq!(parse_error(b"<EnumerationResults/>"), None);
        assert_eq!(parse_error(b"{\"error\":{}}"), None);
    }

    #[test]
    fn test_parse_list_blobs_page() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="photos">
  <Blobs>
    <Blob><Name>a.jpg</Name><Properties><Content-Length>10</Content-Length><Etag>0x1</Etag></Properties></Blob>
    <Blob><Name>b &amp; c.jpg</Name><Properties><Content-Length>20</Content-Length></Properties></Blob>
  </Blobs>
  <NextMarker>2!b</NextMarker>
</EnumerationResults>"#;
        let page = parse_list_blobs(body).unwrap();
        assert_eq!(page.blobs.len(), 2);
        assert_eq!(page.blobs[0].name, "a.jpg");
        assert_eq!(page.blobs[0].content_length, Some(10));
        assert_eq!(page.blobs[0].etag.as_deref(), Some("0x1"));
        assert_eq!(page.blobs[1].name, "b & c.jpg");
        assert_eq!(page.next_marker.as_deref(), Some("2!b"));
    }

    #[test]
    fn test_parse_list_blobs_last_page() {
        let body = b"<EnumerationResults><Blobs></Blobs><NextMarker /></EnumerationResults>";
        let page = parse_list_blobs(body).unwrap();
        assert!(page.blobs.is_empty());
        assert_eq!(page.next_marker, None);
    }
}
