use std::collections::BTreeMap;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::storage::FeedRegistration;
use crate::util::validate_url;

/// Maximum allowed nesting depth for OPML outline elements. Prevents stack
/// abuse from maliciously crafted deeply nested documents.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse an OPML file into feed registrations.
///
/// Every `<outline>` carrying an `xmlUrl` attribute becomes a registration,
/// regardless of nesting. The `category` attribute is split on commas into
/// tags, and the text of enclosing folder outlines contributes a tag as well,
/// since that is how most reader exports encode their grouping. `htmlUrl`
/// lands in the registration's extra map.
///
/// Outlines with invalid URLs (non-HTTP schemes, localhost, private IP
/// ranges) are skipped with a warning rather than failing the import.
///
/// XXE is structurally mitigated: quick-xml does not parse `<!ENTITY>`
/// declarations, and `decode_and_unescape_value()` resolves only the five
/// XML builtins.
pub async fn parse(path: &str) -> Result<Vec<FeedRegistration>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    parse_opml_content(&content)
}

fn parse_opml_content(content: &str) -> Result<Vec<FeedRegistration>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut registrations = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    // One slot per open outline: Some(title) for folder outlines, None for
    // feed outlines that happen to have children
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }

                match parse_outline_attributes(&e, &reader, &folders)? {
                    Some(registration) => {
                        registrations.push(registration);
                        folders.push(None);
                    }
                    None => {
                        folders.push(outline_text(&e, &reader)?);
                    }
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                if let Some(registration) = parse_outline_attributes(&e, &reader, &folders)? {
                    registrations.push(registration);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
                folders.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(registrations)
}

/// The display text of a folder outline, used as a tag for feeds inside it.
fn outline_text(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<String>> {
    let decoder = reader.decoder();
    let mut text = None;
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(_) => continue,
        };
        match attr.key.as_ref() {
            b"title" => return Ok(Some(attr.decode_and_unescape_value(decoder)?.to_string())),
            b"text" => text = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            _ => {}
        }
    }
    Ok(text)
}

/// Extracts a feed registration from an outline element.
///
/// Returns `None` for category/folder outlines without an `xmlUrl`.
fn parse_outline_attributes(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
    folders: &[Option<String>],
) -> Result<Option<FeedRegistration>> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;
    let mut category = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"htmlUrl" => {
                let url_str = attr.decode_and_unescape_value(decoder)?;
                match validate_url(&url_str) {
                    Ok(_) => html_url = Some(url_str.to_string()),
                    Err(e) => {
                        tracing::warn!(url = %url_str, error = %e, "Ignoring invalid htmlUrl in OPML");
                    }
                }
            }
            b"title" => title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => {
                if title.is_none() {
                    title = Some(attr.decode_and_unescape_value(decoder)?.to_string())
                }
            }
            b"category" => category = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            _ => {}
        }
    }

    let Some(url) = xml_url else {
        return Ok(None);
    };

    if let Err(e) = validate_url(&url) {
        tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
        return Ok(None);
    }

    let mut tags: Vec<String> = category
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(folder) = folders.iter().rev().flatten().next() {
        if !tags.iter().any(|t| t == folder) {
            tags.push(folder.clone());
        }
    }

    let mut extra = BTreeMap::new();
    if let Some(html_url) = html_url {
        extra.insert("htmlurl".to_string(), html_url);
    }

    Ok(Some(FeedRegistration {
        url,
        title,
        tags,
        extra,
    }))
}

/// Exports feed registrations as an OPML 2.0 XML string.
pub fn export_opml(feeds: &[FeedRegistration]) -> Result<String> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
    use quick_xml::Writer;
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(quick_xml::events::BytesText::new(
            "weir feed subscriptions",
        )))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for feed in feeds {
        let text = feed.title.as_deref().unwrap_or(feed.url.as_str());
        let category = feed.tags.join(",");
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", text));
        outline.push_attribute(("title", text));
        outline.push_attribute(("xmlUrl", feed.url.as_str()));
        if !feed.tags.is_empty() {
            outline.push_attribute(("category", category.as_str()));
        }
        if let Some(html_url) = feed.extra.get("htmlurl") {
            outline.push_attribute(("htmlUrl", html_url.as_str()));
        }
        writer
            .write_event(Event::Empty(outline))
            .context("Failed to write outline element")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;

    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

/// Exports feed registrations to an OPML file atomically.
///
/// Writes to a randomized temporary file in the same directory, syncs, then
/// renames over the destination so it is never left in a partial state.
pub fn export_to_file(feeds: &[FeedRegistration], path: &std::path::Path) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(feeds)?;

    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                temp_path.display()
            )
        })?;

    std::io::Write::write_all(&mut file, content.as_bytes()).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to write OPML to temporary file '{}'",
            temp_path.display()
        )
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to sync temporary file '{}' to disk",
            temp_path.display()
        )
    })?;

    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
