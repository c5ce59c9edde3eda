use std::collections::HashSet;

use ego_tree::NodeRef;
use scraper::node::Node;
use scraper::Html;
use url::Url;

/// Tags kept by the default policy. Everything structural a reader needs,
/// nothing that executes or embeds.
pub const DEFAULT_ALLOWED_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "em", "strong", "a", "img",
    "blockquote", "code", "pre", "br",
];

/// Subtrees removed entirely, children included. Unwrapping these would leak
/// script bodies and embed fallbacks into the text.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "object", "embed", "template",
];

/// Tags serialized without a closing tag.
const VOID_TAGS: &[&str] = &["br", "img", "hr"];

/// How aggressively to filter markup. The ingest pipeline always stores
/// `Safe`; `Raw` and `Text` exist for corpus export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeLevel {
    /// Pass markup through untouched
    Raw,
    /// Whitelist filter: the default and the only level the pipeline stores
    Safe,
    /// Strip all markup down to plain text
    Text,
}

/// The allowed-tag whitelist. Attribute rules are fixed: `a[href]` and
/// `img[src, alt]`, with http(s) URLs only.
#[derive(Debug, Clone)]
pub struct SanitizePolicy {
    allowed: HashSet<String>,
}

impl Default for SanitizePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_TAGS.iter().map(|t| t.to_string()))
    }
}

impl SanitizePolicy {
    pub fn new(allowed_tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed_tags
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect(),
        }
    }

    fn is_allowed(&self, tag: &str) -> bool {
        self.allowed.contains(tag)
    }

    fn keep_attr(&self, tag: &str, attr: &str, value: &str) -> bool {
        match (tag, attr) {
            ("a", "href") => is_http_url(value),
            ("img", "src") => is_http_url(value),
            ("img", "alt") => true,
            _ => false,
        }
    }
}

/// Apply a sanitization level to an HTML fragment.
pub fn sanitize(html: &str, policy: &SanitizePolicy, level: SanitizeLevel) -> String {
    match level {
        SanitizeLevel::Raw => html.to_string(),
        SanitizeLevel::Safe => sanitize_fragment(html, policy),
        SanitizeLevel::Text => extract_text(html),
    }
}

/// Whitelist-filter a fragment into well-formed markup.
///
/// Disallowed tags are unwrapped (children kept) so reading flow survives;
/// the tags in [`DROPPED_TAGS`] lose their whole subtree. Output is
/// re-serialized from the parsed DOM with text and attributes escaped, so
/// malformed input cannot smuggle markup through.
pub fn sanitize_fragment(html: &str, policy: &SanitizePolicy) -> String {
    let doc = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    write_children(doc.tree.root(), policy, &mut out);
    out
}

/// Strip a fragment to plain text, dropping script-like subtrees entirely.
pub fn extract_text(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut out = String::new();
    collect_text(doc.tree.root(), &mut out);
    out.trim().to_string()
}

fn write_children(node: NodeRef<'_, Node>, policy: &SanitizePolicy, out: &mut String) {
    for child in node.children() {
        write_node(child, policy, out);
    }
}

fn write_node(node: NodeRef<'_, Node>, policy: &SanitizePolicy, out: &mut String) {
    match node.value() {
        Node::Text(text) => escape_text(text, out),
        Node::Element(element) => {
            let name = element.name();
            if DROPPED_TAGS.contains(&name) {
                return;
            }
            if !policy.is_allowed(name) {
                // Unwrap: keep the children, lose the tag
                write_children(node, policy, out);
                return;
            }

            out.push('<');
            out.push_str(name);
            for (attr, value) in element.attrs() {
                if policy.keep_attr(name, attr, value) {
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    escape_attr(value, out);
                    out.push('"');
                }
            }
            out.push('>');

            if VOID_TAGS.contains(&name) {
                return;
            }
            write_children(node, policy, out);
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        // The fragment root; the synthetic <html> holder is an element and
        // falls out through the unwrap path above.
        Node::Document | Node::Fragment => write_children(node, policy, out),
        // Comments, doctypes, processing instructions
        _ => {}
    }
}

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => {
                if !DROPPED_TAGS.contains(&element.name()) {
                    collect_text(child, out);
                }
            }
            Node::Document | Node::Fragment => collect_text(child, out),
            _ => {}
        }
    }
}

fn is_http_url(value: &str) -> bool {
    match Url::parse(value.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}
