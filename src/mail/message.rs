//! Inbound message as handed to a consumer.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;

use super::MessageRef;

/// A fetched message with its headers parsed.
///
/// Messages that fail to parse are still delivered; only `raw` and
/// `reference` are guaranteed.
#[derive(Debug, Clone)]
pub struct InboundMail {
    pub reference: MessageRef,
    pub raw: Vec<u8>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
}

impl InboundMail {
    pub fn parse(reference: MessageRef, raw: Vec<u8>) -> Self {
        let Some(parsed) = MessageParser::default().parse(raw.as_slice()) else {
            return Self {
                message_id: reference.message_id.clone(),
                reference,
                raw,
                subject: None,
                from: None,
                date: None,
                text: None,
            };
        };

        let message_id = parsed
            .message_id()
            .map(|s| s.to_string())
            .or_else(|| reference.message_id.clone());
        let subject = parsed.subject().map(|s| s.to_string());
        let from = extract_sender(&parsed);
        let date = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
        let text = extract_text(&parsed);

        Self {
            reference,
            raw,
            message_id,
            subject,
            from,
            date,
            text,
        }
    }

    /// Best identifier for logs.
    pub fn display_id(&self) -> String {
        self.message_id
            .clone()
            .or_else(|| self.reference.uid.clone())
            .unwrap_or_else(|| format!("#{}", self.reference.seq))
    }
}

fn extract_sender(parsed: &mail_parser::Message) -> Option<String> {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
}

fn extract_text(parsed: &mail_parser::Message) -> Option<String> {
    if let Some(text) = parsed.body_text(0) {
        return Some(text.to_string());
    }
    parsed.body_html(0).map(|html| strip_html(html.as_ref()))
}

/// Reduce an HTML body to plain text.
///
/// Block-level tags become word breaks and common entities are decoded.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;

    for ch in html.chars() {
        match (in_tag, ch) {
            (false, '<') => {
                in_tag = true;
                tag.clear();
            }
            (true, '>') => {
                in_tag = false;
                if is_block_tag(&tag) {
                    text.push(' ');
                }
            }
            (true, c) => tag.push(c),
            (false, c) => text.push(c),
        }
    }

    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_block_tag(tag: &str) -> bool {
    let name = tag
        .trim_start_matches('/')
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(
        name.as_str(),
        "br" | "p" | "div" | "li" | "tr" | "td" | "th" | "blockquote"
            | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
    )
}

// `&amp;` goes last so "&amp;lt;" stays "&lt;".
fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
