//! Firehose XML framing
//!
//! Commands are single self-closing elements wrapped in a `<data>` document.
//! The device answers with one or more documents back to back, carrying
//! `<log>` lines and finally a `<response>`.

use std::{borrow::Cow, fmt::Display, sync::LazyLock};

use regex::{Captures, Regex};

const XML_DECLARATION: &str = r#"<?xml version="1.0" ?>"#;

static ELEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(response|log)\b((?:[^>"']|"[^"]*"|'[^']*')*)>"#).unwrap()
});
static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]+|#x[0-9A-Fa-f]+|[A-Za-z]+);").unwrap());

/// A Firehose command element
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlCommand {
    tag: &'static str,
    attributes: Vec<(&'static str, String)>,
}

impl XmlCommand {
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute, keeping insertion order
    pub fn attr(mut self, name: &'static str, value: impl Display) -> Self {
        self.attributes.push((name, value.to_string()));
        self
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Serialize to a complete XML document
    pub fn to_xml(&self) -> String {
        let mut xml = format!("{XML_DECLARATION}<data><{}", self.tag);
        for (name, value) in &self.attributes {
            xml.push_str(&format!(" {name}=\"{}\"", escape(value)));
        }
        xml.push_str(" /></data>");
        xml
    }
}

/// The outcome of one XML round trip
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirehoseResponse {
    /// Whether a `<response>` element was received at all
    pub received: bool,
    /// The `value` attribute of the last `<response>`
    pub value: Option<String>,
    /// The `rawmode` attribute of the last `<response>`
    pub raw_mode: Option<bool>,
    /// Values of every `<log>` element, in order
    pub logs: Vec<String>,
    /// Everything that was read
    pub data: Vec<u8>,
}

impl FirehoseResponse {
    pub fn parse(data: Vec<u8>) -> Self {
        let mut response = FirehoseResponse::default();

        let text = String::from_utf8_lossy(&data);
        for element in ELEMENT_RE.captures_iter(&text) {
            let attributes = &element[2];
            match &element[1] {
                "response" => {
                    response.received = true;
                    for (name, value) in parse_attributes(attributes) {
                        match name {
                            "value" => response.value = Some(value),
                            "rawmode" => response.raw_mode = Some(value == "true"),
                            _ => {}
                        }
                    }
                }
                _ => {
                    if let Some((_, value)) =
                        parse_attributes(attributes).find(|(name, _)| *name == "value")
                    {
                        response.logs.push(value);
                    }
                }
            }
        }

        response.data = data;
        response
    }

    /// True unless the device answered with something other than `ACK`/`true`
    pub fn ack(&self) -> bool {
        match self.value.as_deref() {
            None => true,
            Some(value) => value == "ACK" || value == "true",
        }
    }

    /// A response was received and it acknowledged the command
    pub fn is_ack(&self) -> bool {
        self.received && self.ack()
    }

    /// The last log line, which is where loaders put their error messages
    pub fn error_text(&self) -> Option<&str> {
        self.logs.last().map(String::as_str)
    }
}

fn parse_attributes(element: &str) -> impl Iterator<Item = (&str, String)> {
    ATTRIBUTE_RE.captures_iter(element).filter_map(|caps| {
        let name = caps.get(1)?.as_str();
        let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
        Some((name, unescape(value).into_owned()))
    })
}

fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }

    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

fn unescape(value: &str) -> Cow<'_, str> {
    ENTITY_RE.replace_all(value, |caps: &Captures<'_>| {
        let entity = &caps[1];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .or_else(|| entity.strip_prefix('#').map(|dec| dec.parse::<u32>()))
                .and_then(Result::ok)
                .and_then(char::from_u32),
        };
        decoded.map_or_else(|| caps[0].to_owned(), String::from)
    })
}
