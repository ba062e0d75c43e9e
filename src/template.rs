use serde::{Deserialize, Serialize};

use crate::recipient::Recipient;

/// Greeting used for `{name}` when a recipient has no display name.
pub const DEFAULT_NAME: &str = "there";

/// Subject and body with `{placeholder}` fields filled per recipient.
///
/// Known placeholders are `{name}`, `{email}` and any extra field of the
/// recipient (`{city}`, `{category}`, ...). Anything else is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

impl MessageTemplate {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn render(&self, recipient: &Recipient, default_name: &str) -> RenderedMessage {
        RenderedMessage {
            subject: fill(&self.subject, recipient, default_name),
            body: fill(&self.body, recipient, default_name),
        }
    }
}

fn fill(text: &str, recipient: &Recipient, default_name: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(first) = rest.find('{') {
        let Some(close) = rest[first..].find('}').map(|c| first + c) else {
            break;
        };
        // innermost `{` before the closing brace, so `{a{name}}` still fills `{name}`
        let open = rest[first..close].rfind('{').map_or(first, |i| first + i);

        out.push_str(&rest[..open]);
        let key = &rest[open + 1..close];
        match lookup(key, recipient, default_name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }

    out.push_str(rest);
    out
}

fn lookup<'a>(key: &str, recipient: &'a Recipient, default_name: &'a str) -> Option<&'a str> {
    match key.trim() {
        "name" => Some(recipient.name.as_deref().unwrap_or(default_name)),
        "email" => Some(recipient.email.as_str()),
        other => recipient.extra.get(&other.to_lowercase()).map(String::as_str),
    }
}
