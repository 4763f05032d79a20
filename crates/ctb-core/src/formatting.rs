//! XML message templating for agent prompts, and outbound-text sanitizing.

use regex::Regex;

use crate::domain::Message;

/// Escape XML special characters.
pub fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Render a batch of messages as the `<messages>` XML block piped to an
/// agent's stdin.
pub fn render_messages_xml(messages: &[Message]) -> String {
    let mut out = String::from("<messages>\n");
    for m in messages {
        let sender_name = m.sender_name.as_deref().unwrap_or(&m.sender);
        out.push_str(&format!(
            "  <message from=\"{}\" ts=\"{}\">\n    <content>{}</content>\n  </message>\n",
            escape_xml(sender_name),
            m.timestamp.to_rfc3339(),
            escape_xml(&m.content),
        ));
    }
    out.push_str("</messages>\n");
    out
}

/// Strip `<internal>...</internal>` blocks from agent output before it is
/// sent to a channel. Internal blocks are for operator/debug visibility only
/// and must never reach end users.
pub fn strip_internal_blocks(text: &str) -> String {
    static_internal_re()
        .replace_all(text, "")
        .trim()
        .to_string()
}

fn static_internal_re() -> Regex {
    Regex::new(r"(?is)<internal>.*?</internal>").expect("valid regex")
}
