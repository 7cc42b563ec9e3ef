//! Rendering steps back to markdown, and the BODY markers that make a
//! rendered step safe to edit and re-submit through update.

/// Marks the beginning of an editable step body in a rendered document.
pub const BODY_START: &str = "<!-- KAIROS:BODY-START -->";
/// Marks the end of an editable step body.
pub const BODY_END: &str = "<!-- KAIROS:BODY-END -->";

/// The markdown between the BODY markers when both are present, else the
/// raw input. Always trimmed.
pub fn extract_body(text: &str) -> &str {
    if let Some(start) = text.find(BODY_START) {
        let after = &text[start + BODY_START.len()..];
        if let Some(end) = after.find(BODY_END) {
            return after[..end].trim();
        }
    }
    text.trim()
}

/// A single step rendered for editing: heading plus marker-wrapped body.
pub fn render_step(label: &str, body: &str) -> String {
    format!("## {label}\n\n{BODY_START}\n{body}\n{BODY_END}\n")
}

/// A full chain rendered as clean markdown, suitable for re-minting.
pub fn render_protocol(chain_label: &str, steps: &[(String, String)]) -> String {
    let mut doc = format!("# {chain_label}\n");
    for (label, body) in steps {
        doc.push_str(&format!("\n## {label}\n{body}\n"));
    }
    doc
}
