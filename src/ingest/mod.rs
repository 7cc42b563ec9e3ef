//! Markdown slicing: turns a raw blob into an ordered chain of sections.
//!
//! The slicer tracks code-fence state so headings inside fenced blocks never
//! split a step. A document without an H1 or without any H2 collapses into a
//! single-step fallback carrying the whole blob.

pub mod proof_spec;

use std::borrow::Cow;

/// Maximum label length in characters.
pub const MAX_LABEL_LEN: usize = 120;
/// Maximum number of derived tags per step.
pub const MAX_TAGS: usize = 8;

/// One ordered section of a sliced document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub label: String,
    pub body: String,
}

/// Result of slicing a markdown blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicedDoc {
    /// H1-derived chain label; `None` for the single-step fallback.
    pub chain_label: Option<String>,
    pub sections: Vec<Section>,
}

impl SlicedDoc {
    pub fn is_single_step(&self) -> bool {
        self.chain_label.is_none()
    }
}

/// Undo one layer of JSON string quoting if the blob is a JSON string
/// literal; otherwise pass through unchanged.
pub fn normalize_blob(blob: &str) -> Cow<'_, str> {
    let trimmed = blob.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        if let Ok(decoded) = serde_json::from_str::<String>(trimmed) {
            return Cow::Owned(decoded);
        }
    }
    Cow::Borrowed(blob)
}

/// Slice a markdown blob into a chain of sections.
pub fn slice(blob: &str) -> SlicedDoc {
    let text = normalize_blob(blob);

    let mut in_fence = false;
    let mut h1: Option<String> = None;
    // (heading, body-lines) per H2, in document order.
    let mut h2s: Vec<(String, Vec<String>)> = Vec::new();

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            if let Some((_, body)) = h2s.last_mut() {
                body.push(line.to_string());
            }
            continue;
        }
        if in_fence {
            if let Some((_, body)) = h2s.last_mut() {
                body.push(line.to_string());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("## ") {
            h2s.push((rest.trim().to_string(), Vec::new()));
            continue;
        }
        if h1.is_none() {
            if let Some(rest) = line.strip_prefix("# ") {
                h1 = Some(rest.trim().to_string());
                continue;
            }
        }
        if let Some((_, body)) = h2s.last_mut() {
            body.push(line.to_string());
        }
    }

    let (Some(h1), false) = (h1, h2s.is_empty()) else {
        let label = derive_label(&text);
        return SlicedDoc {
            chain_label: None,
            sections: vec![Section {
                label,
                body: text.trim().to_string(),
            }],
        };
    };

    // An H1 of the form "Chain: Suffix" keeps the prefix as the chain label
    // and folds the suffix into the step-1 label.
    let (chain_label, step1_prefix) = match h1.split_once(':') {
        Some((prefix, suffix)) if !prefix.trim().is_empty() && !suffix.trim().is_empty() => {
            (prefix.trim().to_string(), Some(suffix.trim().to_string()))
        }
        _ => (h1.clone(), None),
    };

    let sections = h2s
        .into_iter()
        .enumerate()
        .map(|(i, (heading, body))| {
            let label = match (&step1_prefix, i) {
                (Some(prefix), 0) => truncate_label(&format!("{prefix}: {heading}")),
                _ => truncate_label(&heading),
            };
            Section {
                label,
                body: body.join("\n").trim().to_string(),
            }
        })
        .collect();

    SlicedDoc {
        chain_label: Some(chain_label),
        sections,
    }
}

/// First markdown heading, else first non-empty line, else `"Memory"`.
pub fn derive_label(text: &str) -> String {
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let label = trimmed.trim_start_matches('#').trim();
        if label.is_empty() {
            continue;
        }
        return truncate_label(label);
    }
    "Memory".to_string()
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() <= MAX_LABEL_LEN {
        label.to_string()
    } else {
        label.chars().take(MAX_LABEL_LEN).collect()
    }
}

/// Short lowercase tokens from the label plus bullet-line leaders, capped at
/// [`MAX_TAGS`].
pub fn derive_tags(label: &str, body: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    for word in label
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .take(6)
    {
        push_tag(&mut tags, word);
    }

    for line in body.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        else {
            continue;
        };
        for word in rest
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .take(2)
        {
            push_tag(&mut tags, word);
        }
        if tags.len() >= MAX_TAGS {
            break;
        }
    }

    tags.truncate(MAX_TAGS);
    tags
}

fn push_tag(tags: &mut Vec<String>, word: &str) {
    let tag = word.to_lowercase();
    if !tags.contains(&tag) && tags.len() < MAX_TAGS {
        tags.push(tag);
    }
}
