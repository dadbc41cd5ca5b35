//! Text handling at trust boundaries.
//!
//! Anything sourced from the tracker or produced by an agent is wrapped in a
//! delimiter tag before it is embedded into a later prompt, and neutralised
//! before it is embedded into a tracker comment.

/// Tag used around agent output that feeds a follow-up prompt.
pub const UNTRUSTED_TAG: &str = "untrusted-output";
/// Tag used around tracker-sourced item text.
pub const ITEM_TAG: &str = "work-item";

/// Wrap `text` in `<tag>...</tag>`, defusing any copy of the tag inside it.
pub fn wrap_untrusted(tag: &str, text: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    let defused = text
        .replace(&close, &format!("<\\/{tag}"))
        .replace(&open, &format!("<\\{tag}"));
    format!("<{tag}>\n{}\n</{tag}>", defused.trim_end())
}

/// Break up code fences so pasted output cannot close the comment's own fence.
pub fn neutralize_fences(text: &str) -> String {
    text.replace("```", "'''").replace("~~~", "'''")
}

/// Truncate to at most `max_chars` characters; a cut ends in an ellipsis
/// that counts toward the limit.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('\u{2026}');
    out
}

/// Keep the last `max_chars` characters (leading ellipsis included), where
/// failure diagnostics usually live.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let mut out = String::from("\u{2026}");
    out.extend(text.chars().skip(total - max_chars.saturating_sub(1)));
    out
}
