//! Doc-type classification and synchronous tier-1 metadata extraction.
//!
//! Classification resolves in a fixed order: an explicit item field wins,
//! then URL hints, then content patterns, then the source extension, and
//! finally the `text` default. Tier-1 extraction is pure and cheap — counts
//! and header-level heuristics only; anything needing a model is tier-2/3
//! work for the enrichment queue.

use serde_json::{json, Value};

use crate::models::DocType;

/// Extensions that map straight to [`DocType::Code`].
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "go", "py", "js", "ts", "tsx", "jsx", "java", "kt", "c", "h", "cpp", "hpp", "cs", "rb",
    "php", "swift", "scala", "sh", "bash", "zsh", "sql", "lua", "pl", "ex", "exs", "hs", "clj",
    "ml", "zig", "toml", "yaml", "yml", "json",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff", "svg"];

/// Classify content. `explicit` is the caller-supplied item field; `source`
/// is the URL or path; `mime_type` comes from fetch sniffing when the item
/// was a URL.
pub fn classify(
    explicit: Option<&str>,
    source: &str,
    mime_type: Option<&str>,
    text: &str,
) -> DocType {
    if let Some(dt) = explicit.and_then(DocType::parse) {
        return dt;
    }

    if let Some(dt) = classify_by_url(source) {
        return dt;
    }

    if let Some(dt) = classify_by_content(mime_type, text) {
        return dt;
    }

    if let Some(dt) = classify_by_extension(source) {
        return dt;
    }

    DocType::Text
}

fn classify_by_url(source: &str) -> Option<DocType> {
    let lower = source.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return None;
    }
    // Path only; query strings routinely embed unrelated filenames.
    let path = lower
        .splitn(4, '/')
        .nth(3)
        .map(|p| p.split(['?', '#']).next().unwrap_or(p))
        .unwrap_or("");

    if lower.contains("github.com") && path.contains("/blob/") {
        return Some(DocType::Code);
    }
    if lower.contains("slack.com") || path.contains("/archives/") {
        return Some(DocType::Slack);
    }
    if path.ends_with(".pdf") {
        return Some(DocType::Pdf);
    }
    if IMAGE_EXTENSIONS.iter().any(|e| path.ends_with(&format!(".{}", e))) {
        return Some(DocType::Image);
    }
    None
}

fn classify_by_content(mime_type: Option<&str>, text: &str) -> Option<DocType> {
    if let Some(mime) = mime_type {
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        match mime {
            "application/pdf" => return Some(DocType::Pdf),
            "text/html" => return Some(DocType::Article),
            m if m.starts_with("image/") => return Some(DocType::Image),
            _ => {}
        }
    }

    let head = text.get(..512.min(text.len())).unwrap_or(text);
    if head.starts_with("%PDF-") {
        return Some(DocType::Pdf);
    }
    if looks_like_email(head) {
        return Some(DocType::Email);
    }
    None
}

fn classify_by_extension(source: &str) -> Option<DocType> {
    let ext = source
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())?;
    if CODE_EXTENSIONS.contains(&ext.as_str()) {
        return Some(DocType::Code);
    }
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Some(DocType::Image);
    }
    match ext.as_str() {
        "pdf" => Some(DocType::Pdf),
        "eml" => Some(DocType::Email),
        "md" | "markdown" | "rst" | "html" | "htm" => Some(DocType::Article),
        _ => None,
    }
}

/// RFC-2822-ish: at least two of the canonical headers in the first lines.
fn looks_like_email(head: &str) -> bool {
    let mut hits = 0;
    for line in head.lines().take(12) {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("from:")
            || lower.starts_with("to:")
            || lower.starts_with("subject:")
            || lower.starts_with("date:")
        {
            hits += 1;
        }
    }
    hits >= 2
}

/// Extract tier-1 metadata for a document. Always includes the counting
/// trio; per-type fields are layered on top.
pub fn tier1_metadata(doc_type: DocType, text: &str, source: &str) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("charCount".into(), json!(text.chars().count()));
    obj.insert("wordCount".into(), json!(text.split_whitespace().count()));
    obj.insert("lineCount".into(), json!(text.lines().count()));

    match doc_type {
        DocType::Code => {
            if let Some(lang) = code_lang(source) {
                obj.insert("lang".into(), json!(lang));
            }
        }
        DocType::Article | DocType::Text => {
            if let Some(title) = extract_title(text) {
                obj.insert("title".into(), json!(title));
            }
            let headings: Vec<&str> = text
                .lines()
                .filter(|l| l.starts_with('#'))
                .map(|l| l.trim_start_matches('#').trim())
                .filter(|h| !h.is_empty())
                .take(20)
                .collect();
            if !headings.is_empty() {
                obj.insert("headings".into(), json!(headings));
            }
        }
        DocType::Email => {
            for (field, key) in [
                ("from:", "from"),
                ("to:", "to"),
                ("subject:", "subject"),
                ("date:", "date"),
            ] {
                if let Some(v) = header_value(text, field) {
                    obj.insert(key.into(), json!(v));
                }
            }
        }
        DocType::Slack | DocType::Meeting => {
            let speakers = speaker_names(text);
            if !speakers.is_empty() {
                obj.insert("participants".into(), json!(speakers));
            }
        }
        DocType::Pdf | DocType::Image => {}
    }

    Value::Object(obj)
}

/// Map a source extension to a language tag for code chunks.
pub fn code_lang(source: &str) -> Option<&'static str> {
    let ext = source.rsplit('.').next()?.to_ascii_lowercase();
    let lang = match ext.as_str() {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "lua" => "lua",
        "ex" | "exs" => "elixir",
        "hs" => "haskell",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        _ => return None,
    };
    Some(lang)
}

/// First markdown heading, else the first non-empty line (truncated).
fn extract_title(text: &str) -> Option<String> {
    for line in text.lines().take(20) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let title = trimmed.trim_start_matches('#').trim();
        if title.is_empty() {
            continue;
        }
        return Some(title.chars().take(120).collect());
    }
    None
}

fn header_value(text: &str, header: &str) -> Option<String> {
    for line in text.lines().take(30) {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with(header) {
            return Some(line[header.len()..].trim().to_string());
        }
    }
    None
}

/// `Name:` prefixes at line starts, deduplicated in first-seen order.
fn speaker_names(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for line in text.lines().take(500) {
        if let Some((name, _)) = line.split_once(':') {
            let name = name.trim();
            if name.is_empty()
                || name.len() > 40
                || name.split(' ').count() > 3
                || !name.chars().next().is_some_and(|c| c.is_alphabetic())
            {
                continue;
            }
            if !seen.iter().any(|s| s == name) {
                seen.push(name.to_string());
            }
        }
        if seen.len() >= 25 {
            break;
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_wins() {
        assert_eq!(
            classify(Some("code"), "notes.md", None, "# heading"),
            DocType::Code
        );
    }

    #[test]
    fn url_hints() {
        assert_eq!(
            classify(None, "https://github.com/acme/repo/blob/main/src/lib.rs", None, ""),
            DocType::Code
        );
        assert_eq!(
            classify(None, "https://example.com/reports/q3.pdf", None, ""),
            DocType::Pdf
        );
        assert_eq!(
            classify(None, "https://acme.slack.com/archives/C01/p1", None, ""),
            DocType::Slack
        );
    }

    #[test]
    fn content_patterns() {
        assert_eq!(
            classify(None, "payload.bin", None, "%PDF-1.7 stream"),
            DocType::Pdf
        );
        let mail = "From: a@example.com\nTo: b@example.com\nSubject: hi\n\nBody";
        assert_eq!(classify(None, "message", None, mail), DocType::Email);
        assert_eq!(
            classify(None, "https://example.com/page", Some("text/html"), "<html>"),
            DocType::Article
        );
    }

    #[test]
    fn extension_fallback_then_text() {
        assert_eq!(classify(None, "src/main.rs", None, "fn main() {}"), DocType::Code);
        assert_eq!(classify(None, "README.md", None, "hello"), DocType::Article);
        assert_eq!(classify(None, "notes", None, "plain words"), DocType::Text);
    }

    #[test]
    fn tier1_counts_always_present() {
        let meta = tier1_metadata(DocType::Text, "one two\nthree", "x.txt");
        assert_eq!(meta["wordCount"], 3);
        assert_eq!(meta["lineCount"], 2);
        assert_eq!(meta["charCount"], 13);
    }

    #[test]
    fn tier1_code_lang() {
        let meta = tier1_metadata(DocType::Code, "fn main() {}", "src/main.rs");
        assert_eq!(meta["lang"], "rust");
    }

    #[test]
    fn tier1_email_headers() {
        let mail = "From: Ada <ada@example.com>\nTo: Bob\nSubject: Engines\nDate: Tue\n\nBody";
        let meta = tier1_metadata(DocType::Email, mail, "m.eml");
        assert_eq!(meta["from"], "Ada <ada@example.com>");
        assert_eq!(meta["subject"], "Engines");
    }

    #[test]
    fn tier1_article_title_and_headings() {
        let text = "# Release Notes\n\nIntro.\n\n## Fixes\n\n## Features";
        let meta = tier1_metadata(DocType::Article, text, "notes.md");
        assert_eq!(meta["title"], "Release Notes");
        assert_eq!(meta["headings"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn tier1_meeting_participants() {
        let text = "Ada: hello everyone\nBob: hi\nAda: let's begin";
        let meta = tier1_metadata(DocType::Meeting, text, "standup.txt");
        let parts = meta["participants"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
    }
}
