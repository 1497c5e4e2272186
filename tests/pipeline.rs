//! Cross-module pipeline properties that hold without a database: the
//! chunker's invariants feed the chunk-id addressing scheme, doc-type
//! classification feeds tier-1 extraction, and identity keys drive
//! idempotence.

use raged::chunker::chunk_text;
use raged::config::ChunkingConfig;
use raged::doctype;
use raged::ingest::identity_key;
use raged::models::{chunk_id, parse_chunk_id, DocType};

fn window(target: usize, overlap: usize) -> ChunkingConfig {
    ChunkingConfig {
        target_chars: target,
        overlap_chars: overlap,
    }
}

#[test]
fn chunk_indices_form_a_contiguous_prefix() {
    let text = (0..60)
        .map(|i| format!("Paragraph number {} with a little body text.", i))
        .collect::<Vec<_>>()
        .join("\n\n");
    let chunks = chunk_text(&text, &window(200, 30));
    assert!(chunks.len() > 1);

    // Addressing: position in the vector is the chunk index, and every
    // composed id round-trips.
    for (index, _) in chunks.iter().enumerate() {
        let id = chunk_id("kb/doc", index as i32);
        let (base, parsed) = parse_chunk_id(&id).unwrap();
        assert_eq!(base, "kb/doc");
        assert_eq!(parsed, index as i32);
    }
}

#[test]
fn chunking_is_stable_across_runs() {
    let text = std::iter::repeat("Sentence one. Sentence two is longer. Third!")
        .take(50)
        .collect::<Vec<_>>()
        .join("\n\n");
    let a = chunk_text(&text, &window(300, 40));
    let b = chunk_text(&text, &window(300, 40));
    assert_eq!(a, b);
}

#[test]
fn short_ingest_yields_single_chunk_at_index_zero() {
    // Mirrors the canonical scenario: one small item → one chunk, index 0.
    let chunks = chunk_text("hello world", &window(1600, 200));
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0], "hello world");
    assert_eq!(chunk_id("x.txt", 0), "x.txt:0");
}

#[test]
fn classification_chain_resolves_in_order() {
    // Explicit field beats everything.
    assert_eq!(
        doctype::classify(Some("meeting"), "src/lib.rs", None, "fn main() {}"),
        DocType::Meeting
    );
    // URL hint beats content and extension.
    assert_eq!(
        doctype::classify(
            None,
            "https://github.com/acme/api/blob/main/notes.md",
            None,
            "# heading"
        ),
        DocType::Code
    );
    // Content pattern beats extension.
    assert_eq!(
        doctype::classify(None, "scan.txt", None, "%PDF-1.4 binary"),
        DocType::Pdf
    );
    // Extension as the last informative step.
    assert_eq!(
        doctype::classify(None, "module.py", None, "import os"),
        DocType::Code
    );
    // Default.
    assert_eq!(doctype::classify(None, "anything", None, "words"), DocType::Text);
}

#[test]
fn tier1_extraction_matches_classified_type() {
    let mail = "From: ops@example.com\nTo: team@example.com\nSubject: Incident 42\n\nIt's resolved.";
    let dt = doctype::classify(None, "incident-42", None, mail);
    assert_eq!(dt, DocType::Email);

    let meta = doctype::tier1_metadata(dt, mail, "incident-42");
    assert_eq!(meta["subject"], "Incident 42");
    assert!(meta["wordCount"].as_u64().unwrap() > 0);
}

#[test]
fn identity_keys_deduplicate_url_variants() {
    let variants = [
        "https://example.com/kb/page?utm_source=mail",
        "https://example.com/kb/page#section-3",
        "https://example.com/kb/page?a=1&b=2#x",
    ];
    let keys: Vec<String> = variants.iter().map(|v| identity_key(v)).collect();
    assert!(keys.iter().all(|k| k == "https://example.com/kb/page"));

    // Different paths stay distinct.
    assert_ne!(
        identity_key("https://example.com/kb/page"),
        identity_key("https://example.com/kb/other")
    );

    // Non-URL sources are taken verbatim, including colons.
    assert_eq!(identity_key("repo:src/main.rs"), "repo:src/main.rs");
}

#[test]
fn chunk_ids_survive_colon_heavy_base_ids() {
    let base = identity_key("https://example.com:8443/a/b");
    let id = chunk_id(&base, 12);
    let (parsed_base, idx) = parse_chunk_id(&id).unwrap();
    assert_eq!(parsed_base, base);
    assert_eq!(idx, 12);
}
