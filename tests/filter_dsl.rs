//! Filter compiler battery, driven through the public API.
//!
//! The compiler is the highest-impact correctness boundary in the service:
//! every externally supplied identifier must resolve through the closed
//! allow-list and every value must leave as a positional parameter. These
//! tests exercise the compiled fragments exactly as the query layer
//! consumes them, including placeholder offsets against a base query.

use serde_json::{json, Value};

use raged::error::Error;
use raged::filter::{compile, CompiledFilter};

fn compile_ok(filter: Value, offset: usize) -> CompiledFilter {
    compile(&filter, offset).expect("filter should compile")
}

fn compile_err(filter: Value) -> Error {
    compile(&filter, 0).expect_err("filter should be rejected")
}

#[test]
fn or_combination_of_two_chunk_fields() {
    let compiled = compile_ok(
        json!({
            "conditions": [
                {"field": "docType", "op": "eq", "value": "code"},
                {"field": "lang", "op": "eq", "value": "ts"}
            ],
            "combine": "or"
        }),
        0,
    );
    assert_eq!(compiled.sql, " AND (c.doc_type = $1 OR c.lang = $2)");
    assert_eq!(compiled.params, vec![json!("code"), json!("ts")]);
}

#[test]
fn path_prefix_semantics() {
    let compiled = compile_ok(
        json!({"conditions": [{"field": "path", "op": "eq", "value": "src/"}]}),
        0,
    );
    assert_eq!(compiled.sql, " AND c.path LIKE $1 || '%'");
}

#[test]
fn offsets_follow_base_query_parameters() {
    // A semantic query binds $1 (vector) and $2 (collection) first.
    let compiled = compile_ok(
        json!({
            "conditions": [
                {"field": "docType", "op": "eq", "value": "article"},
                {"field": "createdAt", "op": "gte", "value": "2026-06-01T00:00:00Z"}
            ]
        }),
        2,
    );
    assert_eq!(
        compiled.sql,
        " AND (c.doc_type = $3 AND c.created_at >= $4::timestamptz)"
    );
    assert_eq!(compiled.params.len(), 2);
}

#[test]
fn every_operator_compiles_on_an_ordered_field() {
    for (op, arg_key, arg) in [
        ("eq", "value", json!(3)),
        ("ne", "value", json!(3)),
        ("gt", "value", json!(3)),
        ("gte", "value", json!(3)),
        ("lt", "value", json!(3)),
        ("lte", "value", json!(3)),
        ("in", "values", json!([1, 2])),
        ("notIn", "values", json!([1, 2])),
        ("between", "range", json!([1, 5])),
        ("notBetween", "range", json!([1, 5])),
    ] {
        let filter = json!({
            "conditions": [{"field": "chunkIndex", "op": op, arg_key: arg}]
        });
        let compiled = compile(&filter, 0)
            .unwrap_or_else(|e| panic!("operator {} failed: {}", op, e));
        assert!(compiled.sql.starts_with(" AND "), "op {}", op);
        assert!(!compiled.params.is_empty(), "op {}", op);
    }

    for op in ["isNull", "isNotNull"] {
        let filter = json!({"conditions": [{"field": "lang", "op": op}]});
        let compiled = compile(&filter, 0).unwrap();
        assert!(compiled.params.is_empty(), "op {} must bind nothing", op);
    }
}

#[test]
fn rejections_are_typed_validation_errors() {
    let cases = vec![
        // Unknown field.
        json!({"conditions": [{"field": "embedding", "op": "eq", "value": "x"}]}),
        // Disallowed operator on a text field.
        json!({"conditions": [{"field": "source", "op": "between", "range": ["a", "b"]}]}),
        // Wrong alias.
        json!({"conditions": [{"field": "lang", "op": "eq", "value": "rust", "alias": "d"}]}),
        // Empty in-list.
        json!({"conditions": [{"field": "lang", "op": "in", "values": []}]}),
        // Missing between bounds.
        json!({"conditions": [{"field": "chunkIndex", "op": "between"}]}),
        // Invalid combine.
        json!({"conditions": [], "combine": "nand"}),
        // Unknown operator.
        json!({"conditions": [{"field": "lang", "op": "matches", "value": "x"}]}),
        // Mixing DSL and legacy shapes.
        json!({"conditions": [], "must": []}),
    ];

    for case in cases {
        let err = compile_err(case.clone());
        assert!(
            matches!(err, Error::FilterValidation(_)),
            "expected FilterValidation for {}",
            case
        );
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}

#[test]
fn document_fields_bind_to_d_alias() {
    let compiled = compile_ok(
        json!({
            "conditions": [
                {"field": "mimeType", "op": "eq", "value": "text/markdown"},
                {"field": "lastSeen", "op": "lt", "value": "2026-01-01T00:00:00Z"}
            ]
        }),
        0,
    );
    assert_eq!(
        compiled.sql,
        " AND (d.mime_type = $1 AND d.last_seen < $2::timestamptz)"
    );
}

#[test]
fn legacy_shapes_still_compile() {
    let map = compile_ok(json!({"docType": "email"}), 0);
    assert_eq!(map.sql, " AND c.doc_type = $1");

    let boolish = compile_ok(
        json!({
            "must": [{"field": "docType", "op": "eq", "value": "code"}],
            "must_not": [{"field": "path", "op": "eq", "value": "vendor/"}]
        }),
        0,
    );
    assert_eq!(
        boolish.sql,
        " AND (c.doc_type = $1 AND NOT (c.path LIKE $2 || '%'))"
    );
}

#[test]
fn no_caller_text_ever_reaches_the_fragment() {
    // Adversarial values land in params; adversarial field names and
    // operators are rejected outright. Either way, the SQL fragment is
    // built exclusively from allow-list strings.
    let hostile_values = [
        "'; DELETE FROM documents; --",
        "$1; DROP TABLE tasks",
        "\" OR 1=1 --",
        "pg_sleep(10)",
    ];
    for v in hostile_values {
        let compiled = compile_ok(
            json!({"conditions": [{"field": "source", "op": "eq", "value": v}]}),
            0,
        );
        assert_eq!(compiled.sql, " AND c.source = $1");
        assert_eq!(compiled.params, vec![json!(v)]);
    }

    for hostile_field in ["source; --", "c.source", "documents.raw_data"] {
        let err = compile_err(json!({
            "conditions": [{"field": hostile_field, "op": "eq", "value": "x"}]
        }));
        assert!(matches!(err, Error::FilterValidation(_)));
    }
}
