//! Filter DSL → parameterised SQL compiler.
//!
//! The DSL is a JSON object
//! `{ conditions: [Cond, …], combine: "and" | "or" }` where each condition
//! names a logical field from a closed allow-list, an operator, and its
//! arguments. The compiler never interpolates caller data: field names and
//! operators resolve through [`FIELDS`], and every value becomes a
//! positional placeholder. The emitted fragment has the shape
//! `" AND (<joined>)"` (outer parentheses only for two or more conditions)
//! and is appended to a base query whose parameters already occupy
//! `$1..$offset`.
//!
//! Two legacy shapes are accepted for old callers — a plain
//! `{ field: value }` map (equality, AND) and `{ must: [...], must_not:
//! [...] }` — but mixing either with the `conditions` DSL in one object is
//! rejected.
//!
//! All rejections are [`Error::FilterValidation`], surfaced as HTTP 400.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Supported operators, tagged; one variant per operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    NotBetween,
    IsNull,
    IsNotNull,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::In => "in",
            Op::NotIn => "notIn",
            Op::Between => "between",
            Op::NotBetween => "notBetween",
            Op::IsNull => "isNull",
            Op::IsNotNull => "isNotNull",
        }
    }
}

/// Value kind a physical column accepts; used to validate argument types
/// and to add the cast Postgres needs for non-text parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Int,
    Timestamp,
}

/// One allow-list entry: logical name → (alias, physical column, kind, ops).
struct FieldSpec {
    field: &'static str,
    alias: &'static str,
    column: &'static str,
    kind: Kind,
    ops: &'static [Op],
}

const TEXT_OPS: &[Op] = &[Op::Eq, Op::Ne, Op::In, Op::NotIn, Op::IsNull, Op::IsNotNull];
const ORD_OPS: &[Op] = &[
    Op::Eq,
    Op::Ne,
    Op::Gt,
    Op::Gte,
    Op::Lt,
    Op::Lte,
    Op::In,
    Op::NotIn,
    Op::Between,
    Op::NotBetween,
    Op::IsNull,
    Op::IsNotNull,
];

/// The closed allow-list. Every logical field binds to exactly one alias:
/// `c` for chunk columns, `d` for document columns.
const FIELDS: &[FieldSpec] = &[
    FieldSpec { field: "docType", alias: "c", column: "doc_type", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec { field: "lang", alias: "c", column: "lang", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec { field: "path", alias: "c", column: "path", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec { field: "source", alias: "c", column: "source", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec { field: "repoId", alias: "c", column: "repo_id", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec { field: "repoUrl", alias: "c", column: "repo_url", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec { field: "itemUrl", alias: "c", column: "item_url", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec {
        field: "chunkIndex",
        alias: "c",
        column: "chunk_index",
        kind: Kind::Int,
        ops: ORD_OPS,
    },
    FieldSpec {
        field: "enrichmentStatus",
        alias: "c",
        column: "enrichment_status",
        kind: Kind::Text,
        ops: TEXT_OPS,
    },
    FieldSpec {
        field: "createdAt",
        alias: "c",
        column: "created_at",
        kind: Kind::Timestamp,
        ops: ORD_OPS,
    },
    FieldSpec {
        field: "collection",
        alias: "d",
        column: "collection",
        kind: Kind::Text,
        ops: TEXT_OPS,
    },
    FieldSpec { field: "baseId", alias: "d", column: "base_id", kind: Kind::Text, ops: TEXT_OPS },
    FieldSpec {
        field: "mimeType",
        alias: "d",
        column: "mime_type",
        kind: Kind::Text,
        ops: TEXT_OPS,
    },
    FieldSpec {
        field: "ingestedAt",
        alias: "d",
        column: "ingested_at",
        kind: Kind::Timestamp,
        ops: ORD_OPS,
    },
    FieldSpec {
        field: "updatedAt",
        alias: "d",
        column: "updated_at",
        kind: Kind::Timestamp,
        ops: ORD_OPS,
    },
    FieldSpec {
        field: "lastSeen",
        alias: "d",
        column: "last_seen",
        kind: Kind::Timestamp,
        ops: ORD_OPS,
    },
];

fn lookup(field: &str) -> Result<&'static FieldSpec> {
    FIELDS
        .iter()
        .find(|s| s.field == field)
        .ok_or_else(|| Error::FilterValidation(format!("unknown field '{}'", field)))
}

/// One condition as supplied by the caller.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Cond {
    field: String,
    op: Op,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    values: Option<Vec<Value>>,
    #[serde(default)]
    range: Option<Vec<Value>>,
    #[serde(default)]
    alias: Option<String>,
}

/// Compiler output: the SQL fragment (starting with `" AND "`, or empty when
/// there were no conditions) and the ordered parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<Value>,
}

impl CompiledFilter {
    pub fn empty() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }
}

/// Compile a filter object. `offset` is the number of placeholders the base
/// query already uses; the first emitted placeholder is `$offset+1`.
pub fn compile(filter: &Value, offset: usize) -> Result<CompiledFilter> {
    let obj = filter
        .as_object()
        .ok_or_else(|| Error::FilterValidation("filter must be a JSON object".into()))?;

    if obj.is_empty() {
        return Ok(CompiledFilter::empty());
    }

    let has_dsl = obj.contains_key("conditions") || obj.contains_key("combine");
    let has_legacy_bool = obj.contains_key("must") || obj.contains_key("must_not");

    if has_dsl && has_legacy_bool {
        return Err(Error::FilterValidation(
            "cannot mix 'conditions' with legacy 'must'/'must_not'".into(),
        ));
    }

    if has_dsl {
        if let Some(extra) = obj.keys().find(|k| *k != "conditions" && *k != "combine") {
            return Err(Error::FilterValidation(format!(
                "cannot mix 'conditions' with plain filter key '{}'",
                extra
            )));
        }
        return compile_dsl(obj, offset);
    }

    if has_legacy_bool {
        if let Some(extra) = obj.keys().find(|k| *k != "must" && *k != "must_not") {
            return Err(Error::FilterValidation(format!(
                "cannot mix 'must'/'must_not' with plain filter key '{}'",
                extra
            )));
        }
        return compile_legacy_bool(obj, offset);
    }

    compile_legacy_map(obj, offset)
}

fn parse_conditions(raw: &Value) -> Result<Vec<Cond>> {
    let arr = raw
        .as_array()
        .ok_or_else(|| Error::FilterValidation("'conditions' must be an array".into()))?;
    arr.iter()
        .map(|c| {
            serde_json::from_value(c.clone())
                .map_err(|e| Error::FilterValidation(format!("invalid condition: {}", e)))
        })
        .collect()
}

fn compile_dsl(
    obj: &serde_json::Map<String, Value>,
    offset: usize,
) -> Result<CompiledFilter> {
    let combine = match obj.get("combine") {
        None => "AND",
        Some(Value::String(s)) if s.eq_ignore_ascii_case("and") => "AND",
        Some(Value::String(s)) if s.eq_ignore_ascii_case("or") => "OR",
        Some(other) => {
            return Err(Error::FilterValidation(format!(
                "invalid combine: {}",
                other
            )))
        }
    };

    let conds = match obj.get("conditions") {
        Some(raw) => parse_conditions(raw)?,
        None => Vec::new(),
    };

    let mut params = Vec::new();
    let mut fragments = Vec::with_capacity(conds.len());
    for cond in &conds {
        fragments.push(compile_cond(cond, offset, &mut params)?);
    }

    Ok(join_fragments(fragments, combine, params))
}

fn compile_legacy_bool(
    obj: &serde_json::Map<String, Value>,
    offset: usize,
) -> Result<CompiledFilter> {
    let mut params = Vec::new();
    let mut fragments = Vec::new();

    if let Some(raw) = obj.get("must") {
        for cond in parse_conditions(raw)? {
            fragments.push(compile_cond(&cond, offset, &mut params)?);
        }
    }
    if let Some(raw) = obj.get("must_not") {
        for cond in parse_conditions(raw)? {
            let inner = compile_cond(&cond, offset, &mut params)?;
            fragments.push(format!("NOT ({})", inner));
        }
    }

    Ok(join_fragments(fragments, "AND", params))
}

/// `{ field: value }` map: equality per entry, AND-combined. An array value
/// is shorthand for `in`.
fn compile_legacy_map(
    obj: &serde_json::Map<String, Value>,
    offset: usize,
) -> Result<CompiledFilter> {
    let mut params = Vec::new();
    let mut fragments = Vec::new();

    for (field, value) in obj {
        let cond = match value {
            Value::Array(items) => Cond {
                field: field.clone(),
                op: Op::In,
                value: None,
                values: Some(items.clone()),
                range: None,
                alias: None,
            },
            Value::Null => Cond {
                field: field.clone(),
                op: Op::IsNull,
                value: None,
                values: None,
                range: None,
                alias: None,
            },
            other => Cond {
                field: field.clone(),
                op: Op::Eq,
                value: Some(other.clone()),
                values: None,
                range: None,
                alias: None,
            },
        };
        fragments.push(compile_cond(&cond, offset, &mut params)?);
    }

    Ok(join_fragments(fragments, "AND", params))
}

fn join_fragments(fragments: Vec<String>, combine: &str, params: Vec<Value>) -> CompiledFilter {
    match fragments.len() {
        0 => CompiledFilter::empty(),
        1 => CompiledFilter {
            sql: format!(" AND {}", fragments[0]),
            params,
        },
        _ => CompiledFilter {
            sql: format!(" AND ({})", fragments.join(&format!(" {} ", combine))),
            params,
        },
    }
}

/// Compile one condition, pushing its parameters and returning its SQL.
fn compile_cond(cond: &Cond, offset: usize, params: &mut Vec<Value>) -> Result<String> {
    let spec = lookup(&cond.field)?;

    if let Some(alias) = &cond.alias {
        if alias != spec.alias {
            return Err(Error::FilterValidation(format!(
                "field '{}' binds to alias '{}', not '{}'",
                cond.field, spec.alias, alias
            )));
        }
    }

    if !spec.ops.contains(&cond.op) {
        return Err(Error::FilterValidation(format!(
            "operator '{}' not allowed on field '{}'",
            cond.op.name(),
            cond.field
        )));
    }

    let col = format!("{}.{}", spec.alias, spec.column);

    match cond.op {
        Op::IsNull => Ok(format!("{} IS NULL", col)),
        Op::IsNotNull => Ok(format!("{} IS NOT NULL", col)),

        Op::Eq | Op::Ne if spec.field == "path" => {
            let value = scalar_arg(cond, spec)?;
            let ph = push_param(params, offset, value);
            let neg = if cond.op == Op::Ne { "NOT " } else { "" };
            Ok(format!("{} {}LIKE {} || '%'", col, neg, ph))
        }

        Op::Eq | Op::Ne | Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let value = scalar_arg(cond, spec)?;
            let ph = push_param(params, offset, value);
            let sym = match cond.op {
                Op::Eq => "=",
                Op::Ne => "<>",
                Op::Gt => ">",
                Op::Gte => ">=",
                Op::Lt => "<",
                Op::Lte => "<=",
                _ => unreachable!(),
            };
            Ok(format!("{} {} {}{}", col, sym, ph, cast(spec.kind)))
        }

        Op::In | Op::NotIn => {
            let values = cond.values.as_ref().ok_or_else(|| {
                Error::FilterValidation(format!(
                    "'{}' on '{}' requires a 'values' array",
                    cond.op.name(),
                    cond.field
                ))
            })?;
            if values.is_empty() {
                return Err(Error::FilterValidation(format!(
                    "empty '{}' list on field '{}'",
                    cond.op.name(),
                    cond.field
                )));
            }
            let mut placeholders = Vec::with_capacity(values.len());
            for v in values {
                check_scalar(v, spec)?;
                let ph = push_param(params, offset, v.clone());
                placeholders.push(format!("{}{}", ph, cast(spec.kind)));
            }
            let neg = if cond.op == Op::NotIn { "NOT " } else { "" };
            Ok(format!("{} {}IN ({})", col, neg, placeholders.join(", ")))
        }

        Op::Between | Op::NotBetween => {
            let range = cond.range.as_ref().ok_or_else(|| {
                Error::FilterValidation(format!(
                    "'{}' on '{}' requires a 'range' of two bounds",
                    cond.op.name(),
                    cond.field
                ))
            })?;
            if range.len() != 2 || range.iter().any(Value::is_null) {
                return Err(Error::FilterValidation(format!(
                    "'{}' on '{}' requires exactly two non-null bounds",
                    cond.op.name(),
                    cond.field
                )));
            }
            check_scalar(&range[0], spec)?;
            check_scalar(&range[1], spec)?;
            let lo = push_param(params, offset, range[0].clone());
            let hi = push_param(params, offset, range[1].clone());
            let neg = if cond.op == Op::NotBetween { "NOT " } else { "" };
            Ok(format!(
                "{} {}BETWEEN {}{c} AND {}{c}",
                col,
                neg,
                lo,
                hi,
                c = cast(spec.kind)
            ))
        }
    }
}

/// Postgres needs an explicit cast for parameters compared against
/// non-text columns when the driver sends them as text.
fn cast(kind: Kind) -> &'static str {
    match kind {
        Kind::Text => "",
        Kind::Int => "::bigint",
        Kind::Timestamp => "::timestamptz",
    }
}

fn push_param(params: &mut Vec<Value>, offset: usize, value: Value) -> String {
    params.push(value);
    format!("${}", offset + params.len())
}

fn scalar_arg(cond: &Cond, spec: &FieldSpec) -> Result<Value> {
    let value = cond.value.clone().ok_or_else(|| {
        Error::FilterValidation(format!(
            "'{}' on '{}' requires a 'value'",
            cond.op.name(),
            cond.field
        ))
    })?;
    check_scalar(&value, spec)?;
    Ok(value)
}

/// Arguments must be scalars of the column's kind; arrays and objects are
/// never bindable values.
fn check_scalar(value: &Value, spec: &FieldSpec) -> Result<()> {
    let ok = match spec.kind {
        Kind::Text => value.is_string(),
        Kind::Int => value.is_i64() || value.is_u64(),
        Kind::Timestamp => value.is_string() || value.is_number(),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::FilterValidation(format!(
            "invalid value for field '{}'",
            spec.field
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn two_conditions_or() {
        let filter = json!({
            "conditions": [
                {"field": "docType", "op": "eq", "value": "code"},
                {"field": "lang", "op": "eq", "value": "ts"}
            ],
            "combine": "or"
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND (c.doc_type = $1 OR c.lang = $2)");
        assert_eq!(compiled.params, vec![json!("code"), json!("ts")]);
    }

    #[test]
    fn single_condition_no_outer_parens() {
        let filter = json!({
            "conditions": [{"field": "docType", "op": "eq", "value": "code"}],
            "combine": "and"
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND c.doc_type = $1");
    }

    #[test]
    fn path_eq_rewrites_to_prefix_match() {
        let filter = json!({
            "conditions": [{"field": "path", "op": "eq", "value": "src/"}]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND c.path LIKE $1 || '%'");
        assert_eq!(compiled.params, vec![json!("src/")]);
    }

    #[test]
    fn path_ne_rewrites_to_negated_prefix_match() {
        let filter = json!({
            "conditions": [{"field": "path", "op": "ne", "value": "vendor/"}]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND c.path NOT LIKE $1 || '%'");
    }

    #[test]
    fn parameter_offset_respected() {
        let filter = json!({
            "conditions": [
                {"field": "docType", "op": "eq", "value": "code"},
                {"field": "lang", "op": "in", "values": ["rust", "go"]}
            ]
        });
        let compiled = compile(&filter, 3).unwrap();
        assert_eq!(
            compiled.sql,
            " AND (c.doc_type = $4 AND c.lang IN ($5, $6))"
        );
        assert_eq!(compiled.params.len(), 3);
    }

    #[test]
    fn empty_in_list_rejected() {
        let filter = json!({
            "conditions": [{"field": "lang", "op": "in", "values": []}]
        });
        let err = compile(&filter, 0).unwrap_err();
        assert!(matches!(err, Error::FilterValidation(_)));
    }

    #[test]
    fn unknown_field_rejected() {
        let filter = json!({
            "conditions": [{"field": "password", "op": "eq", "value": "x"}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }

    #[test]
    fn unknown_operator_rejected() {
        let filter = json!({
            "conditions": [{"field": "lang", "op": "regex", "value": ".*"}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }

    #[test]
    fn disallowed_operator_rejected() {
        // gt makes no sense on a text column.
        let filter = json!({
            "conditions": [{"field": "lang", "op": "gt", "value": "a"}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }

    #[test]
    fn wrong_alias_rejected() {
        let filter = json!({
            "conditions": [{"field": "docType", "op": "eq", "value": "code", "alias": "d"}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }

    #[test]
    fn correct_alias_accepted() {
        let filter = json!({
            "conditions": [{"field": "collection", "op": "eq", "value": "kb", "alias": "d"}]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND d.collection = $1");
    }

    #[test]
    fn between_requires_two_bounds() {
        let filter = json!({
            "conditions": [{"field": "chunkIndex", "op": "between", "range": [1]}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));

        let ok = json!({
            "conditions": [{"field": "chunkIndex", "op": "between", "range": [1, 5]}]
        });
        let compiled = compile(&ok, 0).unwrap();
        assert_eq!(
            compiled.sql,
            " AND c.chunk_index BETWEEN $1::bigint AND $2::bigint"
        );
    }

    #[test]
    fn invalid_combine_rejected() {
        let filter = json!({
            "conditions": [{"field": "lang", "op": "eq", "value": "rust"}],
            "combine": "xor"
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }

    #[test]
    fn null_checks_take_no_params() {
        let filter = json!({
            "conditions": [
                {"field": "lang", "op": "isNull"},
                {"field": "repoId", "op": "isNotNull"}
            ]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND (c.lang IS NULL AND c.repo_id IS NOT NULL)");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn timestamp_params_are_cast() {
        let filter = json!({
            "conditions": [{"field": "createdAt", "op": "gte", "value": "2026-01-01T00:00:00Z"}]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND c.created_at >= $1::timestamptz");
    }

    #[test]
    fn legacy_map_equality() {
        let filter = json!({"docType": "code", "lang": "rust"});
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND (c.doc_type = $1 AND c.lang = $2)");
    }

    #[test]
    fn legacy_map_array_is_in() {
        let filter = json!({"lang": ["rust", "go"]});
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND c.lang IN ($1, $2)");
    }

    #[test]
    fn legacy_must_not() {
        let filter = json!({
            "must": [{"field": "docType", "op": "eq", "value": "code"}],
            "must_not": [{"field": "lang", "op": "eq", "value": "go"}]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(
            compiled.sql,
            " AND (c.doc_type = $1 AND NOT (c.lang = $2))"
        );
    }

    #[test]
    fn mixing_dsl_and_legacy_rejected() {
        let filter = json!({
            "conditions": [{"field": "lang", "op": "eq", "value": "rust"}],
            "must": [{"field": "docType", "op": "eq", "value": "code"}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));

        let mixed_map = json!({
            "conditions": [{"field": "lang", "op": "eq", "value": "rust"}],
            "docType": "code"
        });
        assert!(matches!(
            compile(&mixed_map, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }

    #[test]
    fn empty_filter_compiles_to_nothing() {
        let compiled = compile(&json!({}), 0).unwrap();
        assert_eq!(compiled, CompiledFilter::empty());
    }

    #[test]
    fn injection_attempts_stay_parameterised() {
        let filter = json!({
            "conditions": [
                {"field": "source", "op": "eq", "value": "'; DROP TABLE chunks; --"}
            ]
        });
        let compiled = compile(&filter, 0).unwrap();
        assert_eq!(compiled.sql, " AND c.source = $1");
        assert!(!compiled.sql.contains("DROP"));
        assert_eq!(compiled.params[0], json!("'; DROP TABLE chunks; --"));
    }

    #[test]
    fn wrong_value_type_rejected() {
        let filter = json!({
            "conditions": [{"field": "chunkIndex", "op": "eq", "value": "three"}]
        });
        assert!(matches!(
            compile(&filter, 0).unwrap_err(),
            Error::FilterValidation(_)
        ));
    }
}
