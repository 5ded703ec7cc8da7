//! Query DSL compiler: a recursive descent over a JSON-shaped object
//! producing a backend query tree.
//!
//! Two surface syntaxes: the object form (`{"_and": [...], "field":
//! value}`) and a raw boolean expression string
//! (`"fieldA:foo AND fieldB:(bar OR baz)"`), which is first parsed into
//! the object form and then compiled.

use std::sync::Arc;

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::query::sort::{KeyMaker, Metric, SortKey};
use crate::query::terms as generate_terms;
use crate::query::Query;
use crate::schema::{
    guess_serialise, namespace_prefix, parse_datetime, serialise_value, tokenize, timestamp_of,
    FieldSpec, FieldType, Schema, UnitTime, CTYPE_TEXT,
};
use crate::serialise::{prefixed, sortable_serialise};

/// Path separator for nested fields.
const SEPARATOR: char = '.';

#[derive(Clone, Copy, PartialEq)]
enum CompoundOp {
    And,
    Or,
    Not,
    AndNot,
    Xor,
    AndMaybe,
    Filter,
    ScaleWeight,
    EliteSet,
    Synonym,
    Max,
}

pub struct QueryDsl {
    schema: Arc<Schema>,
}

impl QueryDsl {
    pub fn new(schema: Arc<Schema>) -> QueryDsl {
        QueryDsl { schema }
    }

    /// Compiles a query object (or raw expression string) into a tree.
    pub fn get_query(&self, obj: &Value) -> Result<Query> {
        self.process("", obj, 1)
    }

    fn process(&self, path: &str, obj: &Value, wqf: u32) -> Result<Query> {
        match obj {
            Value::Object(map) => {
                let mut queries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let query = if let Some(op) = compound_op(key) {
                        self.process_compound(op, path, value, wqf)?
                    } else if key.starts_with('_') {
                        self.process_reserved(key, path, value, wqf)?
                    } else {
                        let joined = join_path(path, key);
                        self.process(&joined, value, wqf)?
                    };
                    queries.push(query);
                }
                Ok(Query::and(queries))
            }
            Value::Array(items) => {
                // A bare array on a field means any-of.
                let children = items
                    .iter()
                    .map(|item| self.process(path, item, wqf))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Query::or(children))
            }
            Value::String(s) if path.is_empty() => {
                // A raw boolean expression at the top level.
                let rewritten = parse_expression(s)?;
                self.process("", &rewritten, wqf)
            }
            leaf => self.get_value_query(path, leaf, wqf),
        }
    }

    fn process_compound(
        &self,
        op: CompoundOp,
        path: &str,
        value: &Value,
        wqf: u32,
    ) -> Result<Query> {
        if op == CompoundOp::Not {
            let inner = self.process(path, value, wqf)?;
            return Ok(Query::AndNot(
                Box::new(Query::MatchAll),
                Box::new(inner),
            ));
        }
        if op == CompoundOp::ScaleWeight {
            // First element is the factor, the rest the query.
            let items = value.as_array().ok_or_else(|| {
                Error::QueryDsl("_scale_weight expects [factor, query...]".into())
            })?;
            let factor = items
                .first()
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::QueryDsl("_scale_weight factor must be a number".into()))?;
            let children = items[1..]
                .iter()
                .map(|item| self.process(path, item, wqf))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Query::ScaleWeight(factor, Box::new(Query::and(children))));
        }

        let children = match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.process(path, item, wqf))
                .collect::<Result<Vec<_>>>()?,
            other => vec![self.process(path, other, wqf)?],
        };
        Ok(match op {
            CompoundOp::And => Query::and(children),
            CompoundOp::Or => Query::or(children),
            CompoundOp::Xor => Query::Xor(children),
            CompoundOp::Max => Query::Max(children),
            CompoundOp::Synonym => Query::Synonym(children),
            CompoundOp::EliteSet => Query::EliteSet(children),
            CompoundOp::AndNot => fold_binary(children, |a, b| {
                Query::AndNot(Box::new(a), Box::new(b))
            }),
            CompoundOp::AndMaybe => fold_binary(children, |a, b| {
                Query::AndMaybe(Box::new(a), Box::new(b))
            }),
            CompoundOp::Filter => fold_binary(children, |a, b| {
                Query::Filter(Box::new(a), Box::new(b))
            }),
            CompoundOp::Not | CompoundOp::ScaleWeight => unreachable!(),
        })
    }

    fn process_reserved(&self, key: &str, path: &str, value: &Value, wqf: u32) -> Result<Query> {
        match key {
            "_value" => self.get_value_query(path, value, wqf),
            "_raw" => self.get_raw_query(path, value, wqf),
            "_in" => self.get_in_query(path, value, wqf),
            "_integer" => self.get_cast_query(path, FieldType::Integer, value, wqf),
            "_positive" => self.get_cast_query(path, FieldType::Positive, value, wqf),
            "_float" => self.get_cast_query(path, FieldType::Float, value, wqf),
            "_boolean" => self.get_cast_query(path, FieldType::Boolean, value, wqf),
            "_keyword" | "_term" => self.get_cast_query(path, FieldType::Keyword, value, wqf),
            "_text" | "_string" => self.get_cast_query(path, FieldType::Text, value, wqf),
            "_date" => self.get_cast_query(path, FieldType::Date, value, wqf),
            "_time" => self.get_cast_query(path, FieldType::Time, value, wqf),
            "_timedelta" => self.get_cast_query(path, FieldType::Timedelta, value, wqf),
            "_uuid" => self.get_cast_query(path, FieldType::Uuid, value, wqf),
            "_point" | "_circle" | "_polygon" | "_chull" | "_geo_intersection" => {
                self.get_geo_query(path, &serde_json::json!({ key: value }), wqf)
            }
            other => Err(Error::QueryDsl(format!("invalid operator: {other}"))),
        }
    }

    fn get_value_query(&self, path: &str, value: &Value, wqf: u32) -> Result<Query> {
        if path.is_empty() {
            return self.get_namespace_query("", value, wqf);
        }
        let (spec, accuracy) = self.schema.get_data_field(path);
        if let Some(accuracy) = accuracy {
            return self.get_accuracy_query(&spec, &accuracy, value, wqf);
        }
        if spec.namespace {
            return self.get_namespace_query(path, value, wqf);
        }
        match self.get_regular_query(&spec, value, wqf) {
            Ok(query) => Ok(query),
            Err(Error::Serialisation(_)) => self.get_namespace_query(path, value, wqf),
            Err(e) => Err(e),
        }
    }

    /// `_raw` bypasses casting: the literal is matched as a keyword.
    fn get_raw_query(&self, path: &str, value: &Value, wqf: u32) -> Result<Query> {
        let (spec, _) = self.schema.get_data_field(path);
        let serialised = serialise_value(FieldType::Keyword, value)?;
        let prefix = if spec.namespace {
            namespace_prefix(path)
        } else {
            spec.prefix.clone()
        };
        Ok(Query::Term {
            term: prefixed(&serialised, &prefix, FieldType::Keyword.ctype()),
            wqf,
        })
    }

    fn get_cast_query(&self, path: &str, ty: FieldType, value: &Value, wqf: u32) -> Result<Query> {
        let (spec, _) = self.schema.get_data_field(path);
        let serialised = serialise_value(ty, value)?;
        let prefix = if spec.namespace {
            namespace_prefix(path)
        } else {
            spec.prefix.clone()
        };
        Ok(Query::Term {
            term: prefixed(&serialised, &prefix, ty.ctype()),
            wqf,
        })
    }

    fn get_regular_query(&self, spec: &FieldSpec, value: &Value, wqf: u32) -> Result<Query> {
        match spec.ty {
            FieldType::Text => {
                let text = value
                    .as_str()
                    .ok_or_else(|| Error::Serialisation("text value expected".into()))?;
                Ok(self.text_query(&spec.prefix, text, wqf))
            }
            FieldType::Geo => self.get_geo_query(&spec.name, value, wqf),
            _ => {
                let serialised = serialise_value(spec.ty, value)?;
                Ok(Query::Term {
                    term: spec.term(&serialised),
                    wqf,
                })
            }
        }
    }

    /// Word terms with wildcard support; multiple words broaden the match.
    fn text_query(&self, prefix: &[u8], text: &str, wqf: u32) -> Query {
        let mut children = Vec::new();
        for token in tokenize(text) {
            if let Some(stem) = token.strip_suffix('*') {
                children.push(Query::Wildcard {
                    prefix: prefixed(stem.as_bytes(), prefix, CTYPE_TEXT),
                });
            } else {
                children.push(Query::Term {
                    term: prefixed(token.as_bytes(), prefix, CTYPE_TEXT),
                    wqf,
                });
            }
        }
        Query::or(children)
    }

    /// Namespace fields match under a synthetic prefix typed by the
    /// literal's guessed type.
    fn get_namespace_query(&self, path: &str, value: &Value, wqf: u32) -> Result<Query> {
        match value {
            Value::String(s) if s.contains('*') => {
                let token = s.trim_end_matches('*').to_lowercase();
                Ok(Query::Wildcard {
                    prefix: prefixed(
                        token.as_bytes(),
                        &namespace_prefix(path),
                        FieldType::Keyword.ctype(),
                    ),
                })
            }
            _ => {
                let (ty, serialised) = guess_serialise(value)?;
                Ok(Query::Term {
                    term: prefixed(&serialised, &namespace_prefix(path), ty.ctype()),
                    wqf,
                })
            }
        }
    }

    /// `field._100`, `field._month`, `field._geo5`: match one accuracy
    /// bucket directly.
    fn get_accuracy_query(
        &self,
        spec: &FieldSpec,
        accuracy: &str,
        value: &Value,
        wqf: u32,
    ) -> Result<Query> {
        let suffix = &accuracy[1..];
        match spec.ty {
            FieldType::Integer | FieldType::Positive | FieldType::Float
            | FieldType::Time | FieldType::Timedelta => {
                let acc: u64 = suffix
                    .parse()
                    .map_err(|_| Error::QueryDsl(format!("invalid accuracy: {accuracy}")))?;
                let position = spec
                    .accuracy
                    .iter()
                    .position(|a| *a == acc)
                    .ok_or_else(|| Error::QueryDsl(format!("unknown accuracy: {accuracy}")))?;
                let number = match spec.ty {
                    FieldType::Time | FieldType::Timedelta => {
                        crate::schema::parse_time_seconds(value)? as i64
                    }
                    _ => value
                        .as_f64()
                        .ok_or_else(|| Error::Serialisation("number expected".into()))?
                        as i64,
                };
                let bucket = number - generate_terms::modulus(number, acc as i64);
                Ok(Query::Term {
                    term: prefixed(
                        &sortable_serialise(bucket as f64),
                        &spec.acc_prefixes[position],
                        crate::schema::CTYPE_INTEGER,
                    ),
                    wqf,
                })
            }
            FieldType::Date => {
                let unit = UnitTime::from_name(suffix)
                    .ok_or_else(|| Error::QueryDsl(format!("invalid accuracy: {accuracy}")))?;
                let position = spec
                    .date_accuracy
                    .iter()
                    .position(|u| *u == unit)
                    .ok_or_else(|| Error::QueryDsl(format!("unknown accuracy: {accuracy}")))?;
                let dt = parse_datetime(value)?;
                let bucket = generate_terms::truncate(unit, &dt);
                Ok(Query::Term {
                    term: prefixed(
                        &sortable_serialise(timestamp_of(&bucket)),
                        &spec.acc_prefixes[position],
                        crate::schema::CTYPE_DATE,
                    ),
                    wqf,
                })
            }
            FieldType::Geo => {
                let level: u64 = suffix
                    .strip_prefix("geo")
                    .and_then(|rest| rest.parse().ok())
                    .ok_or_else(|| Error::QueryDsl(format!("invalid accuracy: {accuracy}")))?;
                let position = spec
                    .accuracy
                    .iter()
                    .position(|a| *a == level)
                    .ok_or_else(|| Error::QueryDsl(format!("unknown accuracy: {accuracy}")))?;
                let shape = crate::geo::shape_from_json(value)?;
                let ranges = shape.trixel_ranges_auto(true);
                generate_terms::geo_query(
                    &ranges,
                    &[level],
                    std::slice::from_ref(&spec.acc_prefixes[position]),
                )
                .ok_or_else(|| Error::QueryDsl("geo shape produced no buckets".into()))
            }
            _ => Err(Error::QueryDsl(format!(
                "field {} has no accuracy levels",
                spec.name
            ))),
        }
    }

    /// `_in` containers: ranges and geo shapes over value posting sources.
    fn get_in_query(&self, path: &str, obj: &Value, wqf: u32) -> Result<Query> {
        let map = obj
            .as_object()
            .ok_or_else(|| Error::QueryDsl("_in must be an object".into()))?;

        if map.contains_key("_range") {
            return self.get_range_query(path, &map["_range"]);
        }
        if map.keys().any(|k| is_geo_key(k)) {
            return self.get_geo_query(path, obj, wqf);
        }
        Err(Error::QueryDsl(format!(
            "_in expects _range or a geo shape, got {obj}"
        )))
    }

    fn get_range_query(&self, path: &str, range: &Value) -> Result<Query> {
        let map = range
            .as_object()
            .ok_or_else(|| Error::QueryDsl("_range must be an object".into()))?;
        let from = map.get("_from");
        let to = map.get("_to");
        if from.is_none() && to.is_none() {
            return Err(Error::QueryDsl("_range requires _from or _to".into()));
        }

        let (spec, _) = self.schema.get_data_field(path);
        if spec.namespace {
            return Err(Error::QueryDsl(format!(
                "range queries need a typed field: {path}"
            )));
        }

        let start = from.map(|v| serialise_value(spec.ty, v)).transpose()?;
        let end = to.map(|v| serialise_value(spec.ty, v)).transpose()?;
        let source = Query::ValueRange {
            slot: spec.slot,
            start,
            end,
        };

        // Term-level acceleration only applies to bounded ranges.
        let accelerator = match (from, to) {
            (Some(from), Some(to)) => match spec.ty {
                FieldType::Integer | FieldType::Positive | FieldType::Float => {
                    let lo = from
                        .as_f64()
                        .or_else(|| from.as_str().and_then(|s| s.parse().ok()))
                        .ok_or_else(|| Error::Serialisation("number expected".into()))?;
                    let hi = to
                        .as_f64()
                        .or_else(|| to.as_str().and_then(|s| s.parse().ok()))
                        .ok_or_else(|| Error::Serialisation("number expected".into()))?;
                    generate_terms::numeric(lo as i64, hi as i64, &spec.accuracy, &spec.acc_prefixes)
                }
                FieldType::Time | FieldType::Timedelta => {
                    let lo = crate::schema::parse_time_seconds(from)?;
                    let hi = crate::schema::parse_time_seconds(to)?;
                    generate_terms::numeric(lo as i64, hi as i64, &spec.accuracy, &spec.acc_prefixes)
                }
                FieldType::Date => {
                    let lo = parse_datetime(from)?;
                    let hi = parse_datetime(to)?;
                    generate_terms::date_range(&lo, &hi, &spec.date_accuracy, &spec.acc_prefixes)
                }
                _ => None,
            },
            _ => None,
        };

        Ok(match accelerator {
            Some(terms) => Query::and(vec![terms, source]),
            None => source,
        })
    }

    fn get_geo_query(&self, path: &str, obj: &Value, _wqf: u32) -> Result<Query> {
        let (spec, _) = self.schema.get_data_field(path);
        if spec.ty != FieldType::Geo {
            return Err(Error::QueryDsl(format!(
                "geo queries need a geo field: {path}"
            )));
        }
        let shape = crate::geo::shape_from_json(obj)?;
        let ranges = shape.trixel_ranges_auto(true);
        let centroids = shape.centroids();
        let source = Query::GeoRange {
            slot: spec.slot,
            ranges: ranges.clone(),
            centroids,
        };
        Ok(
            match generate_terms::geo_query(&ranges, &spec.accuracy, &spec.acc_prefixes) {
                Some(terms) => Query::and(vec![terms, source]),
                None => source,
            },
        )
    }

    /// `_sort` specification into a multi-value key maker.
    pub fn get_sorter(&self, value: &Value) -> Result<KeyMaker> {
        let mut key_maker = KeyMaker::default();
        match value {
            Value::String(s) => {
                key_maker.push(self.sort_key(s, &Value::Null)?);
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) => key_maker.push(self.sort_key(s, &Value::Null)?),
                        Value::Object(map) => {
                            for (field, options) in map {
                                key_maker.push(self.sort_key(field, options)?);
                            }
                        }
                        other => {
                            return Err(Error::QueryDsl(format!("invalid sort item: {other}")));
                        }
                    }
                }
            }
            Value::Object(map) => {
                for (field, options) in map {
                    key_maker.push(self.sort_key(field, options)?);
                }
            }
            other => return Err(Error::QueryDsl(format!("invalid _sort: {other}"))),
        }
        Ok(key_maker)
    }

    fn sort_key(&self, field: &str, options: &Value) -> Result<SortKey> {
        let (name, mut descending) = match field.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (field, false),
        };
        let (spec, _) = self.schema.get_data_field(name);
        if spec.namespace {
            return Err(Error::QueryDsl(format!("cannot sort on {name}")));
        }

        let mut metric = None;
        if let Value::Object(map) = options {
            if let Some(order) = map.get("_order").and_then(Value::as_str) {
                descending = match order {
                    "asc" => false,
                    "desc" => true,
                    other => {
                        return Err(Error::QueryDsl(format!("invalid _order: {other}")));
                    }
                };
            }
            if let Some(name) = map.get("_metric").and_then(Value::as_str) {
                let reference = map
                    .get("_value")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                metric = Some(match name {
                    "levenshtein" => Metric::Levenshtein { reference },
                    other => {
                        return Err(Error::QueryDsl(format!("invalid _metric: {other}")));
                    }
                });
            }
        }

        Ok(SortKey {
            slot: spec.slot,
            descending,
            metric,
        })
    }
}

fn compound_op(key: &str) -> Option<CompoundOp> {
    Some(match key {
        "_and" => CompoundOp::And,
        "_or" => CompoundOp::Or,
        "_not" => CompoundOp::Not,
        "_and_not" => CompoundOp::AndNot,
        "_xor" => CompoundOp::Xor,
        "_and_maybe" => CompoundOp::AndMaybe,
        "_filter" => CompoundOp::Filter,
        "_scale_weight" => CompoundOp::ScaleWeight,
        "_elite_set" => CompoundOp::EliteSet,
        "_synonym" => CompoundOp::Synonym,
        "_max" => CompoundOp::Max,
        _ => return None,
    })
}

fn is_geo_key(key: &str) -> bool {
    matches!(
        key,
        "_point" | "_circle" | "_polygon" | "_chull" | "_geo_intersection"
    )
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}{SEPARATOR}{key}")
    }
}

fn fold_binary(children: Vec<Query>, combine: impl Fn(Query, Query) -> Query) -> Query {
    let mut iter = children.into_iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return Query::MatchNothing,
    };
    iter.fold(first, combine)
}

// ---------------------------------------------------------------------
// Raw boolean expressions

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Xor,
    Not,
    Open,
    Close,
    Colon,
    Literal(String),
}

fn tokenize_expression(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '"' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => literal.push(c),
                        None => {
                            return Err(Error::QueryDsl("unterminated string literal".into()));
                        }
                    }
                }
                tokens.push(Token::Literal(literal));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' || c == '\t' || c == '\n' || c == '(' || c == ')' || c == ':' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(match word.as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "XOR" => Token::Xor,
                    "NOT" => Token::Not,
                    _ => Token::Literal(word),
                });
            }
        }
    }
    Ok(tokens)
}

struct ExpressionParser {
    tokens: Vec<Token>,
    position: usize,
}

/// Parses a raw boolean expression into the object form of the DSL.
pub fn parse_expression(input: &str) -> Result<Value> {
    let tokens = tokenize_expression(input)?;
    let mut parser = ExpressionParser { tokens, position: 0 };
    let value = parser.parse_or(None)?;
    if parser.position != parser.tokens.len() {
        return Err(Error::QueryDsl(format!("trailing input in query: {input}")));
    }
    Ok(value)
}

impl ExpressionParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self, field: Option<&str>) -> Result<Value> {
        let mut terms = vec![self.parse_xor(field)?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            terms.push(self.parse_xor(field)?);
        }
        Ok(combine("_or", terms))
    }

    fn parse_xor(&mut self, field: Option<&str>) -> Result<Value> {
        let mut terms = vec![self.parse_and(field)?];
        while self.peek() == Some(&Token::Xor) {
            self.next();
            terms.push(self.parse_and(field)?);
        }
        Ok(combine("_xor", terms))
    }

    fn parse_and(&mut self, field: Option<&str>) -> Result<Value> {
        let mut terms = vec![self.parse_unary(field)?];
        loop {
            match self.peek() {
                Some(&Token::And) => {
                    self.next();
                    if self.peek() == Some(&Token::Not) {
                        self.next();
                        let negated = self.parse_unary(field)?;
                        let positive = combine("_and", std::mem::take(&mut terms));
                        terms.push(serde_json::json!({ "_and_not": [positive, negated] }));
                    } else {
                        terms.push(self.parse_unary(field)?);
                    }
                }
                _ => break,
            }
        }
        Ok(combine("_and", terms))
    }

    fn parse_unary(&mut self, field: Option<&str>) -> Result<Value> {
        match self.next() {
            Some(Token::Not) => {
                let inner = self.parse_unary(field)?;
                Ok(serde_json::json!({ "_not": inner }))
            }
            Some(Token::Open) => {
                let inner = self.parse_or(field)?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(Error::QueryDsl("expected closing parenthesis".into())),
                }
            }
            Some(Token::Literal(word)) => {
                if field.is_none() && self.peek() == Some(&Token::Colon) {
                    self.next();
                    return self.parse_fielded(&word);
                }
                Ok(self.literal_value(field, &word))
            }
            other => Err(Error::QueryDsl(format!("unexpected token: {other:?}"))),
        }
    }

    fn parse_fielded(&mut self, field: &str) -> Result<Value> {
        match self.next() {
            Some(Token::Open) => {
                let inner = self.parse_or(Some(field))?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(Error::QueryDsl("expected closing parenthesis".into())),
                }
            }
            Some(Token::Literal(word)) => Ok(self.literal_value(Some(field), &word)),
            other => Err(Error::QueryDsl(format!(
                "expected value after {field}: {other:?}"
            ))),
        }
    }

    fn literal_value(&self, field: Option<&str>, word: &str) -> Value {
        let value = if let Some((from, to)) = word.split_once("..") {
            serde_json::json!({ "_in": { "_range": {
                "_from": literal_json(from),
                "_to": literal_json(to),
            }}})
        } else {
            literal_json(word)
        };
        match field {
            Some(field) => serde_json::json!({ field: value }),
            None => value,
        }
    }
}

fn literal_json(word: &str) -> Value {
    if let Ok(n) = word.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = word.parse::<f64>() {
        return Value::from(f);
    }
    match word {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::from(word),
    }
}

fn combine(op: &str, mut terms: Vec<Value>) -> Value {
    if terms.len() == 1 {
        terms.pop().unwrap()
    } else {
        serde_json::json!({ op: terms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        let mut schema = Schema::new();
        schema.insert(FieldSpec::new("title", FieldType::Text, 10));
        schema.insert(FieldSpec::new("tag", FieldType::Keyword, 11));
        schema.insert(FieldSpec::new("n", FieldType::Integer, 12).with_accuracy(vec![10, 100]));
        schema.insert(
            FieldSpec::new("when", FieldType::Date, 13).with_date_accuracy(vec![
                UnitTime::Year,
                UnitTime::Month,
                UnitTime::Day,
            ]),
        );
        schema.insert(FieldSpec::new("place", FieldType::Geo, 14).with_accuracy(vec![5, 10, 15]));
        Arc::new(schema)
    }

    fn dsl() -> QueryDsl {
        QueryDsl::new(schema())
    }

    #[test]
    fn single_field_term() {
        let query = dsl().get_query(&serde_json::json!({"tag": "rust"})).unwrap();
        match query {
            Query::Term { term, wqf } => {
                assert_eq!(wqf, 1);
                assert!(term.ends_with(b"rust"));
            }
            other => panic!("expected a term query, got {other:?}"),
        }
    }

    #[test]
    fn compound_operators_map_to_tree() {
        let query = dsl()
            .get_query(&serde_json::json!({
                "_and": [
                    {"tag": "rust"},
                    {"_or": [{"tag": "db"}, {"tag": "search"}]},
                ]
            }))
            .unwrap();
        match query {
            Query::And(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], Query::Or(_)));
            }
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn not_compiles_to_and_not_of_match_all() {
        let query = dsl()
            .get_query(&serde_json::json!({"_not": {"tag": "rust"}}))
            .unwrap();
        match query {
            Query::AndNot(positive, _) => assert!(positive.is_match_all()),
            other => panic!("expected AND_NOT, got {other:?}"),
        }
    }

    #[test]
    fn text_fields_tokenize_and_support_wildcards() {
        let query = dsl()
            .get_query(&serde_json::json!({"title": "quick brow*"}))
            .unwrap();
        match query {
            Query::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], Query::Term { .. }));
                assert!(matches!(children[1], Query::Wildcard { .. }));
            }
            other => panic!("expected OR of tokens, got {other:?}"),
        }
    }

    #[test]
    fn range_compiles_to_source_plus_buckets() {
        let query = dsl()
            .get_query(&serde_json::json!({
                "n": {"_in": {"_range": {"_from": 237, "_to": 762}}}
            }))
            .unwrap();
        match query {
            Query::And(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], Query::ValueRange { slot: 12, .. }));
            }
            other => panic!("expected AND(buckets, source), got {other:?}"),
        }
    }

    #[test]
    fn open_range_is_source_only() {
        let query = dsl()
            .get_query(&serde_json::json!({
                "n": {"_in": {"_range": {"_from": 100}}}
            }))
            .unwrap();
        match query {
            Query::ValueRange { slot, start, end } => {
                assert_eq!(slot, 12);
                assert!(start.is_some());
                assert!(end.is_none());
            }
            other => panic!("expected bare source, got {other:?}"),
        }
    }

    #[test]
    fn geo_intersection_builds_posting_source() {
        let query = dsl()
            .get_query(&serde_json::json!({
                "place": {"_in": {"_geo_intersection": {"_polygon": {
                    "_latitude": [0.0, 0.0, 1.0, 1.0],
                    "_longitude": [0.0, 1.0, 1.0, 0.0],
                }}}}
            }))
            .unwrap();
        fn has_geo_source(query: &Query) -> bool {
            match query {
                Query::GeoRange { slot: 14, .. } => true,
                Query::And(children) => children.iter().any(has_geo_source),
                _ => false,
            }
        }
        assert!(has_geo_source(&query));
    }

    #[test]
    fn unknown_field_falls_back_to_namespace() {
        let query = dsl()
            .get_query(&serde_json::json!({"unknown.path": "value"}))
            .unwrap();
        match query {
            Query::Term { term, .. } => {
                assert!(term.starts_with(b"Y"));
            }
            other => panic!("expected namespace term, got {other:?}"),
        }
    }

    #[test]
    fn typed_mismatch_falls_back_to_namespace() {
        // "n" is an integer field; a non-numeric literal resolves against
        // the namespace interpretation instead of failing.
        let query = dsl().get_query(&serde_json::json!({"n": "abc"})).unwrap();
        assert!(matches!(query, Query::Term { .. }));
    }

    #[test]
    fn raw_expression_string_rewrites_to_object_form() {
        let rewritten = parse_expression("tag:foo AND title:(bar OR baz)").unwrap();
        assert_eq!(
            rewritten,
            serde_json::json!({"_and": [
                {"tag": "foo"},
                {"_or": [{"title": "bar"}, {"title": "baz"}]},
            ]})
        );

        let query = dsl()
            .get_query(&serde_json::json!("tag:foo AND title:(bar OR baz)"))
            .unwrap();
        assert!(matches!(query, Query::And(_)));
    }

    #[test]
    fn expression_ranges_and_not() {
        let rewritten = parse_expression("n:100..200 AND NOT tag:old").unwrap();
        assert_eq!(
            rewritten,
            serde_json::json!({"_and_not": [
                {"n": {"_in": {"_range": {"_from": 100, "_to": 200}}}},
                {"tag": "old"},
            ]})
        );
    }

    #[test]
    fn sorter_parses_order_and_metric() {
        let sorter = dsl()
            .get_sorter(&serde_json::json!(["-n", {"tag": {"_order": "asc", "_metric": "levenshtein", "_value": "rust"}}]))
            .unwrap();
        assert!(!sorter.is_empty());

        assert!(dsl().get_sorter(&serde_json::json!({"tag": {"_order": "sideways"}})).is_err());
    }

    #[test]
    fn accuracy_field_queries_one_bucket() {
        let query = dsl().get_query(&serde_json::json!({"n._100": 237})).unwrap();
        match query {
            Query::Term { term, .. } => {
                let expected = prefixed(
                    &sortable_serialise(200.0),
                    &schema().field("n").unwrap().acc_prefixes[1],
                    crate::schema::CTYPE_INTEGER,
                );
                assert_eq!(term, expected);
            }
            other => panic!("expected bucket term, got {other:?}"),
        }
    }

    #[test]
    fn malformed_operator_is_rejected() {
        assert!(matches!(
            dsl().get_query(&serde_json::json!({"_bogus": 1})),
            Err(Error::QueryDsl(_))
        ));
        assert!(matches!(
            dsl().get_query(&serde_json::json!({"n": {"_in": {"_range": {}}}})),
            Err(Error::QueryDsl(_))
        ));
    }
}
