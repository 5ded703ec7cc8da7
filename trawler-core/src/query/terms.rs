//! Accuracy-bucket term generation.
//!
//! Range-heavy types (numbers, dates, times, geo) index one extra term per
//! configured accuracy level marking the bucket the value falls into.
//! Range queries then cover the interior with coarse-bucket terms and the
//! endpoints with finer ones, bounded by `MAX_TERMS`, and AND the result
//! with a narrowing value posting source for exactness.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::backend::Document;
use crate::geo::{id_trixels, trixel_depth, TrixelRange, HTM_START_POS};
use crate::query::Query;
use crate::schema::{timestamp_of, UnitTime, CTYPE_DATE, CTYPE_GEO, CTYPE_INTEGER};
use crate::serialise::{prefixed, serialise_positive, sortable_serialise};

/// Cap on the number of bucket terms a range may expand into per level.
pub const MAX_TERMS: usize = 50;

/// Euclidean modulus: the result carries the divisor's sign convention of
/// always-non-negative, so bucket starts round toward negative infinity.
pub fn modulus(value: i64, acc: i64) -> i64 {
    ((value % acc) + acc) % acc
}

// ---------------------------------------------------------------------
// Index side

pub fn numeric_terms(doc: &mut Document, accuracy: &[u64], acc_prefixes: &[Vec<u8>], value: i64) {
    for (acc, prefix) in accuracy.iter().zip(acc_prefixes) {
        let bucket = value - modulus(value, *acc as i64);
        let term = sortable_serialise(bucket as f64);
        doc.add_term(prefixed(&term, prefix, CTYPE_INTEGER));
    }
}

pub fn date(
    doc: &mut Document,
    accuracy: &[UnitTime],
    acc_prefixes: &[Vec<u8>],
    dt: &DateTime<Utc>,
) {
    for (unit, prefix) in accuracy.iter().zip(acc_prefixes) {
        let bucket = truncate(*unit, dt);
        let term = sortable_serialise(timestamp_of(&bucket));
        doc.add_term(prefixed(&term, prefix, CTYPE_DATE));
    }
}

pub fn geo(doc: &mut Document, accuracy: &[u64], acc_prefixes: &[Vec<u8>], ranges: &[TrixelRange]) {
    let mut level_terms: Vec<BTreeSet<u64>> = vec![BTreeSet::new(); accuracy.len()];
    for id in id_trixels(ranges) {
        let depth = trixel_depth(id);
        let val = id << (HTM_START_POS - depth * 2);
        for (pos, level) in accuracy.iter().enumerate() {
            if *level as u32 <= depth {
                level_terms[pos].insert(val >> (HTM_START_POS - (*level as u32) * 2));
            }
        }
    }
    for (terms, prefix) in level_terms.iter().zip(acc_prefixes) {
        for term in terms {
            doc.add_term(prefixed(&serialise_positive(*term), prefix, CTYPE_GEO));
        }
    }
}

// ---------------------------------------------------------------------
// Query side

fn numeric_term(bucket: i64, prefix: &[u8]) -> Query {
    Query::Term {
        term: prefixed(&sortable_serialise(bucket as f64), prefix, CTYPE_INTEGER),
        wqf: 1,
    }
}

/// Two-level bucket cover for `[lo, hi]`: interior coarse buckets ORed,
/// partially-covered edge buckets narrowed by the finer level. Returns
/// `None` when every level would exceed `MAX_TERMS`; the caller then
/// relies on the posting source alone.
pub fn numeric(lo: i64, hi: i64, accuracy: &[u64], acc_prefixes: &[Vec<u8>]) -> Option<Query> {
    if accuracy.is_empty() || hi < lo {
        return None;
    }

    // Coarsest level whose expansion stays within the cap.
    let mut coarse_pos = None;
    for pos in (0..accuracy.len()).rev() {
        let acc = accuracy[pos] as i64;
        let lo_bucket = lo - modulus(lo, acc);
        let hi_bucket = hi - modulus(hi, acc);
        let count = ((hi_bucket - lo_bucket) / acc + 1) as usize;
        if count <= MAX_TERMS {
            coarse_pos = Some(pos);
            break;
        }
    }
    let coarse_pos = coarse_pos?;
    let coarse_acc = accuracy[coarse_pos] as i64;
    let coarse_prefix = &acc_prefixes[coarse_pos];

    let lo_bucket = lo - modulus(lo, coarse_acc);
    let hi_bucket = hi - modulus(hi, coarse_acc);

    let fine = (coarse_pos > 0).then(|| {
        (
            accuracy[coarse_pos - 1] as i64,
            &acc_prefixes[coarse_pos - 1],
        )
    });

    let covered = |bucket: i64| bucket >= lo && bucket + coarse_acc - 1 <= hi;

    // Narrow a partially covered coarse bucket with fine-level terms when
    // that stays within the cap; fall back to the bare coarse term (the
    // value posting source keeps the result exact either way).
    let edge = |bucket: i64, from: i64, to: i64| -> Query {
        let coarse_term = numeric_term(bucket, coarse_prefix);
        if let Some((fine_acc, fine_prefix)) = &fine {
            let first = from - modulus(from, *fine_acc);
            let count = ((to - modulus(to, *fine_acc) - first) / fine_acc + 1) as usize;
            if count <= MAX_TERMS {
                let mut fine_terms = Vec::with_capacity(count);
                let mut start = first;
                while start <= to {
                    fine_terms.push(numeric_term(start, fine_prefix));
                    start += fine_acc;
                }
                return Query::and(vec![coarse_term, Query::or(fine_terms)]);
            }
        }
        coarse_term
    };

    let mut parts = Vec::new();
    if lo_bucket == hi_bucket && !covered(lo_bucket) {
        parts.push(edge(lo_bucket, lo, hi));
    } else {
        if !covered(lo_bucket) {
            parts.push(edge(lo_bucket, lo, lo_bucket + coarse_acc - 1));
        }
        let mut bucket = lo_bucket;
        while bucket <= hi_bucket {
            if covered(bucket) {
                parts.push(numeric_term(bucket, coarse_prefix));
            }
            bucket += coarse_acc;
        }
        if hi_bucket != lo_bucket && !covered(hi_bucket) {
            parts.push(edge(hi_bucket, hi_bucket, hi));
        }
    }
    Some(Query::or(parts))
}

/// Calendar-bucketed variant of [`numeric`].
pub fn date_range(
    from: &DateTime<Utc>,
    to: &DateTime<Utc>,
    accuracy: &[UnitTime],
    acc_prefixes: &[Vec<u8>],
) -> Option<Query> {
    if accuracy.is_empty() || to < from {
        return None;
    }

    // Units ordered fine to coarse, keeping their prefixes attached.
    let mut levels: Vec<(UnitTime, &Vec<u8>)> = accuracy
        .iter()
        .copied()
        .zip(acc_prefixes)
        .collect();
    levels.sort_by(|a, b| {
        a.0.span_secs()
            .partial_cmp(&b.0.span_secs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut coarse_pos = None;
    for pos in (0..levels.len()).rev() {
        if let Some(buckets) = buckets_between(levels[pos].0, from, to, MAX_TERMS) {
            if !buckets.is_empty() {
                coarse_pos = Some(pos);
                break;
            }
        }
    }
    let coarse_pos = coarse_pos?;
    let (coarse_unit, coarse_prefix) = levels[coarse_pos];
    let fine = (coarse_pos > 0).then(|| levels[coarse_pos - 1]);

    let date_term = |bucket: &DateTime<Utc>, prefix: &[u8]| Query::Term {
        term: prefixed(&sortable_serialise(timestamp_of(bucket)), prefix, CTYPE_DATE),
        wqf: 1,
    };

    let edge = |bucket: &DateTime<Utc>, from: &DateTime<Utc>, to: &DateTime<Utc>| -> Query {
        let coarse_term = date_term(bucket, coarse_prefix);
        if let Some((fine_unit, fine_prefix)) = fine {
            if let Some(fine_buckets) = buckets_between(fine_unit, from, to, MAX_TERMS) {
                let fine_terms: Vec<Query> = fine_buckets
                    .iter()
                    .map(|b| date_term(b, fine_prefix))
                    .collect();
                return Query::and(vec![coarse_term, Query::or(fine_terms)]);
            }
        }
        coarse_term
    };

    let coarse_buckets = buckets_between(coarse_unit, from, to, MAX_TERMS)?;
    let covered = |bucket: &DateTime<Utc>| {
        *bucket >= *from && step(coarse_unit, bucket) <= step(UnitTime::Second, to)
    };

    let mut parts = Vec::new();
    let first = coarse_buckets.first().cloned()?;
    let last = coarse_buckets.last().cloned()?;
    if first == last && !covered(&first) {
        parts.push(edge(&first, from, to));
    } else {
        for bucket in &coarse_buckets {
            if covered(bucket) {
                parts.push(date_term(bucket, coarse_prefix));
            } else if *bucket == first {
                let until = step(coarse_unit, bucket);
                parts.push(edge(bucket, from, &until.min(*to)));
            } else if *bucket == last {
                parts.push(edge(bucket, bucket, to));
            }
        }
    }
    Some(Query::or(parts))
}

/// Projection of the query shape's trixels onto the configured accuracy
/// levels, mirroring the coarse/fine narrowing of the numeric path.
pub fn geo_query(
    ranges: &[TrixelRange],
    accuracy: &[u64],
    acc_prefixes: &[Vec<u8>],
) -> Option<Query> {
    if accuracy.is_empty() || ranges.is_empty() {
        return None;
    }

    let mut level_terms: Vec<BTreeSet<u64>> = vec![BTreeSet::new(); accuracy.len()];
    for id in id_trixels(ranges) {
        let depth = trixel_depth(id);
        let val = id << (HTM_START_POS - depth * 2);
        // Finest accuracy level at or above this trixel.
        if let Some(pos) = accuracy.iter().rposition(|&level| level as u32 <= depth) {
            level_terms[pos].insert(val >> (HTM_START_POS - (accuracy[pos] as u32) * 2));
        }
    }
    if level_terms.iter().all(BTreeSet::is_empty) {
        return None;
    }

    // Project finer terms up so the coarsest populated set covers all.
    for pos in (1..level_terms.len()).rev() {
        let shift = (accuracy[pos] - accuracy[pos - 1]) as u32 * 2;
        let finer: Vec<u64> = level_terms[pos].iter().copied().collect();
        for term in finer {
            level_terms[pos - 1].insert(term >> shift);
        }
    }

    let geo_term = |id: u64, prefix: &[u8]| Query::Term {
        term: prefixed(&serialise_positive(id), prefix, CTYPE_GEO),
        wqf: 1,
    };

    let upper = &level_terms[0];
    if upper.is_empty() || upper.len() >= MAX_TERMS {
        return None;
    }
    let upper_query = Query::or(
        upper
            .iter()
            .map(|id| geo_term(*id, &acc_prefixes[0]))
            .collect(),
    );

    let lower_pos = (1..level_terms.len()).find(|&pos| !level_terms[pos].is_empty());
    match lower_pos {
        None => Some(upper_query),
        Some(pos) => {
            let lower = &level_terms[pos];
            if lower.len() == upper.len() {
                // Every coarse term has exactly one finer refinement; the
                // finer terms alone are tighter.
                Some(Query::or(
                    lower
                        .iter()
                        .map(|id| geo_term(*id, &acc_prefixes[pos]))
                        .collect(),
                ))
            } else if lower.len() < MAX_TERMS {
                let lower_query = Query::or(
                    lower
                        .iter()
                        .map(|id| geo_term(*id, &acc_prefixes[pos]))
                        .collect(),
                );
                Some(Query::and(vec![upper_query, lower_query]))
            } else {
                Some(upper_query)
            }
        }
    }
}

// ---------------------------------------------------------------------
// Calendar arithmetic

/// Start of the bucket containing `dt` at the given unit.
pub fn truncate(unit: UnitTime, dt: &DateTime<Utc>) -> DateTime<Utc> {
    let year = dt.year();
    let trunc_year = |span: i32| year - year.rem_euclid(span);
    match unit {
        UnitTime::Millennium => ymd(trunc_year(1000), 1, 1),
        UnitTime::Century => ymd(trunc_year(100), 1, 1),
        UnitTime::Decade => ymd(trunc_year(10), 1, 1),
        UnitTime::Year => ymd(year, 1, 1),
        UnitTime::Month => ymd(year, dt.month(), 1),
        UnitTime::Day => ymd(year, dt.month(), dt.day()),
        UnitTime::Hour => ymd(year, dt.month(), dt.day())
            + chrono::Duration::hours(i64::from(dt.hour())),
        UnitTime::Minute => {
            ymd(year, dt.month(), dt.day())
                + chrono::Duration::hours(i64::from(dt.hour()))
                + chrono::Duration::minutes(i64::from(dt.minute()))
        }
        UnitTime::Second => {
            ymd(year, dt.month(), dt.day())
                + chrono::Duration::hours(i64::from(dt.hour()))
                + chrono::Duration::minutes(i64::from(dt.minute()))
                + chrono::Duration::seconds(i64::from(dt.second()))
        }
    }
}

/// Start of the next bucket.
pub fn step(unit: UnitTime, dt: &DateTime<Utc>) -> DateTime<Utc> {
    match unit {
        UnitTime::Millennium => ymd(dt.year() + 1000, 1, 1),
        UnitTime::Century => ymd(dt.year() + 100, 1, 1),
        UnitTime::Decade => ymd(dt.year() + 10, 1, 1),
        UnitTime::Year => ymd(dt.year() + 1, 1, 1),
        UnitTime::Month => {
            if dt.month() == 12 {
                ymd(dt.year() + 1, 1, 1)
            } else {
                ymd(dt.year(), dt.month() + 1, 1)
            }
        }
        UnitTime::Day => *dt + chrono::Duration::days(1),
        UnitTime::Hour => *dt + chrono::Duration::hours(1),
        UnitTime::Minute => *dt + chrono::Duration::minutes(1),
        UnitTime::Second => *dt + chrono::Duration::seconds(1),
    }
}

fn ymd(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .expect("valid calendar date")
}

/// Bucket starts of `unit` touching `[from, to]`, or `None` past the cap.
fn buckets_between(
    unit: UnitTime,
    from: &DateTime<Utc>,
    to: &DateTime<Utc>,
    cap: usize,
) -> Option<Vec<DateTime<Utc>>> {
    let mut out = Vec::new();
    let mut bucket = truncate(unit, from);
    while bucket <= *to {
        if out.len() >= cap {
            return None;
        }
        out.push(bucket);
        bucket = step(unit, &bucket);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};

    fn collect_terms(query: &Query, out: &mut Vec<Vec<u8>>) {
        match query {
            Query::Term { term, .. } => out.push(term.clone()),
            Query::And(children) | Query::Or(children) => {
                for child in children {
                    collect_terms(child, out);
                }
            }
            _ => {}
        }
    }

    #[test]
    fn bucket_term_matches_value_modulo_accuracy() {
        let spec = FieldSpec::new("n", FieldType::Integer, 10).with_accuracy(vec![10, 100]);
        let mut doc = Document::new();
        numeric_terms(&mut doc, &spec.accuracy, &spec.acc_prefixes, 237);

        let fine = prefixed(
            &sortable_serialise(230.0),
            &spec.acc_prefixes[0],
            CTYPE_INTEGER,
        );
        let coarse = prefixed(
            &sortable_serialise(200.0),
            &spec.acc_prefixes[1],
            CTYPE_INTEGER,
        );
        assert!(doc.has_term(&fine));
        assert!(doc.has_term(&coarse));
        assert_eq!(doc.term_count(), 2);
    }

    #[test]
    fn negative_values_round_toward_negative_infinity() {
        assert_eq!(modulus(-7, 10), 3);
        let spec = FieldSpec::new("n", FieldType::Integer, 10).with_accuracy(vec![10]);
        let mut doc = Document::new();
        numeric_terms(&mut doc, &spec.accuracy, &spec.acc_prefixes, -7);
        let term = prefixed(
            &sortable_serialise(-10.0),
            &spec.acc_prefixes[0],
            CTYPE_INTEGER,
        );
        assert!(doc.has_term(&term));
    }

    #[test]
    fn numeric_range_uses_both_levels() {
        let spec = FieldSpec::new("n", FieldType::Integer, 10).with_accuracy(vec![10, 100]);
        let query = numeric(237, 762, &spec.accuracy, &spec.acc_prefixes).unwrap();

        let mut terms = Vec::new();
        collect_terms(&query, &mut terms);
        let coarse_interior = prefixed(
            &sortable_serialise(300.0),
            &spec.acc_prefixes[1],
            CTYPE_INTEGER,
        );
        let fine_left = prefixed(
            &sortable_serialise(230.0),
            &spec.acc_prefixes[0],
            CTYPE_INTEGER,
        );
        let fine_right = prefixed(
            &sortable_serialise(760.0),
            &spec.acc_prefixes[0],
            CTYPE_INTEGER,
        );
        assert!(terms.contains(&coarse_interior));
        assert!(terms.contains(&fine_left));
        assert!(terms.contains(&fine_right));
        // The interior never expands at the fine level.
        let fine_mid = prefixed(
            &sortable_serialise(500.0),
            &spec.acc_prefixes[0],
            CTYPE_INTEGER,
        );
        assert!(!terms.contains(&fine_mid));
    }

    #[test]
    fn oversized_range_degrades_to_posting_source_only() {
        let spec = FieldSpec::new("n", FieldType::Integer, 10).with_accuracy(vec![10]);
        assert!(numeric(0, 10_000, &spec.accuracy, &spec.acc_prefixes).is_none());
    }

    #[test]
    fn date_buckets_per_level() {
        let spec = FieldSpec::new("d", FieldType::Date, 11).with_date_accuracy(vec![
            UnitTime::Year,
            UnitTime::Month,
            UnitTime::Day,
        ]);
        let dt = crate::schema::parse_datetime(&serde_json::json!("2020-03-14 15:09:26")).unwrap();
        let mut doc = Document::new();
        date(&mut doc, &spec.date_accuracy, &spec.acc_prefixes, &dt);

        let year_start = crate::schema::parse_datetime(&serde_json::json!("2020-01-01")).unwrap();
        let month_start = crate::schema::parse_datetime(&serde_json::json!("2020-03-01")).unwrap();
        let day_start = crate::schema::parse_datetime(&serde_json::json!("2020-03-14")).unwrap();
        for (bucket, prefix) in [
            (year_start, &spec.acc_prefixes[0]),
            (month_start, &spec.acc_prefixes[1]),
            (day_start, &spec.acc_prefixes[2]),
        ] {
            let term = prefixed(
                &sortable_serialise(timestamp_of(&bucket)),
                prefix,
                CTYPE_DATE,
            );
            assert!(doc.has_term(&term));
        }
    }

    #[test]
    fn date_range_spanning_months() {
        let spec = FieldSpec::new("d", FieldType::Date, 11)
            .with_date_accuracy(vec![UnitTime::Month, UnitTime::Day]);
        let from = crate::schema::parse_datetime(&serde_json::json!("2020-01-20")).unwrap();
        let to = crate::schema::parse_datetime(&serde_json::json!("2020-03-10")).unwrap();
        let query = date_range(&from, &to, &spec.date_accuracy, &spec.acc_prefixes).unwrap();

        let mut terms = Vec::new();
        collect_terms(&query, &mut terms);
        // February is fully covered at month level.
        let feb = crate::schema::parse_datetime(&serde_json::json!("2020-02-01")).unwrap();
        let month_prefix = &spec.acc_prefixes[0];
        let feb_term = prefixed(&sortable_serialise(timestamp_of(&feb)), month_prefix, CTYPE_DATE);
        assert!(terms.contains(&feb_term));
    }

    #[test]
    fn geo_projection_preserves_parentage() {
        let shape = crate::geo::Shape::circle(10.0, 10.0, 20_000.0);
        let ranges = shape.trixel_ranges(true, 15);
        let accuracy = vec![5u64, 10, 15];
        let prefixes: Vec<Vec<u8>> = accuracy
            .iter()
            .map(|l| crate::schema::accuracy_prefix("geo", &format!("_geo{l}")))
            .collect();

        let mut doc = Document::new();
        geo(&mut doc, &accuracy, &prefixes, &ranges);
        assert!(doc.term_count() > 0);

        let query = geo_query(&ranges, &accuracy, &prefixes);
        assert!(query.is_some());
    }
}
