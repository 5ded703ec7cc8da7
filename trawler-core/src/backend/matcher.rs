//! Query evaluation against one index.
//!
//! Weights follow the source semantics loosely: term matches contribute
//! their wqf, geo sources rank by proximity to the query centroids, pure
//! filters contribute nothing.

use std::collections::HashMap;

use crate::errors::Result;
use crate::geo::unserialise_ranges;
use crate::query::sort::KeyMaker;
use crate::query::Query;

use super::{DocId, Index};

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub docid: DocId,
    pub weight: f64,
    /// Composite sort key, present when a key maker ordered the results;
    /// lets a multi-shard merge keep the ordering without re-fetching.
    pub sort_key: Option<Vec<u8>>,
}

impl Index {
    pub fn search(
        &self,
        query: &Query,
        sort: Option<&KeyMaker>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Match>> {
        let weights = self.eval(query)?;
        let mut matches: Vec<Match> = weights
            .into_iter()
            .map(|(docid, weight)| Match {
                docid,
                weight,
                sort_key: None,
            })
            .collect();

        match sort {
            Some(key_maker) => {
                for m in &mut matches {
                    let doc = self.get_document(m.docid)?;
                    m.sort_key = Some(key_maker.key(&doc));
                }
                matches.sort_by(|a, b| {
                    a.sort_key
                        .cmp(&b.sort_key)
                        .then(a.docid.cmp(&b.docid))
                });
            }
            None => {
                matches.sort_by(|a, b| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.docid.cmp(&b.docid))
                });
            }
        }

        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    fn eval(&self, query: &Query) -> Result<HashMap<DocId, f64>> {
        Ok(match query {
            Query::MatchNothing => HashMap::new(),
            Query::MatchAll => self.documents().map(|(did, _)| (*did, 0.0)).collect(),
            Query::Term { term, wqf } => self
                .postlist(term)
                .into_iter()
                .map(|did| (did, f64::from(*wqf)))
                .collect(),
            Query::Wildcard { prefix } => {
                let mut out: HashMap<DocId, f64> = HashMap::new();
                for term in self.allterms(prefix) {
                    for did in self.postlist(&term) {
                        *out.entry(did).or_insert(0.0) += 1.0;
                    }
                }
                out
            }
            Query::And(children) => {
                let mut iter = children.iter();
                let mut acc = match iter.next() {
                    Some(q) => self.eval(q)?,
                    None => return Ok(HashMap::new()),
                };
                for q in iter {
                    let rhs = self.eval(q)?;
                    acc = acc
                        .into_iter()
                        .filter_map(|(did, w)| rhs.get(&did).map(|rw| (did, w + rw)))
                        .collect();
                    if acc.is_empty() {
                        break;
                    }
                }
                acc
            }
            Query::Or(children) | Query::Synonym(children) | Query::EliteSet(children) => {
                let mut acc: HashMap<DocId, f64> = HashMap::new();
                for q in children {
                    for (did, w) in self.eval(q)? {
                        *acc.entry(did).or_insert(0.0) += w;
                    }
                }
                acc
            }
            Query::Max(children) => {
                let mut acc: HashMap<DocId, f64> = HashMap::new();
                for q in children {
                    for (did, w) in self.eval(q)? {
                        let entry = acc.entry(did).or_insert(f64::MIN);
                        if w > *entry {
                            *entry = w;
                        }
                    }
                }
                acc
            }
            Query::Xor(children) => {
                let mut acc: HashMap<DocId, (f64, usize)> = HashMap::new();
                for q in children {
                    for (did, w) in self.eval(q)? {
                        let entry = acc.entry(did).or_insert((0.0, 0));
                        entry.0 += w;
                        entry.1 += 1;
                    }
                }
                acc.into_iter()
                    .filter_map(|(did, (w, n))| (n % 2 == 1).then_some((did, w)))
                    .collect()
            }
            Query::AndNot(positive, negative) => {
                let neg = self.eval(negative)?;
                self.eval(positive)?
                    .into_iter()
                    .filter(|(did, _)| !neg.contains_key(did))
                    .collect()
            }
            Query::AndMaybe(required, maybe) => {
                let extra = self.eval(maybe)?;
                self.eval(required)?
                    .into_iter()
                    .map(|(did, w)| (did, w + extra.get(&did).copied().unwrap_or(0.0)))
                    .collect()
            }
            Query::Filter(positive, filter) => {
                let allowed = self.eval(filter)?;
                self.eval(positive)?
                    .into_iter()
                    .filter(|(did, _)| allowed.contains_key(did))
                    .collect()
            }
            Query::ScaleWeight(factor, inner) => self
                .eval(inner)?
                .into_iter()
                .map(|(did, w)| (did, w * factor))
                .collect(),
            Query::ValueRange { slot, start, end } => {
                let mut out = HashMap::new();
                for (did, doc) in self.documents() {
                    let value = doc.get_value(*slot);
                    if value.is_empty() {
                        continue;
                    }
                    if let Some(start) = start {
                        if value.as_slice() < start.as_slice() {
                            continue;
                        }
                    }
                    if let Some(end) = end {
                        if value.as_slice() > end.as_slice() {
                            continue;
                        }
                    }
                    out.insert(*did, 0.0);
                }
                out
            }
            Query::GeoRange {
                slot,
                ranges,
                centroids,
            } => {
                let mut out = HashMap::new();
                for (did, doc) in self.documents() {
                    let value = doc.get_value(*slot);
                    if value.is_empty() {
                        continue;
                    }
                    let (doc_ranges, doc_centroids) = match unserialise_ranges(&value) {
                        Ok(parsed) => parsed,
                        Err(_) => continue,
                    };
                    let intersects = doc_ranges
                        .iter()
                        .any(|dr| ranges.iter().any(|qr| qr.intersects(dr)));
                    if !intersects {
                        continue;
                    }
                    let mut min_angle = std::f64::consts::PI;
                    for qc in centroids {
                        for dc in &doc_centroids {
                            let angle = qc.angle_to(dc);
                            if angle < min_angle {
                                min_angle = angle;
                            }
                        }
                    }
                    out.insert(*did, std::f64::consts::PI - min_angle);
                }
                out
            }
        })
    }
}
