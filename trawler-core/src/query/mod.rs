//! Query tree handed to the backend matcher.
//!
//! The DSL compiler produces this tree; value posting sources are plain
//! enum variants the matcher dispatches on.

pub mod dsl;
pub mod sort;
pub mod terms;

use crate::backend::Term;
use crate::geo::{Cartesian, TrixelRange};

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    MatchNothing,
    Term {
        term: Term,
        wqf: u32,
    },
    /// Expanded against the term dictionary at match time.
    Wildcard {
        prefix: Term,
    },
    And(Vec<Query>),
    Or(Vec<Query>),
    Xor(Vec<Query>),
    AndNot(Box<Query>, Box<Query>),
    AndMaybe(Box<Query>, Box<Query>),
    Filter(Box<Query>, Box<Query>),
    Max(Vec<Query>),
    Synonym(Vec<Query>),
    EliteSet(Vec<Query>),
    ScaleWeight(f64, Box<Query>),
    /// Slot range over sortable-serialised values; `None` bounds make this
    /// a greater-equal or less-equal source.
    ValueRange {
        slot: u32,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    },
    /// Geospatial source: documents whose indexed trixel ranges intersect
    /// the query ranges, ranked by angular distance to the centroids.
    GeoRange {
        slot: u32,
        ranges: Vec<TrixelRange>,
        centroids: Vec<Cartesian>,
    },
}

impl Query {
    pub fn term(term: impl Into<Term>) -> Query {
        Query::Term {
            term: term.into(),
            wqf: 1,
        }
    }

    pub fn is_match_nothing(&self) -> bool {
        matches!(self, Query::MatchNothing)
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, Query::MatchAll)
    }

    /// Variadic AND, collapsing trivial cases.
    pub fn and(mut children: Vec<Query>) -> Query {
        children.retain(|q| !q.is_match_all());
        if children.iter().any(Query::is_match_nothing) {
            return Query::MatchNothing;
        }
        match children.len() {
            0 => Query::MatchAll,
            1 => children.pop().unwrap(),
            _ => Query::And(children),
        }
    }

    /// Variadic OR, collapsing trivial cases.
    pub fn or(mut children: Vec<Query>) -> Query {
        children.retain(|q| !q.is_match_nothing());
        match children.len() {
            0 => Query::MatchNothing,
            1 => children.pop().unwrap(),
            _ => Query::Or(children),
        }
    }

    /// Counts the leaf term queries, used to bound accuracy expansion.
    pub fn term_count(&self) -> usize {
        match self {
            Query::Term { .. } | Query::Wildcard { .. } => 1,
            Query::And(c) | Query::Or(c) | Query::Xor(c) | Query::Max(c) | Query::Synonym(c)
            | Query::EliteSet(c) => c.iter().map(Query::term_count).sum(),
            Query::AndNot(a, b) | Query::AndMaybe(a, b) | Query::Filter(a, b) => {
                a.term_count() + b.term_count()
            }
            Query::ScaleWeight(_, q) => q.term_count(),
            _ => 0,
        }
    }
}
