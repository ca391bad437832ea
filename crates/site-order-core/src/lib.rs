use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::num::NonZeroI64;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OrderError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl OrderError {
    /// Message without the category prefix, suitable for a client-facing body.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidRequest(message) | Self::PersistenceFailure(message) => message,
        }
    }

    #[must_use]
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

/// User-orderable collections of site content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    Partners,
    Missions,
    HeroSlides,
    Products,
    SocialLinks,
}

impl Collection {
    pub const ALL: [Self; 5] =
        [Self::Partners, Self::Missions, Self::HeroSlides, Self::Products, Self::SocialLinks];

    /// Wire name used in URLs and on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partners => "partners",
            Self::Missions => "missions",
            Self::HeroSlides => "hero-slides",
            Self::Products => "products",
            Self::SocialLinks => "social-links",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "partners" => Some(Self::Partners),
            "missions" => Some(Self::Missions),
            "hero-slides" => Some(Self::HeroSlides),
            "products" => Some(Self::Products),
            "social-links" => Some(Self::SocialLinks),
            _ => None,
        }
    }

    /// Human-readable plural used in messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Partners => "partners",
            Self::Missions => "missions",
            Self::HeroSlides => "hero slides",
            Self::Products => "products",
            Self::SocialLinks => "social links",
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Partners => "partners",
            Self::Missions => "missions",
            Self::HeroSlides => "hero_slides",
            Self::Products => "products",
            Self::SocialLinks => "social_links",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = OrderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| OrderError::InvalidRequest(format!("unknown collection: {value}")))
    }
}

/// Record identifier within one collection. Zero is the "unset" sentinel and
/// cannot be represented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(NonZeroI64);

impl RecordId {
    #[must_use]
    pub fn new(raw: i64) -> Option<Self> {
        NonZeroI64::new(raw).map(Self)
    }

    #[must_use]
    pub fn get(self) -> i64 {
        self.0.get()
    }

    /// Interpret a JSON value as an identifier. Only non-zero integers qualify;
    /// `null`, `0`, strings, booleans and fractional numbers do not.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        value.as_i64().and_then(Self::new)
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = OrderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| OrderError::InvalidRequest(format!("invalid record id: {value}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl Rank {
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Display for Rank {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderedRecord {
    pub id: RecordId,
    pub title: String,
    pub rank: Rank,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A single pending write: `rank(id) = rank`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct RankAssignment {
    pub id: RecordId,
    pub rank: Rank,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderReport {
    pub records: usize,
    pub duplicate_ranks: Vec<Rank>,
    pub missing_ranks: Vec<Rank>,
    pub dense: bool,
}

/// Normalize a record title.
///
/// # Errors
/// Returns [`OrderError::InvalidRequest`] when the title is blank or longer than
/// [`MAX_TITLE_CHARS`].
pub fn normalize_title(title: &str) -> Result<String, OrderError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(OrderError::InvalidRequest("title MUST be non-empty".to_string()));
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(OrderError::InvalidRequest(format!(
            "title MUST be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// In-memory view of one collection's ranks.
///
/// Every mutation validates its input against the current membership, applies
/// itself, and returns only the assignments whose rank actually changed so a
/// store can persist the difference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankTable {
    ranks: BTreeMap<RecordId, Rank>,
}

impl FromIterator<(RecordId, Rank)> for RankTable {
    fn from_iter<I: IntoIterator<Item = (RecordId, Rank)>>(iter: I) -> Self {
        Self { ranks: iter.into_iter().collect() }
    }
}

impl RankTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    #[must_use]
    pub fn rank(&self, id: RecordId) -> Option<Rank> {
        self.ranks.get(&id).copied()
    }

    /// Ids in presentation order; equal ranks fall back to id order.
    #[must_use]
    pub fn ordered_ids(&self) -> Vec<RecordId> {
        let mut entries = self.ranks.iter().map(|(id, rank)| (*rank, *id)).collect::<Vec<_>>();
        entries.sort_unstable();
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Assign rank `i` to `ids[i]`.
    ///
    /// # Errors
    /// Returns [`OrderError::InvalidRequest`] when `ids` repeats an id, names an id
    /// outside the collection, or omits a member of the collection. Nothing is
    /// applied in that case.
    pub fn reindex(&mut self, ids: &[RecordId]) -> Result<Vec<RankAssignment>, OrderError> {
        let mut seen = BTreeSet::new();
        for id in ids {
            if !seen.insert(*id) {
                return Err(OrderError::InvalidRequest(format!("ids contains duplicate id {id}")));
            }
            if !self.ranks.contains_key(id) {
                return Err(OrderError::InvalidRequest(format!(
                    "id {id} is not part of the collection"
                )));
            }
        }
        if let Some(omitted) = self.ranks.keys().find(|id| !seen.contains(*id)) {
            return Err(OrderError::InvalidRequest(format!(
                "ids MUST list every record of the collection; id {omitted} is missing"
            )));
        }

        let mut targets = Vec::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            let rank = u32::try_from(position).map_err(|_| {
                OrderError::InvalidRequest("ids exceeds the maximum collection size".to_string())
            })?;
            targets.push(RankAssignment { id: *id, rank: Rank(rank) });
        }

        Ok(self.apply(targets))
    }

    /// Exchange the ranks of `a` and `b`. Swapping a record with itself is a no-op.
    ///
    /// # Errors
    /// Returns [`OrderError::PersistenceFailure`] when either id is not a member.
    pub fn swap(&mut self, a: RecordId, b: RecordId) -> Result<Vec<RankAssignment>, OrderError> {
        let rank_a = self.require(a)?;
        let rank_b = self.require(b)?;
        if a == b {
            return Ok(Vec::new());
        }
        Ok(self.apply(vec![
            RankAssignment { id: a, rank: rank_b },
            RankAssignment { id: b, rank: rank_a },
        ]))
    }

    /// Renumber to `0..n-1` keeping the current presentation order.
    pub fn compact(&mut self) -> Vec<RankAssignment> {
        let targets = self
            .ordered_ids()
            .into_iter()
            .zip(0_u32..)
            .map(|(id, rank)| RankAssignment { id, rank: Rank(rank) })
            .collect();
        self.apply(targets)
    }

    #[must_use]
    pub fn report(&self) -> OrderReport {
        let mut counts: BTreeMap<Rank, usize> = BTreeMap::new();
        for rank in self.ranks.values() {
            *counts.entry(*rank).or_default() += 1;
        }
        let duplicate_ranks =
            counts.iter().filter(|(_, count)| **count > 1).map(|(rank, _)| *rank).collect::<Vec<_>>();
        let missing_ranks = (0_u32..)
            .take(self.ranks.len())
            .map(Rank)
            .filter(|rank| !counts.contains_key(rank))
            .collect::<Vec<_>>();
        let dense = duplicate_ranks.is_empty() && missing_ranks.is_empty();

        OrderReport { records: self.ranks.len(), duplicate_ranks, missing_ranks, dense }
    }

    fn require(&self, id: RecordId) -> Result<Rank, OrderError> {
        self.rank(id)
            .ok_or_else(|| OrderError::PersistenceFailure(format!("record {id} does not exist")))
    }

    fn apply(&mut self, targets: Vec<RankAssignment>) -> Vec<RankAssignment> {
        let changed = targets
            .into_iter()
            .filter(|assignment| self.ranks.get(&assignment.id) != Some(&assignment.rank))
            .collect::<Vec<_>>();
        for assignment in &changed {
            self.ranks.insert(assignment.id, assignment.rank);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(raw: i64) -> RecordId {
        match RecordId::new(raw) {
            Some(id) => id,
            None => panic!("fixture id must be non-zero: {raw}"),
        }
    }

    fn table(entries: &[(i64, u32)]) -> RankTable {
        entries.iter().map(|(raw, rank)| (id(*raw), Rank(*rank))).collect()
    }

    #[test]
    fn reindex_then_swap_follows_documented_scenario() -> Result<(), OrderError> {
        let (a, b, c) = (id(1), id(2), id(3));
        let mut ranks = table(&[(1, 0), (2, 1), (3, 2)]);

        ranks.reindex(&[c, a, b])?;
        assert_eq!(ranks.rank(c), Some(Rank(0)));
        assert_eq!(ranks.rank(a), Some(Rank(1)));
        assert_eq!(ranks.rank(b), Some(Rank(2)));

        ranks.swap(c, b)?;
        assert_eq!(ranks.rank(c), Some(Rank(2)));
        assert_eq!(ranks.rank(a), Some(Rank(1)));
        assert_eq!(ranks.rank(b), Some(Rank(0)));
        Ok(())
    }

    #[test]
    fn reindex_returns_only_changed_assignments() -> Result<(), OrderError> {
        let mut ranks = table(&[(1, 0), (2, 1), (3, 2)]);
        let changed = ranks.reindex(&[id(1), id(3), id(2)])?;
        assert_eq!(
            changed,
            vec![
                RankAssignment { id: id(3), rank: Rank(1) },
                RankAssignment { id: id(2), rank: Rank(2) },
            ]
        );
        Ok(())
    }

    #[test]
    fn reindex_rejects_duplicates_unknown_and_omitted_ids_without_applying() {
        let original = table(&[(1, 0), (2, 1), (3, 2)]);

        let mut ranks = original.clone();
        let err = ranks.reindex(&[id(1), id(1), id(2)]);
        assert!(matches!(err, Err(OrderError::InvalidRequest(ref msg)) if msg.contains("duplicate")));
        assert_eq!(ranks, original);

        let err = ranks.reindex(&[id(1), id(2), id(3), id(9)]);
        assert!(matches!(err, Err(OrderError::InvalidRequest(ref msg)) if msg.contains("id 9")));
        assert_eq!(ranks, original);

        let err = ranks.reindex(&[id(3), id(1)]);
        assert!(matches!(err, Err(OrderError::InvalidRequest(ref msg)) if msg.contains("id 2 is missing")));
        assert_eq!(ranks, original);
    }

    #[test]
    fn empty_reindex_is_valid_only_for_empty_collection() {
        let mut empty = RankTable::new();
        assert_eq!(empty.reindex(&[]), Ok(Vec::new()));

        let mut ranks = table(&[(4, 0)]);
        assert!(matches!(ranks.reindex(&[]), Err(OrderError::InvalidRequest(_))));
    }

    #[test]
    fn swap_with_self_is_noop_but_requires_membership() -> Result<(), OrderError> {
        let mut ranks = table(&[(1, 0), (2, 1)]);
        assert!(ranks.swap(id(2), id(2))?.is_empty());
        assert_eq!(ranks.rank(id(2)), Some(Rank(1)));

        let err = ranks.swap(id(5), id(5));
        assert!(matches!(err, Err(OrderError::PersistenceFailure(_))));
        Ok(())
    }

    #[test]
    fn swap_with_unknown_id_is_persistence_failure() {
        let mut ranks = table(&[(1, 0), (2, 1)]);
        let err = ranks.swap(id(1), id(42));
        assert_eq!(err, Err(OrderError::PersistenceFailure("record 42 does not exist".to_string())));
        assert_eq!(ranks.rank(id(1)), Some(Rank(0)));
    }

    #[test]
    fn compact_closes_gaps_and_breaks_ties_by_id() {
        let mut ranks = table(&[(7, 4), (3, 4), (5, 9), (1, 0)]);
        let report = ranks.report();
        assert!(!report.dense);
        assert_eq!(report.duplicate_ranks, vec![Rank(4)]);
        assert_eq!(report.missing_ranks, vec![Rank(1), Rank(2), Rank(3)]);

        ranks.compact();
        assert_eq!(ranks.ordered_ids(), vec![id(1), id(3), id(7), id(5)]);
        assert!(ranks.report().dense);
        assert!(ranks.compact().is_empty());
    }

    #[test]
    fn record_id_rejects_zero_and_non_integers() {
        assert_eq!(RecordId::new(0), None);
        assert_eq!(RecordId::from_json(&serde_json::json!(0)), None);
        assert_eq!(RecordId::from_json(&Value::Null), None);
        assert_eq!(RecordId::from_json(&serde_json::json!("3")), None);
        assert_eq!(RecordId::from_json(&serde_json::json!(1.5)), None);
        assert_eq!(RecordId::from_json(&serde_json::json!(3)), Some(id(3)));
        assert!("0".parse::<RecordId>().is_err());
        assert_eq!(" 12 ".parse::<RecordId>(), Ok(id(12)));
    }

    #[test]
    fn collection_names_round_trip_and_unknown_is_rejected() {
        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.as_str()), Some(collection));
        }
        assert_eq!(Collection::HeroSlides.label(), "hero slides");
        assert_eq!(Collection::SocialLinks.table(), "social_links");
        assert!(matches!("cta".parse::<Collection>(), Err(OrderError::InvalidRequest(_))));
    }

    #[test]
    fn normalize_title_trims_and_bounds_length() {
        assert_eq!(normalize_title("  Acme  "), Ok("Acme".to_string()));
        assert!(normalize_title("   ").is_err());
        assert!(normalize_title(&"x".repeat(MAX_TITLE_CHARS + 1)).is_err());
    }

    fn shuffled_table() -> impl Strategy<Value = (RankTable, Vec<RecordId>)> {
        (1_i64..24).prop_flat_map(|n| {
            let ids = (1..=n).map(id).collect::<Vec<_>>();
            let ranks = (0..u32::try_from(n).unwrap_or(0)).collect::<Vec<_>>();
            (Just(ids).prop_shuffle(), Just(ranks).prop_shuffle()).prop_map(|(ids, ranks)| {
                let table: RankTable = ids.iter().copied().zip(ranks.into_iter().map(Rank)).collect();
                (table, ids)
            })
        })
    }

    proptest! {
        #[test]
        fn property_reindex_assigns_position_as_rank((table, ids) in shuffled_table(), seed in any::<u64>()) {
            let mut order = ids;
            let len = order.len();
            order.rotate_left(usize::try_from(seed % 64).unwrap_or(0) % len);
            let mut ranks = table;
            prop_assert!(ranks.reindex(&order).is_ok());
            for (position, record) in order.iter().enumerate() {
                prop_assert_eq!(ranks.rank(*record), Some(Rank(u32::try_from(position).unwrap_or(u32::MAX))));
            }
            prop_assert!(ranks.report().dense);
        }

        #[test]
        fn property_swap_is_local_and_an_involution((table, ids) in shuffled_table(), i in any::<usize>(), j in any::<usize>()) {
            let a = ids[i % ids.len()];
            let b = ids[j % ids.len()];
            let before = table.clone();
            let mut ranks = table;

            prop_assert!(ranks.swap(a, b).is_ok());
            prop_assert_eq!(ranks.rank(a), before.rank(b));
            prop_assert_eq!(ranks.rank(b), before.rank(a));
            for other in ids.iter().filter(|other| **other != a && **other != b) {
                prop_assert_eq!(ranks.rank(*other), before.rank(*other));
            }

            prop_assert!(ranks.swap(a, b).is_ok());
            prop_assert_eq!(ranks, before);
        }
    }
}
