//! Protocol features exchanged in `IPROTO_ID`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Optional protocol capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Feature {
    Streams = 0,
    Transactions = 1,
    ErrorExtension = 2,
    Watchers = 3,
    Pagination = 4,
    SpaceAndIndexNames = 5,
    WatchOnce = 6,
    DmlTupleExtension = 7,
    CallRetTupleExtension = 8,
    CallArgTupleExtension = 9,
}

impl Feature {
    pub const ALL: [Feature; 10] = [
        Feature::Streams,
        Feature::Transactions,
        Feature::ErrorExtension,
        Feature::Watchers,
        Feature::Pagination,
        Feature::SpaceAndIndexNames,
        Feature::WatchOnce,
        Feature::DmlTupleExtension,
        Feature::CallRetTupleExtension,
        Feature::CallArgTupleExtension,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.code() as u64 == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::Streams => "streams",
            Feature::Transactions => "transactions",
            Feature::ErrorExtension => "error_extension",
            Feature::Watchers => "watchers",
            Feature::Pagination => "pagination",
            Feature::SpaceAndIndexNames => "space_and_index_names",
            Feature::WatchOnce => "watch_once",
            Feature::DmlTupleExtension => "dml_tuple_extension",
            Feature::CallRetTupleExtension => "call_ret_tuple_extension",
            Feature::CallArgTupleExtension => "call_arg_tuple_extension",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of features, stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureSet(u64);

impl FeatureSet {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Every feature this crate knows about.
    pub fn all() -> Self {
        Feature::ALL.iter().copied().collect()
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.insert(feature);
        self
    }

    pub fn insert(&mut self, feature: Feature) {
        self.0 |= 1 << feature.code();
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & (1 << feature.code()) != 0
    }

    pub fn intersection(&self, other: &FeatureSet) -> FeatureSet {
        FeatureSet(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.iter().copied().filter(|f| self.contains(*f))
    }

    /// Builds a set from wire codes, skipping codes this crate does not know.
    pub fn from_codes(codes: impl IntoIterator<Item = u64>) -> Self {
        codes.into_iter().filter_map(Feature::from_code).collect()
    }

    pub fn codes(&self) -> Vec<u8> {
        self.iter().map(Feature::code).collect()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        let mut set = FeatureSet::empty();
        for f in iter {
            set.insert(f);
        }
        set
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(Feature::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection() {
        let client = FeatureSet::all();
        let server = FeatureSet::from_codes([0, 1, 3, 42]);
        let negotiated = client.intersection(&server);

        assert!(negotiated.contains(Feature::Streams));
        assert!(negotiated.contains(Feature::Transactions));
        assert!(negotiated.contains(Feature::Watchers));
        assert!(!negotiated.contains(Feature::WatchOnce));
        assert_eq!(negotiated.len(), 3);
    }

    #[test]
    fn test_codes_roundtrip() {
        let set = FeatureSet::empty()
            .with(Feature::Pagination)
            .with(Feature::SpaceAndIndexNames);
        assert_eq!(set.codes(), vec![4, 5]);
        assert_eq!(FeatureSet::from_codes([4, 5]), set);
    }

    #[test]
    fn test_display() {
        let set = FeatureSet::empty().with(Feature::Watchers).with(Feature::Streams);
        assert_eq!(set.to_string(), "[streams, watchers]");
        assert_eq!(FeatureSet::empty().to_string(), "[]");
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(Feature::from_code(6), Some(Feature::WatchOnce));
        assert_eq!(Feature::from_code(64), None);
    }
}
