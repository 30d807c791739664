use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

/// A counter mapping whose merge is element-wise integer addition.
///
/// Keys are free-form (`rows_read`, `valid_rows`, `nodes_created`, ...); the
/// only algebraic operation the engine relies on is commutative/associative
/// merging, so a plain sorted map is sufficient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics(pub BTreeMap<String, i64>);

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<String>, value: i64) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), value);
        Self(map)
    }

    pub fn get(&self, key: &str) -> i64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy with zero-valued entries removed, for human-readable
    /// reporting (the underlying statistics, including the zeros, are still
    /// what gets merged and returned to callers).
    pub fn cleaned(&self) -> Self {
        Self(self.0.iter().filter(|(_, v)| **v != 0).map(|(k, v)| (k.clone(), *v)).collect())
    }

    pub fn merge(&self, other: &Statistics) -> Statistics {
        let mut out = self.0.clone();
        for (k, v) in &other.0 {
            *out.entry(k.clone()).or_insert(0) += v;
        }
        Statistics(out)
    }
}

impl Add for Statistics {
    type Output = Statistics;

    fn add(self, rhs: Statistics) -> Statistics {
        self.merge(&rhs)
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, rhs: Statistics) {
        for (k, v) in rhs.0 {
            *self.0.entry(k).or_insert(0) += v;
        }
    }
}

impl FromIterator<(String, i64)> for Statistics {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Statistics(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_element_wise_addition() {
        let a = Statistics::single("rows_read", 10);
        let b = Statistics::single("rows_read", 5).merge(&Statistics::single("valid_rows", 3));
        let merged = a.merge(&b);
        assert_eq!(merged.get("rows_read"), 15);
        assert_eq!(merged.get("valid_rows"), 3);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let a = Statistics::single("nodes_created", 7);
        assert_eq!(a.merge(&Statistics::new()), a);
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = Statistics::single("x", 1);
        let b = Statistics::single("x", 2).merge(&Statistics::single("y", 3));
        let c = Statistics::single("y", 4);

        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn cleaned_drops_zero_entries_but_keeps_original() {
        let s = Statistics::single("a", 0).merge(&Statistics::single("b", 2));
        assert_eq!(s.cleaned().0.len(), 1);
        assert_eq!(s.0.len(), 2);
    }
}
