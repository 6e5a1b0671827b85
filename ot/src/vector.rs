//! State vectors identify causal states of a session.
use crate::id::UserId;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A mapping from user id to the number of requests of that user that
/// are part of the state the vector describes.
///
/// Users that are not present have an implied count of zero; zero
/// counts are never stored, so equal states compare equal structurally.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct StateVector {
    counts: BTreeMap<UserId, u32>,
}

/// Error returned when parsing a malformed wire-form state vector.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("malformed state vector")]
pub struct VectorParseError;

impl StateVector {
    /// Returns a new, empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count for `user`. Users not in the vector have an
    /// implied count of 0.
    pub fn get(&self, user: UserId) -> u32 {
        self.counts.get(&user).copied().unwrap_or_default()
    }

    /// Sets the count for `user`.
    pub fn set(&mut self, user: UserId, count: u32) {
        if count == 0 {
            self.counts.remove(&user);
        } else {
            self.counts.insert(user, count);
        }
    }

    /// Increments the count for `user` and returns the new value.
    pub fn inc(&mut self, user: UserId) -> u32 {
        let count = self.get(user) + 1;
        self.counts.insert(user, count);
        count
    }

    /// Checks whether the state `self` describes is part of the causal
    /// history of the state `other` describes.
    pub fn causally_leq(&self, other: &StateVector) -> bool {
        self.counts.iter().all(|(user, count)| other.get(*user) >= *count)
    }

    /// Checks whether neither state is part of the other's history.
    pub fn concurrent(&self, other: &StateVector) -> bool {
        !self.causally_leq(other) && !other.causally_leq(self)
    }

    /// Returns the total component-wise distance between two vectors.
    pub fn vdiff(&self, other: &StateVector) -> u64 {
        let mut diff = 0u64;
        for (user, count) in &self.counts {
            diff += (i64::from(*count) - i64::from(other.get(*user))).unsigned_abs();
        }
        for (user, count) in &other.counts {
            if !self.counts.contains_key(user) {
                diff += u64::from(*count);
            }
        }
        diff
    }

    /// Iterates over the non-zero components, ordered by user id.
    pub fn iter(&self) -> impl Iterator<Item = (UserId, u32)> + '_ {
        self.counts.iter().map(|(user, count)| (*user, *count))
    }

    /// Returns whether the vector has no non-zero component.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl fmt::Display for StateVector {
    /// Writes the canonical wire form `id1:n1;id2:n2`, sorted by id.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (user, count) in &self.counts {
            if !first {
                write!(f, ";")?;
            }
            write!(f, "{}:{}", user, count)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for StateVector {
    type Err = VectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut vector = StateVector::new();
        if s.is_empty() {
            return Ok(vector);
        }
        for component in s.split(';') {
            let (user, count) = component.split_once(':').ok_or(VectorParseError)?;
            let user = user.parse().map_err(|_| VectorParseError)?;
            let count = count.parse().map_err(|_| VectorParseError)?;
            if vector.counts.contains_key(&user) {
                return Err(VectorParseError);
            }
            vector.set(user, count);
        }
        Ok(vector)
    }
}

impl FromIterator<(UserId, u32)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (UserId, u32)>>(iter: I) -> Self {
        let mut vector = StateVector::new();
        for (user, count) in iter {
            vector.set(user, count);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::uid;
    use proptest::prelude::*;

    fn arb_vector() -> impl Strategy<Value = StateVector> {
        prop::collection::btree_map(1u32..6, 0u32..8, 0..5).prop_map(|counts| {
            counts
                .into_iter()
                .map(|(user, count)| (uid(user), count))
                .collect()
        })
    }

    #[test]
    fn get_of_missing_user_is_zero() {
        let vector = StateVector::new();
        assert_eq!(vector.get(uid(7)), 0);
    }

    #[test]
    fn zero_set_removes_component() {
        let mut vector = StateVector::new();
        vector.set(uid(1), 3);
        vector.set(uid(1), 0);
        assert_eq!(vector, StateVector::new());
    }

    #[test]
    fn causal_order() {
        let a: StateVector = [(uid(1), 1)].into_iter().collect();
        let b: StateVector = [(uid(1), 1), (uid(2), 1)].into_iter().collect();
        let c: StateVector = [(uid(2), 2)].into_iter().collect();
        assert!(a.causally_leq(&b));
        assert!(!b.causally_leq(&a));
        assert!(a.concurrent(&c));
        assert!(b.concurrent(&c));
        assert!(StateVector::new().causally_leq(&a));
    }

    #[test]
    fn vdiff_counts_both_sides() {
        let a: StateVector = [(uid(1), 3), (uid(2), 1)].into_iter().collect();
        let b: StateVector = [(uid(1), 1), (uid(3), 4)].into_iter().collect();
        assert_eq!(a.vdiff(&b), 2 + 1 + 4);
    }

    #[test]
    fn wire_form_is_sorted_by_id() {
        let mut vector = StateVector::new();
        vector.set(uid(12), 4);
        vector.set(uid(3), 7);
        assert_eq!(vector.to_string(), "3:7;12:4");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("1".parse::<StateVector>().is_err());
        assert!("1:2;1:3".parse::<StateVector>().is_err());
        assert!("0:2".parse::<StateVector>().is_err());
        assert!("a:2".parse::<StateVector>().is_err());
    }

    proptest! {
        #[test]
        fn roundtrip(v in arb_vector()) {
            prop_assert_eq!(v.to_string().parse::<StateVector>().unwrap(), v);
        }

        #[test]
        fn leq_reflexive(v in arb_vector()) {
            prop_assert!(v.causally_leq(&v));
        }

        #[test]
        fn leq_antisymmetric(a in arb_vector(), b in arb_vector()) {
            if a.causally_leq(&b) && b.causally_leq(&a) {
                prop_assert_eq!(a, b);
            }
        }

        #[test]
        fn leq_transitive(a in arb_vector(), b in arb_vector(), c in arb_vector()) {
            if a.causally_leq(&b) && b.causally_leq(&c) {
                prop_assert!(a.causally_leq(&c));
            }
        }

        #[test]
        fn vdiff_symmetric(a in arb_vector(), b in arb_vector()) {
            prop_assert_eq!(a.vdiff(&b), b.vdiff(&a));
        }

        #[test]
        fn vdiff_zero_iff_equal(a in arb_vector(), b in arb_vector()) {
            prop_assert_eq!(a.vdiff(&b) == 0, a == b);
        }

        #[test]
        fn vdiff_triangle(a in arb_vector(), b in arb_vector(), c in arb_vector()) {
            prop_assert!(a.vdiff(&c) <= a.vdiff(&b) + b.vdiff(&c));
        }
    }
}
