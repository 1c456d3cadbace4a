// Copyright 2022 The Ledgerd Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Monotonically shrinking capability sets.
//!
//! A capability set is a fixed-width bitset indexed by method id. Contexts
//! are born with some set and can only ever lose bits: `reduce` intersects,
//! and there is no operation that sets a bit. The data service keeps one set
//! per child context, the notification and protocol services one per
//! connection.
//!
//! Public-entity grants arrive as (subject, verb, object) triples in the
//! entity certificate stream; the protocol boundary maps them onto method-id
//! bitsets before any service sees them.

use bit_vec::BitVec;
use uuid::Uuid;

use std::fmt;

/// Width of every capability set in the fleet, in bits.
pub const CAPS_BITS: usize = 64;

/// A fixed-width monotonic capability bitset.
#[derive(Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    bits: BitVec,
}

impl CapabilitySet {
    /// A set with every capability granted.
    pub fn full() -> Self {
        Self {
            bits: BitVec::from_elem(CAPS_BITS, true),
        }
    }

    /// A set with no capability granted.
    pub fn empty() -> Self {
        Self {
            bits: BitVec::from_elem(CAPS_BITS, false),
        }
    }

    /// A set granting exactly the given method indices.
    pub fn with_indices(indices: &[usize]) -> Self {
        let mut set = Self::empty();
        for &idx in indices {
            if idx < CAPS_BITS {
                set.bits.set(idx, true);
            }
        }
        set
    }

    /// Whether the capability at `index` is granted.
    pub fn can(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(false)
    }

    /// Intersects `other` into this set.
    ///
    /// This is the only mutation a capability set supports; a bit cleared
    /// here can never be set again for the lifetime of the context.
    pub fn reduce(&mut self, other: &CapabilitySet) {
        self.bits.intersect(&other.bits);
    }

    /// Whether this set is a subset of `other`.
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(mine, theirs)| !mine || theirs)
    }

    /// Serializes the set for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// Deserializes a wire capability set.
    ///
    /// Returns `None` if the byte count does not match the fixed width.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CAPS_BITS / 8 {
            return None;
        }
        Some(Self {
            bits: BitVec::from_bytes(bytes),
        })
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilitySet({})", hex::encode(self.to_bytes()))
    }
}

/// A (subject, verb, object) capability grant from a public-entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityTriple {
    /// The entity the grant applies to.
    pub subject: Uuid,
    /// The permitted operation.
    pub verb: Uuid,
    /// The entity or table the operation targets.
    pub object: Uuid,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reduce_intersects() {
        let mut caps = CapabilitySet::full();
        let narrowed = CapabilitySet::with_indices(&[1, 3]);
        caps.reduce(&narrowed);
        assert!(caps.can(1));
        assert!(caps.can(3));
        assert!(!caps.can(0));
        assert!(!caps.can(2));
    }

    #[test]
    fn reduce_is_idempotent() {
        let narrowed = CapabilitySet::with_indices(&[2, 5]);
        let mut once = CapabilitySet::full();
        once.reduce(&narrowed);
        let mut twice = once.clone();
        twice.reduce(&narrowed);
        assert_eq!(once, twice);
    }

    #[test]
    fn caps_never_regrow() {
        let mut caps = CapabilitySet::full();
        caps.reduce(&CapabilitySet::empty());
        // A later "wider" reduction cannot bring anything back.
        caps.reduce(&CapabilitySet::full());
        for idx in 0..CAPS_BITS {
            assert!(!caps.can(idx));
        }
    }

    #[test]
    fn monotonic_over_any_sequence() {
        let mut caps = CapabilitySet::full();
        let steps = [
            CapabilitySet::with_indices(&[0, 1, 2, 3, 4]),
            CapabilitySet::with_indices(&[1, 2, 3]),
            CapabilitySet::with_indices(&[2, 3, 9]),
        ];
        let mut prev = caps.clone();
        for step in &steps {
            caps.reduce(step);
            assert!(caps.is_subset(&prev));
            prev = caps.clone();
        }
        assert!(caps.can(2));
        assert!(caps.can(3));
        assert!(!caps.can(9));
    }

    #[test]
    fn wire_round_trip() {
        let caps = CapabilitySet::with_indices(&[0, 7, 8, 63]);
        let bytes = caps.to_bytes();
        assert_eq!(bytes.len(), CAPS_BITS / 8);
        assert_eq!(CapabilitySet::from_bytes(&bytes).unwrap(), caps);
        assert!(CapabilitySet::from_bytes(&bytes[1..]).is_none());
    }
}
