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

//! Identifiers, chain sentinels and block heights.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use std::fmt;

/// Sentinel naming the end of a transaction or block chain.
///
/// The nil UUID is the other distinguished value: it stands for "no
/// predecessor" on create transactions and for "no block yet" in the
/// latest-block pointer.
pub const END_OF_CHAIN: Uuid = Uuid::from_bytes([0xff; 16]);

/// Global-settings key of the data-service schema version.
pub const GLOBAL_SETTING_SCHEMA_VERSION: u64 = 0x0000_0000_0000_0001;

/// Global-settings key of the latest-block pointer.
pub const GLOBAL_SETTING_LATEST_BLOCK_ID: u64 = 0x0000_0000_0000_0002;

/// Blockchain height (number of canonized blocks).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Height(pub u64);

impl Height {
    /// Returns zero value of the height.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledgerd::ids::Height;
    ///
    /// let height = Height::zero();
    /// assert_eq!(0, height.0);
    /// ```
    pub fn zero() -> Self {
        Height(0)
    }

    /// Returns next value of the height.
    ///
    /// # Examples
    ///
    /// ```
    /// use ledgerd::ids::Height;
    ///
    /// let height = Height(10);
    /// assert_eq!(11, height.next().0);
    /// ```
    pub fn next(self) -> Self {
        Height(self.0 + 1)
    }

    /// Returns previous value of the height.
    ///
    /// # Panics
    ///
    /// Panics if `self.0` is equal to zero.
    pub fn previous(self) -> Self {
        assert_ne!(0, self.0);
        Height(self.0 - 1)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Height> for u64 {
    fn from(val: Height) -> Self {
        val.0
    }
}

// Serialized as a bare integer so TOML round-trips cleanly.
impl Serialize for Height {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Height {
    fn deserialize<D>(deserializer: D) -> Result<Height, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Height(u64::deserialize(deserializer)?))
    }
}

/// Renders an id the way the fleet logs it: lowercase hex, no hyphens.
pub fn short_id(id: &Uuid) -> String {
    hex::encode(&id.as_bytes()[..4])
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(Uuid::nil(), END_OF_CHAIN);
        assert_eq!(END_OF_CHAIN.as_bytes(), &[0xff; 16]);
    }

    #[test]
    fn height_arithmetic() {
        assert_eq!(Height::zero().next(), Height(1));
        assert_eq!(Height(5).previous(), Height(4));
    }

    #[test]
    #[should_panic]
    fn height_previous_underflow_panics() {
        let _ = Height::zero().previous();
    }
}
