use std::{fmt, str::FromStr};

/// Identity of one of the two interchangeable storage banks.
///
/// Serialized as `"a"`/`"b"`, matching the bank tables in the engine
/// settings.
#[derive(serde::Serialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// The other bank: the passive one when `self` is active.
    ///
    /// ```
    /// use ab_update_engine_core::Slot;
    ///
    /// assert_eq!(Slot::A.opposite(), Slot::B);
    /// assert_eq!(Slot::B.opposite(), Slot::A);
    /// ```
    pub fn opposite(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("`{0}` is not a bank slot; expected `a` or `b`")]
pub struct SlotParseError(String);

impl FromStr for Slot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(Slot::A),
            "b" => Ok(Slot::B),
            other => Err(SlotParseError(other.to_string())),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Slot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
