//! Snowflake identifiers.
//!
//! A snowflake packs 42 bits of milliseconds since [`TRILL_EPOCH`], a 10 bit
//! node id and a 12 bit sequence number into a `u64`. Every entity shares the
//! same generator, so identifiers are unique across tables and roughly ordered
//! by creation time.
//!
//! See <https://discord.com/developers/docs/reference#snowflakes>

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{Error, Unexpected, Visitor},
};
use std::{
    fmt::{Display, Formatter},
    num::ParseIntError,
    str::FromStr,
};
use thiserror::Error;
use time::{OffsetDateTime, macros::datetime};

pub const TRILL_EPOCH: OffsetDateTime = datetime!(2025-01-01 00:00 UTC);

pub const TIMESTAMP_LENGTH: u32 = 42;
pub const TIMESTAMP_OFFSET: u32 = NODE_ID_LENGTH + SEQUENCE_LENGTH;

pub const NODE_ID_LENGTH: u32 = 10;
pub const NODE_ID_OFFSET: u32 = SEQUENCE_LENGTH;

pub const SEQUENCE_LENGTH: u32 = 12;

const NODE_ID_MASK: u64 = (1 << NODE_ID_LENGTH) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_LENGTH) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_LENGTH) - 1;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Error)]
pub enum SnowflakeError {
    #[error("Specified time was before the snowflake epoch.")]
    TimeBeforeEpoch,
    #[error("Resulting timestamp uses too many bits.")]
    TimestampTooLarge,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(u16);

impl NodeId {
    #[must_use]
    pub fn new(id: u16) -> Option<Self> {
        (u64::from(id) <= NODE_ID_MASK).then_some(Self(id))
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = u16::deserialize(deserializer)?;
        Self::new(inner)
            .ok_or_else(|| Error::invalid_value(Unexpected::Unsigned(inner.into()), &"NodeId"))
    }
}

/// Serialized as a decimal string, since JSON numbers above 2^53 lose
/// precision in JavaScript. Deserializing accepts a string or a number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct Snowflake(u64);

impl Snowflake {
    #[must_use]
    pub fn new(inner: u64) -> Self {
        Self(inner)
    }

    #[must_use]
    pub fn from_parts(timestamp_millis: u64, node_id: NodeId, sequence: u16) -> Self {
        Self(
            (timestamp_millis & MAX_TIMESTAMP) << TIMESTAMP_OFFSET
                | u64::from(node_id.get()) << NODE_ID_OFFSET
                | u64::from(sequence) & SEQUENCE_MASK,
        )
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn timestamp_millis(self) -> u64 {
        self.0 >> TIMESTAMP_OFFSET
    }

    #[must_use]
    pub fn node_id(self) -> NodeId {
        #[allow(clippy::cast_possible_truncation)]
        NodeId(((self.0 >> NODE_ID_OFFSET) & NODE_ID_MASK) as u16)
    }

    #[must_use]
    pub fn sequence(self) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let sequence = (self.0 & SEQUENCE_MASK) as u16;
        sequence
    }
}

impl Display for Snowflake {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for Snowflake {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl Serialize for Snowflake {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

struct SnowflakeVisitor;

impl Visitor<'_> for SnowflakeVisitor {
    type Value = Snowflake;

    fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("a snowflake as a decimal string or an unsigned integer")
    }

    fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Snowflake(v))
    }

    fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(Snowflake)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse()
            .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<Snowflake> for u64 {
    fn from(value: Snowflake) -> Self {
        value.get()
    }
}

pub fn millis_since_epoch(time: OffsetDateTime) -> Result<u64, SnowflakeError> {
    let millis = (time - TRILL_EPOCH).whole_milliseconds();
    if millis < 0 {
        return Err(SnowflakeError::TimeBeforeEpoch);
    }
    let millis = u64::try_from(millis).map_err(|_| SnowflakeError::TimestampTooLarge)?;
    if millis > MAX_TIMESTAMP {
        return Err(SnowflakeError::TimestampTooLarge);
    }
    Ok(millis)
}

/// Hands out strictly increasing snowflakes for one node.
///
/// If the clock stands still (or goes backwards) the generator keeps using
/// the last timestamp it saw; once the sequence for a millisecond is used up
/// it borrows the next millisecond.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash)]
pub struct SnowflakeGenerator {
    node_id: NodeId,
    last_millis: u64,
    next_sequence: u64,
}

impl SnowflakeGenerator {
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            last_millis: 0,
            next_sequence: 0,
        }
    }

    #[must_use]
    pub fn node_id(self) -> NodeId {
        self.node_id
    }

    pub fn generate_at(&mut self, time: OffsetDateTime) -> Result<Snowflake, SnowflakeError> {
        let millis = millis_since_epoch(time)?;

        if millis > self.last_millis {
            self.last_millis = millis;
            self.next_sequence = 0;
        } else if self.next_sequence > SEQUENCE_MASK {
            self.last_millis += 1;
            self.next_sequence = 0;
        }

        if self.last_millis > MAX_TIMESTAMP {
            return Err(SnowflakeError::TimestampTooLarge);
        }

        #[allow(clippy::cast_possible_truncation)]
        let sequence = self.next_sequence as u16;
        self.next_sequence += 1;

        Ok(Snowflake::from_parts(
            self.last_millis,
            self.node_id,
            sequence,
        ))
    }

    pub fn generate(&mut self) -> Result<Snowflake, SnowflakeError> {
        self.generate_at(OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use crate::snowflake::{
        NodeId, Snowflake, SnowflakeError, SnowflakeGenerator, TRILL_EPOCH, millis_since_epoch,
    };
    use serde_json::json;
    use time::{Duration, macros::datetime};

    #[test]
    fn node_id_range() {
        for legal in [0, 0x1F, 0x3FF] {
            assert!(NodeId::new(legal).is_some());
        }
        for illegal in [0x400, 0xF000, u16::MAX] {
            assert!(NodeId::new(illegal).is_none());
        }
    }

    #[test]
    fn timestamp_bounds() {
        assert_eq!(millis_since_epoch(TRILL_EPOCH), Ok(0));
        assert_eq!(
            millis_since_epoch(TRILL_EPOCH - Duration::milliseconds(1)),
            Err(SnowflakeError::TimeBeforeEpoch)
        );
        assert_eq!(
            millis_since_epoch(TRILL_EPOCH + Duration::milliseconds(0x0400_0000_0000)),
            Err(SnowflakeError::TimestampTooLarge)
        );
    }

    #[test]
    fn parts_survive_packing() {
        let node_id = NodeId::new(0b10_1010_1010).unwrap();
        let snowflake = Snowflake::from_parts(814_617_000_000, node_id, 100);

        assert_eq!(snowflake.timestamp_millis(), 814_617_000_000);
        assert_eq!(snowflake.node_id(), node_id);
        assert_eq!(snowflake.sequence(), 100);
    }

    #[test]
    fn generator_is_strictly_increasing() {
        let mut generator = SnowflakeGenerator::new(NodeId::new(7).unwrap());
        let time = datetime!(2025-10-24 10:55 UTC);

        let mut previous = generator.generate_at(time).unwrap();
        assert_eq!(previous.sequence(), 0);

        // Enough ids to overflow the sequence of a single millisecond.
        for _ in 0..5000 {
            let next = generator.generate_at(time).unwrap();
            assert!(next > previous);
            previous = next;
        }
        assert!(previous.timestamp_millis() > millis_since_epoch(time).unwrap());

        // A clock going backwards does not produce smaller ids.
        let earlier = generator
            .generate_at(time - Duration::seconds(10))
            .unwrap();
        assert!(earlier > previous);
    }

    #[test]
    fn json_carries_decimal_strings() {
        let snowflake = Snowflake::from_parts(
            millis_since_epoch(datetime!(2026-10-16 12:00 UTC)).unwrap(),
            NodeId::new(1).unwrap(),
            1,
        );
        assert!(snowflake.get() > (1 << 53));

        let json = serde_json::to_value(snowflake).unwrap();
        assert_eq!(json, json!(snowflake.get().to_string()));

        let back: Snowflake = serde_json::from_value(json).unwrap();
        assert_eq!(back, snowflake);
    }

    #[test]
    fn numbers_are_still_accepted() {
        let from_number: Snowflake = serde_json::from_str("236760072192004097").unwrap();
        let from_string: Snowflake = serde_json::from_str(r#""236760072192004097""#).unwrap();

        assert_eq!(from_number, Snowflake::new(236_760_072_192_004_097));
        assert_eq!(from_number, from_string);

        for invalid in ["-1", r#""-1""#, r#""12ab""#, r#""""#, "1.5", "null"] {
            assert!(
                serde_json::from_str::<Snowflake>(invalid).is_err(),
                "{invalid} parsed"
            );
        }
    }
}
