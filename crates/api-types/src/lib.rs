//! Payloads published by the realtime gateway.
//!
//! Each message has a protobuf encoding (hand-annotated `prost` structs, no
//! build step) and a JSON encoding with the same field names. The signal
//! endpoint's request and response bodies are JSON only.

use serde::{Deserialize, Serialize};

/// What kind of estimate a [`VehicleEta`] carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(i32)]
pub enum Kind {
    NotAvailable = 0,
    Exact = 1,
    Interval = 2,
    LessThan = 3,
    MoreThan = 4,
    /// `value` is an absolute unix timestamp
    Timestamp = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(i32)]
pub enum Units {
    Seconds = 0,
    Minutes = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message, Serialize, Deserialize)]
pub struct Interval {
    #[prost(int64, tag = "1")]
    pub lower: i64,
    #[prost(int64, tag = "2")]
    pub upper: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Oneof, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Value {
    #[prost(int64, tag = "8")]
    Single(i64),
    #[prost(message, tag = "9")]
    Interval(Interval),
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleEta {
    #[prost(string, tag = "1")]
    pub station: String,
    #[prost(string, tag = "2")]
    pub direction: String,
    #[prost(uint32, tag = "3")]
    pub rank: u32,
    /// Unix seconds
    #[prost(int64, tag = "4")]
    pub computed: i64,
    #[prost(uint32, tag = "5")]
    pub validity: u32,
    #[prost(enumeration = "Kind", tag = "6")]
    #[serde(with = "kind_name")]
    pub kind: i32,
    #[prost(enumeration = "Units", tag = "7")]
    #[serde(with = "units_name")]
    pub units: i32,
    #[prost(oneof = "Value", tags = "8, 9")]
    pub value: Option<Value>,
    #[prost(string, tag = "10")]
    pub vehicle: String,
    #[prost(uint32, tag = "11")]
    pub cars: u32,
    #[prost(string, optional, tag = "12")]
    pub platform: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePosition {
    #[prost(string, tag = "1")]
    pub vehicle: String,
    #[prost(string, tag = "2")]
    pub line: String,
    #[prost(uint32, tag = "3")]
    pub cars: u32,
    #[prost(string, optional, tag = "4")]
    pub previous_station: Option<String>,
    #[prost(string, tag = "5")]
    pub next_station: String,
    #[prost(string, tag = "6")]
    pub direction: String,
    #[prost(string, optional, tag = "7")]
    pub platform: Option<String>,
    #[prost(float, tag = "8")]
    pub percent: f32,
    #[prost(int64, tag = "9")]
    pub computed: i64,
    #[prost(uint32, tag = "10")]
    pub validity: u32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct VehicleEtaBatch {
    #[prost(message, repeated, tag = "1")]
    pub etas: Vec<VehicleEta>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct VehiclePositionBatch {
    #[prost(message, repeated, tag = "1")]
    pub positions: Vec<VehiclePosition>,
}

/// A rider's location report, posted to the signal endpoint as JSON
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalReport {
    pub user: String,
    pub station: String,
    /// Terminal station the rider's vehicle heads to
    pub direction: String,
    /// Lines the rider is on; empty means every line serving the station
    /// towards `direction`
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub just_entered: bool,
}

/// Riders currently in transit on a line or network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCount {
    pub id: String,
    pub riders: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed protobuf payload: {0}")]
    Binary(#[from] prost::DecodeError),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_binary<M: prost::Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

pub fn decode_binary<M: prost::Message + Default>(bytes: &[u8]) -> Result<M, PayloadError> {
    Ok(M::decode(bytes)?)
}

pub fn encode_json<T: Serialize>(message: &T) -> Result<Vec<u8>, PayloadError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_json<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, PayloadError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Stores enumerations as their wire integer but shows names in JSON
macro_rules! enum_name_serde {
    ($module:ident, $enum:ty) => {
        mod $module {
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
                match <$enum>::try_from(*value) {
                    Ok(known) => known.serialize(serializer),
                    Err(_) => serializer.serialize_i32(*value),
                }
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
                <$enum>::deserialize(deserializer).map(|known| known as i32)
            }
        }
    };
}

enum_name_serde!(kind_name, super::Kind);
enum_name_serde!(units_name, super::Units);
