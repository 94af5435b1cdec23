use std::fmt;

use serde::Serialize;

/// Where a message came from, as assigned by the transport.
/// Only used to acknowledge the message once it has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A message as delivered by the transport. The payload is opaque until parsed.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Vec<u8>,
    pub token: DeliveryToken,
}

impl RawMessage {
    pub fn new(payload: impl Into<Vec<u8>>, token: DeliveryToken) -> Self {
        Self {
            payload: payload.into(),
            token,
        }
    }
}

/// A well-formed activity record, serialized with the column names of the analytical table.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub timestamp: String,
    #[serde(rename = "ipaddr")]
    pub ip_address: String,
    pub action: String,
    #[serde(rename = "srcacct")]
    pub source_account: String,
    #[serde(rename = "destacct")]
    pub destination_account: String,
    pub amount: f64,
    #[serde(rename = "customername")]
    pub customer_name: String,
}

/// A message that could not be parsed, carrying its trimmed text for the dead-letter table.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub message: String,
}

impl MalformedRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The result of parsing one message. Exactly one variant is produced per message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Valid(ParsedRecord),
    Malformed(MalformedRecord),
}

impl Outcome {
    pub fn kind(&self) -> RecordKind {
        match self {
            Outcome::Valid(_) => RecordKind::Valid,
            Outcome::Malformed(_) => RecordKind::Malformed,
        }
    }
}

/// Which sink an outcome is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Valid,
    Malformed,
}

impl RecordKind {
    /// Label used when reporting metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Valid => "valid",
            RecordKind::Malformed => "malformed",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
