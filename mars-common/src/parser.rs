//! Parse raw activity messages into records.
//!
//! A message is a single line of seven comma separated fields:
//! `timestamp,ipaddr,action,srcacct,destacct,amount,customername`.
//! Anything else is routed to the dead-letter table with its original text, so parsing
//! never fails: every message maps to exactly one `Outcome`.
use crate::record::{MalformedRecord, Outcome, ParsedRecord};

pub const FIELD_DELIMITER: char = ',';
pub const FIELD_COUNT: usize = 7;

/// Classify one message payload as a valid record or a malformed one.
///
/// Fields are split on the delimiter without any quoting support, so a field containing a
/// comma changes the field count and ends up malformed.
pub fn parse(message: &[u8]) -> Outcome {
    let line = match std::str::from_utf8(message) {
        Ok(text) => text.trim(),
        Err(_) => {
            return Outcome::Malformed(MalformedRecord::new(
                String::from_utf8_lossy(message).trim(),
            ))
        }
    };

    // One extra split is enough to tell that a line has too many fields.
    let fields: Vec<&str> = line.splitn(FIELD_COUNT + 1, FIELD_DELIMITER).collect();
    let [
        timestamp,
        ip_address,
        action,
        source_account,
        destination_account,
        amount,
        customer_name,
    ] = fields[..]
    else {
        return Outcome::Malformed(MalformedRecord::new(line));
    };

    let Some(amount) = parse_amount(amount) else {
        return Outcome::Malformed(MalformedRecord::new(line));
    };

    Outcome::Valid(ParsedRecord {
        timestamp: timestamp.to_owned(),
        ip_address: ip_address.to_owned(),
        action: action.to_owned(),
        source_account: source_account.to_owned(),
        destination_account: destination_account.to_owned(),
        amount,
        customer_name: customer_name.to_owned(),
    })
}

/// The amount column is numeric: NaN and infinities are rejected along with anything
/// that is not a decimal number.
fn parse_amount(field: &str) -> Option<f64> {
    field
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite())
}
