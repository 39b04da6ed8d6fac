//! Order identifiers
//!
//! Format: `{PREFIX}_{yyyyMMddHHmmss}_{8 uppercase hex}`, e.g.
//! `SUB_20260301093000_9F3A01BC`. The prefix says what the order is for,
//! the timestamp is UTC.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderPrefix {
    /// One-off plan pass
    #[serde(rename = "ORD")]
    Order,
    /// Recurring subscription charge (start or renewal)
    #[serde(rename = "SUB")]
    Subscription,
    /// Credit package purchase
    #[serde(rename = "CRD")]
    Credit,
    /// Mid-period plan change
    #[serde(rename = "CHG")]
    Change,
}

impl OrderPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPrefix::Order => "ORD",
            OrderPrefix::Subscription => "SUB",
            OrderPrefix::Credit => "CRD",
            OrderPrefix::Change => "CHG",
        }
    }
}

impl FromStr for OrderPrefix {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORD" => Ok(OrderPrefix::Order),
            "SUB" => Ok(OrderPrefix::Subscription),
            "CRD" => Ok(OrderPrefix::Credit),
            "CHG" => Ok(OrderPrefix::Change),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown order prefix: {}",
                other
            ))),
        }
    }
}

/// Parsed order id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderId {
    pub prefix: OrderPrefix,
    pub created_at: PrimitiveDateTime,
    pub suffix: String,
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self
            .created_at
            .format(format_description!(
                "[year][month][day][hour][minute][second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(f, "{}_{}_{}", self.prefix.as_str(), ts, self.suffix)
    }
}

/// Allocate a new order id for `prefix` stamped with `now`
pub fn generate(prefix: OrderPrefix, now: OffsetDateTime) -> String {
    let utc = now.to_offset(time::UtcOffset::UTC);
    let time_of_day = utc.time().replace_nanosecond(0).unwrap_or(utc.time());
    let suffix: u32 = rand::rng().random();
    OrderId {
        prefix,
        created_at: PrimitiveDateTime::new(utc.date(), time_of_day),
        suffix: format!("{:08X}", suffix),
    }
    .to_string()
}

/// Parse and validate an order id
pub fn parse(order_id: &str) -> Result<OrderId, BillingError> {
    let invalid = || BillingError::InvalidInput(format!("Malformed order id: {}", order_id));

    let mut parts = order_id.split('_');
    let (Some(prefix), Some(ts), Some(suffix), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let prefix: OrderPrefix = prefix.parse()?;

    if ts.len() != 14 {
        return Err(invalid());
    }
    let created_at = PrimitiveDateTime::parse(
        ts,
        format_description!("[year][month][day][hour][minute][second]"),
    )
    .map_err(|_| invalid())?;

    let suffix_ok = suffix.len() == 8
        && suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c));
    if !suffix_ok {
        return Err(invalid());
    }

    Ok(OrderId {
        prefix,
        created_at,
        suffix: suffix.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_generate_format() {
        let id = generate(OrderPrefix::Subscription, datetime!(2026-03-01 09:30:00 UTC));
        assert!(id.starts_with("SUB_20260301093000_"));
        assert_eq!(id.len(), "SUB_20260301093000_".len() + 8);

        let parsed = parse(&id).unwrap();
        assert_eq!(parsed.prefix, OrderPrefix::Subscription);
        assert_eq!(parsed.created_at, datetime!(2026-03-01 09:30:00));
        assert_eq!(parsed.to_string(), id);
    }

    #[test]
    fn test_generate_normalizes_to_utc() {
        let kst = datetime!(2026-03-01 09:30:00 +9);
        let id = generate(OrderPrefix::Credit, kst);
        assert!(id.starts_with("CRD_20260301003000_"));
    }

    #[test]
    fn test_generated_ids_differ() {
        let now = OffsetDateTime::now_utc();
        let a = generate(OrderPrefix::Order, now);
        let b = generate(OrderPrefix::Order, now);
        // 32 random bits; a collision here would be a broken RNG
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse("SUB_20260301093000_9f3a01bc").is_err()); // lowercase hex
        assert!(parse("XYZ_20260301093000_9F3A01BC").is_err());
        assert!(parse("SUB_2026030109300_9F3A01BC").is_err());
        assert!(parse("SUB_20261301093000_9F3A01BC").is_err()); // month 13
        assert!(parse("SUB_20260301093000_9F3A01B").is_err());
        assert!(parse("SUB_20260301093000_9F3A01BC_X").is_err());
        assert!(parse("").is_err());
    }
}
