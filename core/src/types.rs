//! Shared primitive types used across the entire simulation.

use crate::error::SimError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A simulation step. One step = one simulated week.
pub type Step = u64;

/// The canonical run identifier.
pub type RunId = String;

pub type CustomerId = i64;
pub type CatalogItemId = i64;
pub type UnitId = i64;
pub type LoanId = i64;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// persisted form is a fixed snake_case string.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = SimError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SimError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Physical state of one inventory unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    OnLoan,
    Damaged,
    Missing,
}

text_enum!(UnitStatus, "unit status", {
    Available => "available",
    OnLoan    => "on_loan",
    Damaged   => "damaged",
    Missing   => "missing",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    Inactive,
}

text_enum!(ActivityStatus, "activity status", {
    Active   => "active",
    Inactive => "inactive",
});

/// Late-fee payment status. Declaration order is the only allowed
/// direction of travel; `Ord` is used to keep transitions forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStatus {
    Pending,
    PartiallyPaid,
    Paid,
    WrittenOff,
}

text_enum!(FeeStatus, "fee status", {
    Pending       => "pending",
    PartiallyPaid => "partially_paid",
    Paid          => "paid",
    WrittenOff    => "written_off",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStanding {
    GoodStanding,
    PastDue,
    AtRisk,
    Suspended,
}

text_enum!(AccountStanding, "account standing", {
    GoodStanding => "good_standing",
    PastDue      => "past_due",
    AtRisk       => "at_risk",
    Suspended    => "suspended",
});

/// Receivables aging bucket, keyed on the oldest overdue open loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingBucket {
    Current,
    Days30,
    Days60,
    Days90Plus,
}

text_enum!(AgingBucket, "aging bucket", {
    Current    => "current",
    Days30     => "30_days",
    Days60     => "60_days",
    Days90Plus => "90_days_plus",
});

impl AgingBucket {
    pub fn for_days_overdue(days: i64) -> Self {
        match days {
            d if d >= 90 => Self::Days90Plus,
            d if d >= 60 => Self::Days60,
            d if d >= 30 => Self::Days30,
            _ => Self::Current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Rental,
    LateFee,
}

text_enum!(PaymentKind, "payment kind", {
    Rental  => "rental",
    LateFee => "late_fee",
});

/// Round a currency amount to cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
