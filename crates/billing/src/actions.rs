//! Typed front-end callback actions
//!
//! Buttons carry a short colon-separated string (`buy:12:yookassa`). Parsing
//! it once into [`CallbackAction`] keeps string handling at the edge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BillingError;
use crate::models::PaymentMethod;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallbackAction {
    /// New key on the plan's host.
    Buy { plan_id: i64, method: PaymentMethod },
    /// Extend an existing key with the given plan.
    Renew {
        credential_id: i64,
        plan_id: i64,
        method: PaymentMethod,
    },
    Trial,
    Check { payment_id: String },
    ShowKey { credential_id: i64 },
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackAction::Buy { plan_id, method } => write!(f, "buy:{plan_id}:{method}"),
            CallbackAction::Renew {
                credential_id,
                plan_id,
                method,
            } => write!(f, "renew:{credential_id}:{plan_id}:{method}"),
            CallbackAction::Trial => f.write_str("trial"),
            CallbackAction::Check { payment_id } => write!(f, "check:{payment_id}"),
            CallbackAction::ShowKey { credential_id } => write!(f, "key:{credential_id}"),
        }
    }
}

fn id(raw: &str, what: &str) -> Result<i64, BillingError> {
    raw.parse()
        .map_err(|_| BillingError::Validation(format!("bad {what} '{raw}' in callback")))
}

impl FromStr for CallbackAction {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (verb, rest) = s.split_once(':').unwrap_or((s, ""));
        let parts: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(':').collect() };

        match (verb, parts.as_slice()) {
            ("buy", [plan, method]) => Ok(CallbackAction::Buy {
                plan_id: id(plan, "plan id")?,
                method: method.parse()?,
            }),
            ("renew", [credential, plan, method]) => Ok(CallbackAction::Renew {
                credential_id: id(credential, "credential id")?,
                plan_id: id(plan, "plan id")?,
                method: method.parse()?,
            }),
            ("trial", []) => Ok(CallbackAction::Trial),
            // Provider ids never contain ':' but keep anything after the verb.
            ("check", [_, ..]) => Ok(CallbackAction::Check {
                payment_id: rest.to_string(),
            }),
            ("key", [credential]) => Ok(CallbackAction::ShowKey {
                credential_id: id(credential, "credential id")?,
            }),
            _ => Err(BillingError::Validation(format!("unknown callback '{s}'"))),
        }
    }
}
