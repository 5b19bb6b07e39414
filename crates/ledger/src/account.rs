use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_core::{AccountId, DomainError, DomainResult, Entity};

/// Supported account currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Cad,
}

impl Currency {
    pub const fn as_str(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cad => "CAD",
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "CAD" => Ok(Currency::Cad),
            other => Err(DomainError::validation(format!(
                "unsupported currency: {other}"
            ))),
        }
    }
}

/// A balance-holding account owned by a user.
///
/// `balance` is expressed in minor units (e.g. cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl Entity for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Account {
    /// Applies a signed balance change in place.
    ///
    /// The adjustment must target this account and must not overflow.
    pub fn apply(&mut self, adjustment: &BalanceAdjustment) -> DomainResult<()> {
        if adjustment.account_id != self.id {
            return Err(DomainError::invariant(format!(
                "adjustment for account {} applied to account {}",
                adjustment.account_id, self.id
            )));
        }
        self.balance = self
            .balance
            .checked_add(adjustment.amount)
            .ok_or_else(|| DomainError::invariant("account balance overflow"))?;
        Ok(())
    }
}

/// Signed change to one account's balance (`balance = balance + amount`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAdjustment {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

/// Administrative balance overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAccountParams {
    pub id: AccountId,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: i64,
    pub offset: i64,
}

impl ListAccountsParams {
    pub fn validate(&self) -> DomainResult<()> {
        validate_page(self.limit, self.offset)
    }
}

pub(crate) fn validate_page(limit: i64, offset: i64) -> DomainResult<()> {
    if limit <= 0 {
        return Err(DomainError::validation("limit must be positive"));
    }
    if offset < 0 {
        return Err(DomainError::validation("offset must not be negative"));
    }
    Ok(())
}
