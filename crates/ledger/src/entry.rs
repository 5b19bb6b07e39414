use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_core::{AccountId, DomainResult, Entity, EntryId};

use crate::account::validate_page;

/// Immutable record of one balance change on one account.
///
/// `amount` is signed: positive credits the account, negative debits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Entity for Entry {
    type Id = EntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

impl ListEntriesParams {
    pub fn validate(&self) -> DomainResult<()> {
        validate_page(self.limit, self.offset)
    }
}
