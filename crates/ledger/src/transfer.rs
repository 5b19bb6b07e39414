use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simplebank_core::{AccountId, DomainError, DomainResult, Entity, TransferId};

use crate::account::{validate_page, Account, BalanceAdjustment};
use crate::entry::{CreateEntryParams, Entry};

/// Immutable record of money moved from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Always positive, in minor units.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Entity for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

impl ListTransfersParams {
    pub fn validate(&self) -> DomainResult<()> {
        validate_page(self.limit, self.offset)
    }
}

/// Input of the atomic transfer workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMoneyParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferMoneyParams {
    pub fn validate(&self) -> DomainResult<()> {
        if self.amount <= 0 {
            return Err(DomainError::validation("transfer amount must be positive"));
        }
        if self.from_account_id == self.to_account_id {
            return Err(DomainError::validation(
                "cannot transfer between the same account",
            ));
        }
        Ok(())
    }

    pub fn transfer_params(&self) -> CreateTransferParams {
        CreateTransferParams {
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount: self.amount,
        }
    }

    /// The debit and credit entries, in that order.
    pub fn entry_params(&self) -> [CreateEntryParams; 2] {
        [
            CreateEntryParams {
                account_id: self.from_account_id,
                amount: -self.amount,
            },
            CreateEntryParams {
                account_id: self.to_account_id,
                amount: self.amount,
            },
        ]
    }

    /// Balance changes in role order (debit first). Use
    /// [`crate::ordering::ordered_adjustments`] to get the locking order.
    pub fn balance_adjustments(&self) -> [BalanceAdjustment; 2] {
        [
            BalanceAdjustment {
                account_id: self.from_account_id,
                amount: -self.amount,
            },
            BalanceAdjustment {
                account_id: self.to_account_id,
                amount: self.amount,
            },
        ]
    }
}

/// Everything a completed transfer wrote, with accounts as of commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMoneyResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

impl TransferMoneyResult {
    /// Double-entry check: the two entries cancel out and match the transfer.
    pub fn check_conservation(&self) -> DomainResult<()> {
        let t = &self.transfer;
        if self.from_entry.account_id != t.from_account_id
            || self.to_entry.account_id != t.to_account_id
        {
            return Err(DomainError::invariant("entries reference the wrong accounts"));
        }
        if self.from_account.id != t.from_account_id || self.to_account.id != t.to_account_id {
            return Err(DomainError::invariant("accounts returned in the wrong roles"));
        }
        if self.from_entry.amount != -t.amount || self.to_entry.amount != t.amount {
            return Err(DomainError::invariant(
                "entry amounts do not match transfer amount",
            ));
        }
        if i128::from(self.from_entry.amount) + i128::from(self.to_entry.amount) != 0 {
            return Err(DomainError::invariant("debits must equal credits"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Currency;
    use proptest::prelude::*;
    use simplebank_core::EntryId;

    fn params(from: i64, to: i64, amount: i64) -> TransferMoneyParams {
        TransferMoneyParams {
            from_account_id: AccountId::new(from),
            to_account_id: AccountId::new(to),
            amount,
        }
    }

    fn account(id: AccountId, balance: i64) -> Account {
        Account {
            id,
            owner: format!("owner-{id}"),
            balance,
            currency: Currency::Usd,
            created_at: Utc::now(),
        }
    }

    /// Builds the result a store would return for `p`, starting from `balances`.
    fn simulate(p: &TransferMoneyParams, balances: (i64, i64)) -> TransferMoneyResult {
        let now = Utc::now();
        let [debit, credit] = p.entry_params();
        let mut from = account(p.from_account_id, balances.0);
        let mut to = account(p.to_account_id, balances.1);
        let [a, b] = p.balance_adjustments();
        from.apply(&a).unwrap();
        to.apply(&b).unwrap();
        TransferMoneyResult {
            transfer: Transfer {
                id: TransferId::new(1),
                from_account_id: p.from_account_id,
                to_account_id: p.to_account_id,
                amount: p.amount,
                created_at: now,
            },
            from_entry: Entry {
                id: EntryId::new(1),
                account_id: debit.account_id,
                amount: debit.amount,
                created_at: now,
            },
            to_entry: Entry {
                id: EntryId::new(2),
                account_id: credit.account_id,
                amount: credit.amount,
                created_at: now,
            },
            from_account: from,
            to_account: to,
        }
    }

    #[test]
    fn rejects_non_positive_amount_and_self_transfer() {
        assert!(matches!(
            params(1, 2, 0).validate(),
            Err(DomainError::Validation(_))
        ));
        assert!(params(1, 2, -5).validate().is_err());
        assert!(params(3, 3, 10).validate().is_err());
        assert!(params(1, 2, 10).validate().is_ok());
    }

    #[test]
    fn scenario_moves_thirty() {
        let result = simulate(&params(1, 2, 30), (100, 50));
        result.check_conservation().unwrap();
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.balance, 80);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.to_entry.amount, 30);
    }

    #[test]
    fn conservation_detects_swapped_entries() {
        let mut result = simulate(&params(1, 2, 30), (100, 50));
        core::mem::swap(&mut result.from_entry, &mut result.to_entry);
        assert!(result.check_conservation().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any valid transfer leaves the combined balance unchanged
        /// and produces entries that sum to zero.
        #[test]
        fn valid_transfers_conserve_money(
            from in 1i64..1_000,
            to in 1i64..1_000,
            amount in 1i64..1_000_000,
            from_balance in -1_000_000i64..1_000_000,
            to_balance in -1_000_000i64..1_000_000,
        ) {
            prop_assume!(from != to);
            let p = params(from, to, amount);
            prop_assert!(p.validate().is_ok());

            let result = simulate(&p, (from_balance, to_balance));
            prop_assert!(result.check_conservation().is_ok());
            prop_assert_eq!(
                result.from_account.balance + result.to_account.balance,
                from_balance + to_balance
            );
        }
    }
}
