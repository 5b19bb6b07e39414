//! Deadlock-free locking order for two-account balance changes.
//!
//! Two transfers that touch the same pair of accounts in opposite directions
//! would deadlock if each locked its debit account first. Every workflow that
//! adjusts two balances in one transaction must instead lock the lower
//! [`AccountId`] first, whatever role it plays in the transfer.

use crate::account::{Account, BalanceAdjustment};
use crate::transfer::TransferMoneyParams;

/// Balance changes of `params` in locking order (ascending account id).
pub fn ordered_adjustments(params: &TransferMoneyParams) -> [BalanceAdjustment; 2] {
    let [debit, credit] = params.balance_adjustments();
    if debit.account_id <= credit.account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

/// Maps accounts updated in locking order back to `(from, to)`.
pub fn into_roles(params: &TransferMoneyParams, locked: [Account; 2]) -> (Account, Account) {
    let [first, second] = locked;
    if first.id == params.from_account_id {
        (first, second)
    } else {
        (second, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Currency;
    use chrono::Utc;
    use proptest::prelude::*;
    use simplebank_core::AccountId;

    fn params(from: i64, to: i64) -> TransferMoneyParams {
        TransferMoneyParams {
            from_account_id: AccountId::new(from),
            to_account_id: AccountId::new(to),
            amount: 10,
        }
    }

    fn account(id: AccountId) -> Account {
        Account {
            id,
            owner: "o".into(),
            balance: 0,
            currency: Currency::Usd,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn opposite_directions_share_one_order() {
        let ab = ordered_adjustments(&params(1, 2));
        let ba = ordered_adjustments(&params(2, 1));
        assert_eq!(ab[0].account_id, AccountId::new(1));
        assert_eq!(ba[0].account_id, AccountId::new(1));
        assert_eq!(ab[0].amount, -10);
        assert_eq!(ba[0].amount, 10);
    }

    #[test]
    fn roles_are_restored_after_locking() {
        let p = params(9, 4);
        let [first, second] = ordered_adjustments(&p);
        let (from, to) = into_roles(&p, [account(first.account_id), account(second.account_id)]);
        assert_eq!(from.id, AccountId::new(9));
        assert_eq!(to.id, AccountId::new(4));
    }

    proptest! {
        #[test]
        fn order_is_ascending_and_preserves_amounts(a in 1i64..10_000, b in 1i64..10_000) {
            prop_assume!(a != b);
            let p = params(a, b);
            let [first, second] = ordered_adjustments(&p);
            prop_assert!(first.account_id < second.account_id);
            prop_assert_eq!(first.amount + second.amount, 0);
        }
    }
}
