//! Ledger model (double-entry money movement between accounts).
//!
//! Pure domain logic only: no IO, no SQL, no queue concerns. Storage and
//! transaction management live in `simplebank-infra`.

pub mod account;
pub mod entry;
pub mod ordering;
pub mod transfer;
pub mod user;

pub use account::{
    Account, BalanceAdjustment, CreateAccountParams, Currency, ListAccountsParams,
    UpdateAccountParams,
};
pub use entry::{CreateEntryParams, Entry, ListEntriesParams};
pub use ordering::{into_roles, ordered_adjustments};
pub use transfer::{
    CreateTransferParams, ListTransfersParams, Transfer, TransferMoneyParams, TransferMoneyResult,
};
pub use user::{CreateUserParams, CreateVerifyEmailParams, User, VerifyEmail, VERIFY_EMAIL_TTL_MINUTES};
