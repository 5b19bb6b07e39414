//! Infrastructure layer: ledger store, task queue, mail, config.

pub mod config;
pub mod db;
pub mod mail;
pub mod tasks;

#[cfg(test)]
mod integration_tests;
