//! The chain boundary
//!
//! Host intrinsics never touch chain state directly. Everything they need
//! (identifiers, action payload, authorization, time and the key-value
//! table store) goes through an `ApplyContext` supplied per execution.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// Failure reported by a host function
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// `check`, `check_message` or `assert_sha256` failed
    #[error("Assertion failure: {message}")]
    AssertionFailure {
        /// Message supplied by the contract
        message: String,
    },

    /// The contract called `abort`
    #[error("Contract aborted")]
    Abort,

    /// `require_auth` for an account that did not authorize the action
    #[error("Missing authority of account {account}")]
    MissingAuthorization {
        /// Account whose authority was required
        account: u64,
    },

    /// A table iterator that does not refer to a live row
    #[error("Invalid table iterator {0}")]
    InvalidIterator(i32),

    /// The table store rejected the operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Misuse of a host function
    #[error("{0}")]
    Other(String),
}

/// Per-action state and services provided by the chain
pub trait ApplyContext {
    /// Account whose code is running
    fn receiver(&self) -> u64;

    /// Account the action was sent to
    fn account(&self) -> u64;

    /// Action name
    fn action(&self) -> u64;

    /// Serialized action payload
    fn action_data(&self) -> &[u8];

    /// Fail unless `account` authorized the action
    fn require_authorization(&mut self, account: u64) -> Result<(), HostError>;

    /// Whether `account` authorized the action
    fn has_authorization(&self, account: u64) -> bool;

    /// Whether `account` exists
    fn is_account(&self, account: u64) -> bool;

    /// Block time in microseconds since the epoch
    fn current_time_us(&self) -> u64;

    /// Insert a row into the receiver's table, returning its iterator
    fn db_store_i64(
        &mut self,
        scope: u64,
        table: u64,
        payer: u64,
        id: u64,
        value: &[u8],
    ) -> Result<i32, HostError>;

    /// Iterator of a row, or `-1` if absent
    fn db_find_i64(&mut self, code: u64, scope: u64, table: u64, id: u64) -> Result<i32, HostError>;

    /// Row contents behind an iterator
    fn db_get_i64(&self, iterator: i32) -> Result<&[u8], HostError>;

    /// Replace the contents of a row
    fn db_update_i64(&mut self, iterator: i32, payer: u64, value: &[u8]) -> Result<(), HostError>;

    /// Delete a row
    fn db_remove_i64(&mut self, iterator: i32) -> Result<(), HostError>;
}

type RowKey = (u64, u64, u64, u64);

/// Self-contained `ApplyContext` backed by ordered maps
///
/// Serves tooling and tests; a chain supplies its own implementation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContext {
    /// Running account
    pub receiver: u64,
    /// Target account
    pub account: u64,
    /// Action name
    pub action: u64,
    /// Action payload
    pub data: Vec<u8>,
    /// Accounts that authorized the action
    pub authorizations: BTreeSet<u64>,
    /// Existing accounts
    pub accounts: BTreeSet<u64>,
    /// Block time
    pub time_us: u64,
    /// Rows keyed by `(code, scope, table, id)`
    pub rows: BTreeMap<RowKey, (u64, Vec<u8>)>,
    iterators: Vec<Option<RowKey>>,
}

impl InMemoryContext {
    /// Context for one action
    pub fn new(receiver: u64, account: u64, action: u64, data: Vec<u8>) -> Self {
        InMemoryContext { receiver, account, action, data, ..Default::default() }
    }

    /// Row content by key
    pub fn row(&self, code: u64, scope: u64, table: u64, id: u64) -> Option<&[u8]> {
        self.rows.get(&(code, scope, table, id)).map(|(_, v)| v.as_slice())
    }

    fn iterator_for(&mut self, key: RowKey) -> i32 {
        if let Some(pos) = self.iterators.iter().position(|k| *k == Some(key)) {
            return pos as i32;
        }
        self.iterators.push(Some(key));
        (self.iterators.len() - 1) as i32
    }

    fn key_of(&self, iterator: i32) -> Result<RowKey, HostError> {
        usize::try_from(iterator)
            .ok()
            .and_then(|i| self.iterators.get(i).copied().flatten())
            .filter(|key| self.rows.contains_key(key))
            .ok_or(HostError::InvalidIterator(iterator))
    }
}

impl ApplyContext for InMemoryContext {
    fn receiver(&self) -> u64 {
        self.receiver
    }

    fn account(&self) -> u64 {
        self.account
    }

    fn action(&self) -> u64 {
        self.action
    }

    fn action_data(&self) -> &[u8] {
        &self.data
    }

    fn require_authorization(&mut self, account: u64) -> Result<(), HostError> {
        if self.authorizations.contains(&account) {
            Ok(())
        } else {
            Err(HostError::MissingAuthorization { account })
        }
    }

    fn has_authorization(&self, account: u64) -> bool {
        self.authorizations.contains(&account)
    }

    fn is_account(&self, account: u64) -> bool {
        self.accounts.contains(&account)
    }

    fn current_time_us(&self) -> u64 {
        self.time_us
    }

    fn db_store_i64(
        &mut self,
        scope: u64,
        table: u64,
        payer: u64,
        id: u64,
        value: &[u8],
    ) -> Result<i32, HostError> {
        let key = (self.receiver, scope, table, id);
        if self.rows.contains_key(&key) {
            return Err(HostError::Storage(format!("Row {} already exists", id)));
        }
        self.rows.insert(key, (payer, value.to_vec()));
        Ok(self.iterator_for(key))
    }

    fn db_find_i64(&mut self, code: u64, scope: u64, table: u64, id: u64) -> Result<i32, HostError> {
        let key = (code, scope, table, id);
        if self.rows.contains_key(&key) {
            Ok(self.iterator_for(key))
        } else {
            Ok(-1)
        }
    }

    fn db_get_i64(&self, iterator: i32) -> Result<&[u8], HostError> {
        let key = self.key_of(iterator)?;
        self.rows
            .get(&key)
            .map(|(_, v)| v.as_slice())
            .ok_or(HostError::InvalidIterator(iterator))
    }

    fn db_update_i64(&mut self, iterator: i32, payer: u64, value: &[u8]) -> Result<(), HostError> {
        let key = self.key_of(iterator)?;
        if key.0 != self.receiver {
            return Err(HostError::Storage("Cannot modify another contract's table".to_string()));
        }
        self.rows.insert(key, (payer, value.to_vec()));
        Ok(())
    }

    fn db_remove_i64(&mut self, iterator: i32) -> Result<(), HostError> {
        let key = self.key_of(iterator)?;
        if key.0 != self.receiver {
            return Err(HostError::Storage("Cannot modify another contract's table".to_string()));
        }
        self.rows.remove(&key);
        if let Some(slot) = self.iterators.get_mut(iterator as usize) {
            *slot = None;
        }
        Ok(())
    }
}
