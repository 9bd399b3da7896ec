//! DatabaseTransaction wrapper for consistent transaction management
//!
//! Records are JSON-encoded values in `u64`-keyed tables. Secondary indexes
//! map string keys to record ids and double as uniqueness constraints: an
//! insert of an existing key fails with [`VirtanceError::AlreadyExists`]
//! inside the same write transaction that would have created the duplicate.

use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use tracing::debug;

use super::{IndexTable, Record, SEQUENCE_TABLE};
use crate::{
    common::error_context::{JsonContext, StorageContext},
    error::{VirtanceError, VirtanceResult},
};

/// Wrapper for database transactions with consistent error handling and utilities
pub struct DatabaseTransaction {
    txn: TransactionInner,
    operation: String,
}

enum TransactionInner {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

fn decode_entry<R, T>(table: &T, id: u64, operation: &str) -> VirtanceResult<Option<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
{
    match table
        .get(id)
        .storage_context(&format!("get {} for {}", R::KIND, operation))?
    {
        Some(data) => {
            let value = serde_json::from_slice(data.value())
                .json_context(&format!("decode {} {} for {}", R::KIND, id, operation))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn decode_all<R, T>(table: &T, operation: &str) -> VirtanceResult<Vec<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
{
    let iter = table
        .iter()
        .storage_context(&format!("iterate {} for {}", R::KIND, operation))?;

    let mut results = Vec::new();
    for entry in iter {
        let (_, value) = entry.storage_context(&format!("read {} entry for {}", R::KIND, operation))?;
        results.push(
            serde_json::from_slice(value.value())
                .json_context(&format!("decode {} during scan for {}", R::KIND, operation))?,
        );
    }
    Ok(results)
}

fn lookup_index<T>(table: &T, key: &str, operation: &str) -> VirtanceResult<Option<u64>>
where
    T: ReadableTable<&'static str, u64>,
{
    Ok(table
        .get(key)
        .storage_context(&format!("get index entry for {}", operation))?
        .map(|guard| guard.value()))
}

impl DatabaseTransaction {
    /// Begin a read transaction with context
    pub fn begin_read(database: &Database, operation: impl Into<String>) -> VirtanceResult<Self> {
        let operation = operation.into();
        let txn = database
            .begin_read()
            .storage_context(&format!("begin read transaction for {}", operation))?;

        debug!("Started read transaction for: {}", operation);

        Ok(Self {
            txn: TransactionInner::Read(txn),
            operation,
        })
    }

    /// Begin a write transaction with context
    pub fn begin_write(database: &Database, operation: impl Into<String>) -> VirtanceResult<Self> {
        let operation = operation.into();
        let txn = database
            .begin_write()
            .storage_context(&format!("begin write transaction for {}", operation))?;

        debug!("Started write transaction for: {}", operation);

        Ok(Self {
            txn: TransactionInner::Write(txn),
            operation,
        })
    }

    fn writer(&self) -> VirtanceResult<&WriteTransaction> {
        match &self.txn {
            TransactionInner::Write(txn) => Ok(txn),
            TransactionInner::Read(_) => Err(VirtanceError::Storage {
                operation: format!("write inside read transaction: {}", self.operation),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "Read-only transaction",
                )),
            }),
        }
    }

    /// Fetch one record by id
    pub fn get_record<R: Record>(&self, id: u64) -> VirtanceResult<Option<R>> {
        let context = format!("open {} table for {}", R::KIND, self.operation);
        match &self.txn {
            TransactionInner::Read(txn) => {
                let table = txn.open_table(R::TABLE).storage_context(&context)?;
                decode_entry(&table, id, &self.operation)
            }
            TransactionInner::Write(txn) => {
                let table = txn.open_table(R::TABLE).storage_context(&context)?;
                decode_entry(&table, id, &self.operation)
            }
        }
    }

    /// Fetch one record that must exist
    pub fn require_record<R: Record>(&self, id: u64) -> VirtanceResult<R> {
        self.get_record(id)?.ok_or_else(|| VirtanceError::NotFound {
            resource: format!("{} {}", R::KIND, id),
        })
    }

    /// Every record of a table, in id order
    pub fn scan_records<R: Record>(&self) -> VirtanceResult<Vec<R>> {
        let context = format!("open {} table for {}", R::KIND, self.operation);
        match &self.txn {
            TransactionInner::Read(txn) => {
                let table = txn.open_table(R::TABLE).storage_context(&context)?;
                decode_all(&table, &self.operation)
            }
            TransactionInner::Write(txn) => {
                let table = txn.open_table(R::TABLE).storage_context(&context)?;
                decode_all(&table, &self.operation)
            }
        }
    }

    /// Insert or replace a record
    pub fn put_record<R: Record>(&self, record: &R) -> VirtanceResult<()> {
        let data = serde_json::to_vec(record)
            .json_context(&format!("encode {} for {}", R::KIND, self.operation))?;
        let mut table = self
            .writer()?
            .open_table(R::TABLE)
            .storage_context(&format!("open {} table for {}", R::KIND, self.operation))?;
        table
            .insert(record.record_id(), data.as_slice())
            .storage_context(&format!("insert {} for {}", R::KIND, self.operation))?;
        Ok(())
    }

    /// Remove a record, returning whether it existed
    pub fn remove_record<R: Record>(&self, id: u64) -> VirtanceResult<bool> {
        let mut table = self
            .writer()?
            .open_table(R::TABLE)
            .storage_context(&format!("open {} table for {}", R::KIND, self.operation))?;
        let removed = table
            .remove(id)
            .storage_context(&format!("remove {} for {}", R::KIND, self.operation))?
            .is_some();
        Ok(removed)
    }

    /// Look up a secondary index entry
    pub fn get_index(&self, index: IndexTable, key: &str) -> VirtanceResult<Option<u64>> {
        let context = format!("open index for {}", self.operation);
        match &self.txn {
            TransactionInner::Read(txn) => {
                let table = txn.open_table(index).storage_context(&context)?;
                lookup_index(&table, key, &self.operation)
            }
            TransactionInner::Write(txn) => {
                let table = txn.open_table(index).storage_context(&context)?;
                lookup_index(&table, key, &self.operation)
            }
        }
    }

    /// Claim a unique index key
    ///
    /// Fails with `AlreadyExists` when the key is already held, leaving the
    /// existing entry untouched.
    pub fn insert_unique(&self, index: IndexTable, key: &str, id: u64) -> VirtanceResult<()> {
        let mut table = self
            .writer()?
            .open_table(index)
            .storage_context(&format!("open index for {}", self.operation))?;

        let taken = table
            .get(key)
            .storage_context(&format!("check index entry for {}", self.operation))?
            .is_some();
        if taken {
            return Err(VirtanceError::AlreadyExists {
                resource: key.to_string(),
            });
        }

        table
            .insert(key, id)
            .storage_context(&format!("insert index entry for {}", self.operation))?;
        Ok(())
    }

    pub fn remove_index(&self, index: IndexTable, key: &str) -> VirtanceResult<bool> {
        let mut table = self
            .writer()?
            .open_table(index)
            .storage_context(&format!("open index for {}", self.operation))?;
        let removed = table
            .remove(key)
            .storage_context(&format!("remove index entry for {}", self.operation))?
            .is_some();
        Ok(removed)
    }

    /// Next value of a named monotonic sequence, starting at 1
    pub fn next_id(&self, sequence: &str) -> VirtanceResult<u64> {
        let mut table = self
            .writer()?
            .open_table(SEQUENCE_TABLE)
            .storage_context(&format!("open sequences for {}", self.operation))?;
        let current = lookup_index(&table, sequence, &self.operation)?.unwrap_or(0);
        let next = current + 1;
        table
            .insert(sequence, next)
            .storage_context(&format!("advance sequence {} for {}", sequence, self.operation))?;
        Ok(next)
    }

    /// Commit the transaction if it's a write transaction
    pub fn commit(self) -> VirtanceResult<()> {
        match self.txn {
            TransactionInner::Write(write_txn) => {
                write_txn
                    .commit()
                    .storage_context(&format!("commit transaction for {}", self.operation))?;
                debug!("Committed transaction for: {}", self.operation);
                Ok(())
            }
            TransactionInner::Read(_) => Ok(()),
        }
    }

    /// Abort a write transaction, discarding every change made in it
    pub fn abort(self) -> VirtanceResult<()> {
        match self.txn {
            TransactionInner::Write(write_txn) => {
                write_txn
                    .abort()
                    .storage_context(&format!("abort transaction for {}", self.operation))?;
                debug!("Aborted transaction for: {}", self.operation);
                Ok(())
            }
            TransactionInner::Read(_) => Ok(()),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}
