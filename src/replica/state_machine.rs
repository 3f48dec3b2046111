//! Partition log state machine.
//!
//! Applying is deterministic and idempotent per index, so a producer retry
//! that lands twice in the Raft log still yields a single record. A different
//! record at an occupied index is refused and leaves the stored one in place.

use std::collections::BTreeMap;

use super::commands::{LogCommand, LogResponse};
use crate::error::{Error, Result};
use crate::types::{LogIndex, LogRecord};

#[derive(Debug, Clone, Default)]
pub struct PartitionLog {
    records: BTreeMap<LogIndex, LogRecord>,
}

impl PartitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: LogCommand) -> LogResponse {
        let record = command.into_record();
        let index = record.index;
        if let Some(existing) = self.records.get(&index) {
            if existing.producer_id == record.producer_id && existing.message == record.message {
                return LogResponse::AlreadyPresent { index };
            }
            return LogResponse::Conflict { index };
        }
        self.records.insert(index, record);
        LogResponse::Appended { index }
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogRecord> {
        self.records.get(&index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let records: Vec<&LogRecord> = self.records.values().collect();
        Ok(bincode::serialize(&records)?)
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<()> {
        let records: Vec<LogRecord> = bincode::deserialize(data)
            .map_err(|e| Error::Storage(format!("partition snapshot is corrupted: {}", e)))?;
        self.records = records.into_iter().map(|r| (r.index, r)).collect();
        Ok(())
    }
}
