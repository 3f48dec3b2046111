//! Commands replicated through a partition's Raft log and the responses the
//! state machine produces when applying them.

use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, LogRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogCommand {
    /// Store `message` at partition position `index`.
    Append {
        index: LogIndex,
        producer_id: String,
        message: String,
        timestamp_ms: i64,
    },
}

impl LogCommand {
    pub fn append(
        index: LogIndex,
        producer_id: impl Into<String>,
        message: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        LogCommand::Append {
            index,
            producer_id: producer_id.into(),
            message: message.into(),
            timestamp_ms,
        }
    }

    pub fn into_record(self) -> LogRecord {
        match self {
            LogCommand::Append {
                index,
                producer_id,
                message,
                timestamp_ms,
            } => LogRecord {
                index,
                producer_id,
                message,
                timestamp_ms,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogResponse {
    /// Blank and membership entries.
    Ok,
    Appended { index: LogIndex },
    /// A retried append hit an index that is already stored; nothing changed.
    AlreadyPresent { index: LogIndex },
    /// The index holds a different record; nothing changed.
    Conflict { index: LogIndex },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_into_record() {
        let record = LogCommand::append(4, "p1", "hello", 1_700).into_record();
        assert_eq!(record.index, 4);
        assert_eq!(record.producer_id, "p1");
        assert_eq!(record.message, "hello");
        assert_eq!(record.timestamp_ms, 1_700);
    }

    #[test]
    fn test_bincode_round_trip() {
        let command = LogCommand::append(1, "p", "m", 0);
        let bytes = bincode::serialize(&command).unwrap();
        let back: LogCommand = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, command);
    }
}
