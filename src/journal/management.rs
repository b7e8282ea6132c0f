//! Management call surface
//!
//! External tooling drives a journal through numbered methods. Arguments
//! arrive as JSON; the reply text is JSON for queries and a short message
//! otherwise.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::engine::Journal;
use super::{IoResult, QueueStore};

/// Writes [`JournalStats`](super::JournalStats) as JSON into the reply.
pub const METHOD_QUERY_STATS: u32 = 1;

/// Flushes buffered records. Takes `{"block": bool}`, non-blocking by default.
pub const METHOD_FLUSH: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagementStatus {
    Ok,
    UnknownMethod,
    Failed,
}

/// Something a management agent can invoke methods on.
pub trait Manageable {
    fn management_method(&self, method_id: u32, args: &Value, text: &mut String) -> ManagementStatus;
}

impl Manageable for Journal {
    fn management_method(&self, method_id: u32, args: &Value, text: &mut String) -> ManagementStatus {
        debug!(journal = %self.id(), method_id, "management method");
        text.clear();
        match method_id {
            METHOD_QUERY_STATS => match serde_json::to_string_pretty(&self.stats()) {
                Ok(json) => {
                    text.push_str(&json);
                    ManagementStatus::Ok
                }
                Err(e) => {
                    text.push_str(&e.to_string());
                    ManagementStatus::Failed
                }
            },
            METHOD_FLUSH => {
                let block = args.get("block").and_then(Value::as_bool).unwrap_or(false);
                match self.flush(block) {
                    IoResult::Ok => {
                        text.push_str("flushed");
                        ManagementStatus::Ok
                    }
                    IoResult::Failed => {
                        text.push_str("journal has a failed write");
                        ManagementStatus::Failed
                    }
                }
            }
            other => {
                text.push_str(&format!("unknown management method {}", other));
                ManagementStatus::UnknownMethod
            }
        }
    }
}
