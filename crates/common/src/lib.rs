//! Common types for the papyrus session transaction subsystem
//!
//! This crate defines:
//! - Session identifiers (UUIDv7-based)
//! - Transaction numbers and statement ids with their sentinels
//! - Physical timestamps (microseconds since Unix epoch)
//! - Op-times (positions in the durable replication log)
//! - Read concern arguments captured on operation entry
//! - Replication operations buffered inside multi-statement transactions
//! - The process-fatal invariant helper

mod fatal;
mod op_time;
mod operation;
mod read_concern;
mod session_id;
mod stmt_id;
mod timestamp;
mod txn_number;

pub use fatal::fatal_invariant;
pub use op_time::OpTime;
pub use operation::{OpKind, ReplOperation, MAX_TRANSACTION_SIZE_BYTES};
pub use read_concern::{ReadConcernArgs, ReadConcernLevel};
pub use session_id::SessionId;
pub use stmt_id::StmtId;
pub use timestamp::Timestamp;
pub use txn_number::TxnNumber;
