//! msgjournal - a durable, asynchronous message journal for broker queues
//!
//! A [`Journal`](journal::Journal) records enqueues, dequeues and
//! transaction boundaries for one queue into fixed-size extent files, writes
//! them through a storage worker thread, and rebuilds the queue's state
//! (including in-doubt transactions) on recovery.

pub mod aio;
pub mod cli;
pub mod config;
pub mod crash_point;
pub mod extent;
pub mod format;
pub mod journal;
pub mod observability;
pub mod recovery;
pub mod timer;
