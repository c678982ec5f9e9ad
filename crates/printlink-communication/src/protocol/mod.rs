//! Line protocol spoken by RepRap-style firmware
//!
//! Checksum framing, the resend ledger, line-matching callback tables and
//! the parsers for status replies.

pub mod callbacks;
pub mod checksum;
pub mod ledger;
pub mod parse;

pub use callbacks::{LineCallbacks, Matcher};
pub use checksum::{checksum, frame_line, split_frame};
pub use ledger::{ChecksumLedger, LEDGER_CAPACITY};
