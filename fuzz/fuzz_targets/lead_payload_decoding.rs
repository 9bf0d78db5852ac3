#![no_main]

//! Fuzz target for queue entry decoding.
//!
//! Every byte sequence read from the queue goes through `decode_entry`.
//! It must either produce a valid lead or a `DecodeError`, never panic,
//! since a panic would stall the partition on a single poison entry.

use chrono::{TimeZone, Utc};
use leadrelay_core::{decode_entry, priority_score};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let received_at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_else(Utc::now);

    if let Ok(lead) = decode_entry(data, received_at) {
        assert!(!lead.lead_id.is_empty());
        assert!(lead.lead_score.is_finite());
        let _ = priority_score(&lead.payload);
    }
});
