//! Read-only input policy.
//!
//! In read-only mode only passive navigation keys reach the PTY. A chunk is
//! forwarded only if every key in it is on the allow-list; otherwise the
//! whole chunk is dropped.

use std::time::{Duration, Instant};

pub const READ_ONLY_NOTICE: &str = "Read-only session: input ignored";
pub const READ_ONLY_CLOSE_NOTICE: &str = "Read-only session: close ignored";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClass {
    Passive,
    Mutating,
}

/// CSI final bytes that only move or scroll: arrows, home/end, back-tab and
/// focus reports.
const CSI_PASSIVE_FINALS: &[u8] = b"ABCDHFZIO";
/// `ESC [ n ~` keys: home, end, page up, page down.
const CSI_PASSIVE_TILDE: &[&[u8]] = &[b"1", b"4", b"5", b"6", b"7", b"8"];
/// SS3 (application cursor mode) arrows and home/end.
const SS3_PASSIVE: &[u8] = b"ABCDHF";
/// Single bytes: tab, escape, and vi-style scrolling.
const PASSIVE_BYTES: &[u8] = b"\t\x1bjk";

pub fn classify(input: &[u8]) -> InputClass {
    if input.is_empty() {
        return InputClass::Passive;
    }
    let mut rest = input;
    while !rest.is_empty() {
        let (key, tail) = next_key(rest);
        if !is_passive(key) {
            return InputClass::Mutating;
        }
        rest = tail;
    }
    InputClass::Passive
}

/// Splits off one key: an escape sequence or a single byte.
fn next_key(input: &[u8]) -> (&[u8], &[u8]) {
    if input[0] != 0x1b || input.len() == 1 {
        return input.split_at(1);
    }
    match input[1] {
        b'[' => {
            // Parameters and intermediates, then one final byte in 0x40..=0x7e.
            let end = input[2..]
                .iter()
                .position(|b| (0x40..=0x7e).contains(b))
                .map_or(input.len(), |i| i + 3);
            input.split_at(end)
        }
        b'O' if input.len() >= 3 => input.split_at(3),
        // Alt-modified key.
        _ => input.split_at(2),
    }
}

fn is_passive(key: &[u8]) -> bool {
    match key {
        [byte] => PASSIVE_BYTES.contains(byte),
        [0x1b, b'O', last] => SS3_PASSIVE.contains(last),
        [0x1b, b'[', body @ ..] => match body.split_last() {
            Some((b'~', params)) => CSI_PASSIVE_TILDE.contains(&params),
            Some((last, params)) => {
                CSI_PASSIVE_FINALS.contains(last)
                    && params.iter().all(|b| b.is_ascii_digit() || *b == b';')
            }
            None => false,
        },
        _ => false,
    }
}

/// Spaces out read-only notices on one connection.
#[derive(Debug)]
pub struct NoticeLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl NoticeLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_notify(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
