//! Decode primitives
//!
//! Small, pure string transforms that the hoster pipelines chain together.
//! Each fallible primitive reports `ExtensionError::DecodeError`; pipelines
//! turn those into `None` at their own boundary.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::core::error::{ExtensionError, Result};

fn decode_error(stage: &str, detail: impl std::fmt::Display) -> ExtensionError {
    ExtensionError::DecodeError(format!("{}: {}", stage, detail))
}

/// Base64-decode to UTF-8, tolerating whitespace, missing padding and the URL-safe alphabet
pub fn base64_decode(input: &str) -> Result<String> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(decode_error("base64", "empty input"));
    }

    let bytes = STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD_NO_PAD.decode(&compact))
        .or_else(|_| URL_SAFE.decode(&compact))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&compact))
        .map_err(|e| decode_error("base64", e))?;

    String::from_utf8(bytes).map_err(|e| decode_error("base64", e))
}

pub fn base64_encode(input: &str) -> String {
    STANDARD.encode(input.as_bytes())
}

/// 26-letter rotation by 13; everything else passes through
pub fn rot13(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a' + 13) % 26) + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A' + 13) % 26) + b'A') as char,
            _ => c,
        })
        .collect()
}

pub fn swap_case(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() {
                c.to_ascii_uppercase()
            } else if c.is_ascii_uppercase() {
                c.to_ascii_lowercase()
            } else {
                c
            }
        })
        .collect()
}

pub fn reverse(input: &str) -> String {
    input.chars().rev().collect()
}

/// `"68747470"` → `"http"`; each pair is one code point in 0..=255
pub fn hex_pairs_to_string(input: &str) -> Result<String> {
    let digits = input.trim();
    if digits.len() % 2 != 0 {
        return Err(decode_error("hex", "odd number of digits"));
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .map(char::from)
                .ok_or_else(|| decode_error("hex", format!("invalid pair {:?}", String::from_utf8_lossy(pair))))
        })
        .collect()
}

/// Inverse of [`hex_pairs_to_string`]
pub fn string_to_hex_pairs(input: &str) -> Result<String> {
    input
        .chars()
        .map(|c| {
            u8::try_from(c as u32)
                .map(|b| format!("{:02x}", b))
                .map_err(|_| decode_error("hex", format!("code point {:?} does not fit a pair", c)))
        })
        .collect()
}

/// Add `delta` to every code point
pub fn shift_chars(input: &str, delta: i32) -> Result<String> {
    input
        .chars()
        .map(|c| {
            let shifted = c as i64 + delta as i64;
            u32::try_from(shifted)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| decode_error("shift", format!("{:?} shifted by {} is not a character", c, delta)))
        })
        .collect()
}

/// Remove every occurrence of each token
pub fn strip_tokens(input: &str, tokens: &[&str]) -> String {
    tokens
        .iter()
        .filter(|t| !t.is_empty())
        .fold(input.to_string(), |acc, token| acc.replace(token, ""))
}
