//! Packed-script unpacker
//!
//! Reverses the common `eval(function(p,a,c,k,e,d){...}(payload, base, count, dict))`
//! obfuscation: every base-N word in the payload is an index into the
//! pipe-delimited dictionary.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;

use crate::core::error::{ExtensionError, Result};

lazy_static! {
    static ref MARKER: Regex =
        Regex::new(r"eval\s*\(\s*function\s*\(\s*p\s*,\s*a\s*,\s*c\s*,\s*k\s*,\s*e\s*,\s*[dr]\s*\)").unwrap();
    static ref PARAMS: Regex = Regex::new(
        r#"\}\s*\(\s*'((?:[^'\\]|\\.)*)'\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*'((?:[^'\\]|\\.)*)'\s*\.split\(\s*'\|'\s*\)"#
    )
    .unwrap();
    static ref WORD: Regex = Regex::new(r"\b\w+\b").unwrap();
}

const MAX_BASE: u32 = 95;

/// Digits at or above this value encode to punctuation, which `\b\w+\b`
/// tokenization can never match
const WORD_DIGITS: usize = 62;

/// The four parameters embedded in a packed script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedParams {
    pub payload: String,
    pub base: u32,
    pub count: usize,
    pub dictionary: Vec<String>,
}

pub fn is_packed(source: &str) -> bool {
    MARKER.is_match(source)
}

/// Extract the parameters of the first packed block
pub fn parse_params(source: &str) -> Result<PackedParams> {
    let start = MARKER
        .find(source)
        .ok_or_else(|| ExtensionError::DecodeError("no packed-script marker".to_string()))?
        .start();

    let caps = PARAMS
        .captures(&source[start..])
        .ok_or_else(|| ExtensionError::DecodeError("packed-script parameters not found".to_string()))?;

    let base: u32 = caps[2]
        .parse()
        .map_err(|_| ExtensionError::DecodeError(format!("invalid base '{}'", &caps[2])))?;
    let count: usize = caps[3]
        .parse()
        .map_err(|_| ExtensionError::DecodeError(format!("invalid symbol count '{}'", &caps[3])))?;

    if !(2..=MAX_BASE).contains(&base) {
        return Err(ExtensionError::DecodeError(format!("unsupported base {}", base)));
    }
    if let Some(index) = (0..count).find(|&i| !has_word_encoding(i, base)) {
        return Err(ExtensionError::DecodeError(format!(
            "symbol {} of {} has no word encoding in base {}",
            index, count, base
        )));
    }

    Ok(PackedParams {
        payload: unescape(&caps[1]),
        base,
        count,
        dictionary: unescape(&caps[4]).split('|').map(str::to_string).collect(),
    })
}

/// Unpack the first packed block in `source`
pub fn unpack(source: &str) -> Result<String> {
    let params = parse_params(source)?;
    Ok(substitute(&params))
}

/// Rebuild the script from its parameters.
///
/// The lookup table is filled from the highest index down so an index whose
/// dictionary slot is empty never shadows another one; the payload is then
/// rewritten in a single pass so replaced text is never substituted again.
pub fn substitute(params: &PackedParams) -> String {
    let count = params.count.min(params.dictionary.len());
    let mut table: HashMap<String, &str> = HashMap::with_capacity(count);

    for index in (0..count).rev() {
        let word = &params.dictionary[index];
        if word.is_empty() {
            continue;
        }
        table.entry(encode_index(index, params.base)).or_insert(word.as_str());
    }

    WORD.replace_all(&params.payload, |caps: &Captures| {
        let token = &caps[0];
        table.get(token).map(|w| w.to_string()).unwrap_or_else(|| token.to_string())
    })
    .into_owned()
}

/// Base-N word for `index`: digits 0-35 use base 36, higher digits map to `char(d + 29)`
pub fn encode_index(index: usize, base: u32) -> String {
    let base = base.max(2) as usize;
    let digit = index % base;
    let prefix = if index < base {
        String::new()
    } else {
        encode_index(index / base, base as u32)
    };

    let last = if digit > 35 {
        char::from_u32(digit as u32 + 29).unwrap_or('?')
    } else {
        char::from_digit(digit as u32, 36).unwrap_or('?')
    };

    format!("{}{}", prefix, last)
}

/// Whether every base-N digit of `index` is below the word alphabet limit
fn has_word_encoding(mut index: usize, base: u32) -> bool {
    let base = base.max(2) as usize;
    if base <= WORD_DIGITS {
        return true;
    }
    loop {
        if index % base >= WORD_DIGITS {
            return false;
        }
        if index < base {
            return true;
        }
        index /= base;
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
