/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! An order-preserving binary encoding of IndexedDB keys.
//!
//! Comparing two encodings as unsigned byte strings gives the same result as
//! <https://w3c.github.io/IndexedDB/#compare-two-keys> on the decoded keys.
//!
//! Every key starts with a type tag, ordered number < date < string < binary
//! < array. Numbers and dates are IEEE-754 doubles rewritten so that their big
//! endian bytes sort numerically. Strings and binaries are sequences of code
//! units, each written in one to three bytes, followed by a zero terminator;
//! no encoded unit starts with zero so a shorter prefix sorts first. Arrays are
//! their encoded members followed by the same terminator.

use std::ops::Bound;

use storage_traits::indexeddb::{BackendError, BackendResult, IndexedDBKeyRange, IndexedDBKeyType};

const TERMINATOR: u8 = 0x00;
const NUMBER: u8 = 0x10;
const DATE: u8 = 0x20;
const STRING: u8 = 0x30;
const BINARY: u8 = 0x40;
const ARRAY: u8 = 0x50;

/// Units up to this value are written as `unit + 1`.
const ONE_BYTE_LIMIT: u16 = 0x7E;
/// Units up to this value are written as two bytes offset by `ONE_BYTE_LIMIT + 1`.
const TWO_BYTE_LIMIT: u16 = 0x3FFF + ONE_BYTE_LIMIT + 1;
const TWO_BYTE_MARKER: u8 = 0x80;
const THREE_BYTE_MARKER: u8 = 0xC0;

const SIGN_BIT: u64 = 1 << 63;

/// The stored form of a key. Ordering is bytewise.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EncodedKey(Vec<u8>);

impl EncodedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        EncodedKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The smallest byte string that sorts after `self`.
    pub fn successor(&self) -> EncodedKey {
        let mut bytes = self.0.clone();
        bytes.push(0);
        EncodedKey(bytes)
    }
}

pub fn encode(key: &IndexedDBKeyType) -> EncodedKey {
    let mut output = Vec::new();
    encode_into(key, &mut output);
    EncodedKey(output)
}

fn encode_into(key: &IndexedDBKeyType, output: &mut Vec<u8>) {
    match key {
        IndexedDBKeyType::Number(number) => {
            output.push(NUMBER);
            encode_double(*number, output);
        },
        IndexedDBKeyType::Date(time) => {
            output.push(DATE);
            encode_double(*time, output);
        },
        IndexedDBKeyType::String(string) => {
            output.push(STRING);
            string
                .encode_utf16()
                .for_each(|unit| encode_unit(unit, output));
            output.push(TERMINATOR);
        },
        IndexedDBKeyType::Binary(bytes) => {
            output.push(BINARY);
            bytes
                .iter()
                .for_each(|byte| encode_unit(u16::from(*byte), output));
            output.push(TERMINATOR);
        },
        IndexedDBKeyType::Array(members) => {
            output.push(ARRAY);
            members.iter().for_each(|member| encode_into(member, output));
            output.push(TERMINATOR);
        },
    }
}

fn encode_double(number: f64, output: &mut Vec<u8>) {
    // -0 and +0 are the same key.
    let number = if number == 0.0 { 0.0 } else { number };
    let bits = number.to_bits();
    let bits = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };
    output.extend_from_slice(&bits.to_be_bytes());
}

fn encode_unit(unit: u16, output: &mut Vec<u8>) {
    if unit <= ONE_BYTE_LIMIT {
        output.push(unit as u8 + 1);
    } else if unit <= TWO_BYTE_LIMIT {
        let offset = unit - (ONE_BYTE_LIMIT + 1);
        output.push(TWO_BYTE_MARKER | (offset >> 8) as u8);
        output.push((offset & 0xFF) as u8);
    } else {
        output.push(THREE_BYTE_MARKER);
        output.extend_from_slice(&unit.to_be_bytes());
    }
}

fn corrupt(reason: &str) -> BackendError {
    BackendError::DbErr(format!("corrupt key encoding: {reason}"))
}

pub fn decode(key: &EncodedKey) -> BackendResult<IndexedDBKeyType> {
    let mut decoder = Decoder {
        bytes: &key.0,
        position: 0,
    };
    let decoded = decoder.decode_key()?;
    if decoder.position != key.0.len() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(decoded)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Decoder<'_> {
    fn next_byte(&mut self) -> BackendResult<u8> {
        let byte = *self
            .bytes
            .get(self.position)
            .ok_or_else(|| corrupt("unexpected end"))?;
        self.position += 1;
        Ok(byte)
    }

    fn peek_byte(&self) -> BackendResult<u8> {
        self.bytes
            .get(self.position)
            .copied()
            .ok_or_else(|| corrupt("unexpected end"))
    }

    fn decode_key(&mut self) -> BackendResult<IndexedDBKeyType> {
        match self.next_byte()? {
            NUMBER => Ok(IndexedDBKeyType::Number(self.decode_double()?)),
            DATE => Ok(IndexedDBKeyType::Date(self.decode_double()?)),
            STRING => {
                let units = self.decode_units()?;
                String::from_utf16(&units)
                    .map(IndexedDBKeyType::String)
                    .map_err(|_| corrupt("invalid UTF-16"))
            },
            BINARY => {
                let bytes = self
                    .decode_units()?
                    .into_iter()
                    .map(|unit| u8::try_from(unit).map_err(|_| corrupt("binary unit overflow")))
                    .collect::<BackendResult<Vec<u8>>>()?;
                Ok(IndexedDBKeyType::Binary(bytes))
            },
            ARRAY => {
                let mut members = vec![];
                while self.peek_byte()? != TERMINATOR {
                    members.push(self.decode_key()?);
                }
                self.position += 1;
                Ok(IndexedDBKeyType::Array(members))
            },
            tag => Err(corrupt(&format!("unknown tag {tag:#x}"))),
        }
    }

    fn decode_double(&mut self) -> BackendResult<f64> {
        let end = self.position + 8;
        let bytes: [u8; 8] = self
            .bytes
            .get(self.position..end)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| corrupt("truncated number"))?;
        self.position = end;
        let bits = u64::from_be_bytes(bytes);
        let bits = if bits & SIGN_BIT != 0 {
            bits & !SIGN_BIT
        } else {
            !bits
        };
        Ok(f64::from_bits(bits))
    }

    fn decode_units(&mut self) -> BackendResult<Vec<u16>> {
        let mut units = vec![];
        loop {
            let lead = self.next_byte()?;
            let unit = match lead {
                TERMINATOR => return Ok(units),
                byte if byte < TWO_BYTE_MARKER => u16::from(byte - 1),
                byte if byte < THREE_BYTE_MARKER => {
                    let high = u16::from(byte & !TWO_BYTE_MARKER) << 8;
                    let low = u16::from(self.next_byte()?);
                    (high | low) + ONE_BYTE_LIMIT + 1
                },
                THREE_BYTE_MARKER => {
                    let high = u16::from(self.next_byte()?) << 8;
                    high | u16::from(self.next_byte()?)
                },
                _ => return Err(corrupt("invalid unit marker")),
            };
            units.push(unit);
        }
    }
}

/// A key range over encoded keys, with the same membership as the
/// [`IndexedDBKeyRange`] it was built from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncodedKeyRange {
    pub lower: Bound<EncodedKey>,
    pub upper: Bound<EncodedKey>,
}

impl EncodedKeyRange {
    pub fn unbounded() -> Self {
        EncodedKeyRange {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn only(key: EncodedKey) -> Self {
        EncodedKeyRange {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn contains(&self, key: &EncodedKey) -> bool {
        let lower_ok = match &self.lower {
            Bound::Included(lower) => key >= lower,
            Bound::Excluded(lower) => key > lower,
            Bound::Unbounded => true,
        };
        let upper_ok = match &self.upper {
            Bound::Included(upper) => key <= upper,
            Bound::Excluded(upper) => key < upper,
            Bound::Unbounded => true,
        };
        lower_ok && upper_ok
    }

    /// True if every key in the range is smaller than `key`.
    pub fn is_below(&self, key: &EncodedKey) -> bool {
        match &self.upper {
            Bound::Included(upper) => upper < key,
            Bound::Excluded(upper) => upper <= key,
            Bound::Unbounded => false,
        }
    }

    /// True if every key in the range is greater than `key`.
    pub fn is_above(&self, key: &EncodedKey) -> bool {
        match &self.lower {
            Bound::Included(lower) => lower > key,
            Bound::Excluded(lower) => lower >= key,
            Bound::Unbounded => false,
        }
    }
}

impl From<&IndexedDBKeyRange> for EncodedKeyRange {
    fn from(range: &IndexedDBKeyRange) -> Self {
        let bound = |key: &Option<IndexedDBKeyType>, open: bool| match key {
            Some(key) if open => Bound::Excluded(encode(key)),
            Some(key) => Bound::Included(encode(key)),
            None => Bound::Unbounded,
        };
        EncodedKeyRange {
            lower: bound(&range.lower, range.lower_open),
            upper: bound(&range.upper, range.upper_open),
        }
    }
}
