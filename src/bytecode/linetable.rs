//! Codecs for the compressed (offset, line) tables carried next to bytecode.
//!
//! Three on-disk variants exist across the runtime family:
//!
//! * byte-delta: a stream of `(offset_delta, line_delta)` byte pairs, with
//!   `(0xFF, 0)` / `(0, 0xFF)` pairs continuing into the next pair without
//!   emitting a boundary;
//! * address-range: `(end_address_delta, line_delta)` pairs where the line
//!   delta is a signed byte and `-128` denotes "no line";
//! * locations: a structured nibble/varint encoding carrying richer location
//!   kinds; decoded read-only.

use itertools::Itertools;

use crate::error::Error;

/// On-disk format of a line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTableFormat {
    ByteDelta,
    AddressRange,
    /// Structured locations, decode only.
    Locations,
}

impl LineTableFormat {
    /// Whether [`insert_gap`] can rewrite tables of this format.
    pub fn supports_updates(&self) -> bool {
        !matches!(self, LineTableFormat::Locations)
    }
}

/// One decoded run: instructions in `start..end` belong to `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start: usize,
    pub end: usize,
    /// `None` for address ranges explicitly marked as having no line.
    pub line: Option<u32>,
}

/// Decode a line table into a flat run sequence, monotone in offset.
///
/// `code_len` bounds the final run (the table itself does not carry the
/// bytecode length in every format).
pub fn decode(
    format: LineTableFormat,
    table: &[u8],
    first_line: u32,
    code_len: usize,
) -> Result<Vec<LineEntry>, Error> {
    match format {
        LineTableFormat::ByteDelta => decode_byte_delta(table, first_line, code_len),
        LineTableFormat::AddressRange => decode_address_range(table, first_line, code_len),
        LineTableFormat::Locations => decode_locations(table, first_line, code_len),
    }
}

fn decode_byte_delta(table: &[u8], first_line: u32, code_len: usize) -> Result<Vec<LineEntry>, Error> {
    if table.len() % 2 != 0 {
        return Err(Error::CorruptedLineTable(table.len()));
    }

    let mut positions: Vec<(usize, u32)> = vec![(0, first_line)];
    let mut offset = 0usize;
    let mut line = first_line as u64;

    let mut pending = false;
    for (offset_delta, line_delta) in table.iter().copied().tuples() {
        offset += offset_delta as usize;
        line += line_delta as u64;

        // (0xFF, 0) and (0, 0xFF) pairs continue into the next pair without
        // emitting a boundary.
        let stop = (offset_delta != 0xFF || line_delta != 0)
            && (offset_delta != 0 || line_delta != 0xFF);
        pending = !stop;
        if stop {
            positions.push((offset, line as u32));
        }
    }
    if pending {
        return Err(Error::CorruptedLineTable(table.len()));
    }

    // A leading zero offset delta overrides the line of the function entry.
    if let Some(&(second_offset, _)) = positions.get(1) {
        if second_offset == 0 {
            positions.remove(0);
        }
    }

    Ok(positions_to_entries(positions, code_len))
}

fn positions_to_entries(positions: Vec<(usize, u32)>, code_len: usize) -> Vec<LineEntry> {
    let mut entries = Vec::with_capacity(positions.len());
    for (i, &(start, line)) in positions.iter().enumerate() {
        let end = positions
            .get(i + 1)
            .map(|&(next, _)| next)
            .unwrap_or(code_len);
        entries.push(LineEntry {
            start,
            end,
            line: Some(line),
        });
    }
    entries
}

fn decode_address_range(
    table: &[u8],
    first_line: u32,
    code_len: usize,
) -> Result<Vec<LineEntry>, Error> {
    if table.len() % 2 != 0 {
        return Err(Error::CorruptedLineTable(table.len()));
    }

    let mut entries = Vec::new();
    let mut end = 0usize;
    let mut computed_line = first_line as i64;

    for (end_delta, line_delta) in table.iter().copied().tuples() {
        let start = end;
        end += end_delta as usize;

        let line_delta = line_delta as i8;
        let line = if line_delta == -128 {
            None
        } else {
            computed_line += line_delta as i64;
            Some(computed_line as u32)
        };

        if start == end {
            continue; // zero-width range, line bookkeeping only
        }
        entries.push(LineEntry {
            start,
            end: end.min(code_len),
            line,
        });
    }

    Ok(entries)
}

// Location kinds of the structured table.
const LOCATION_ONE_LINE0: u8 = 10;
const LOCATION_ONE_LINE2: u8 = 12;
const LOCATION_NO_COLUMNS: u8 = 13;
const LOCATION_LONG: u8 = 14;
const LOCATION_NONE: u8 = 15;

fn decode_locations(table: &[u8], first_line: u32, code_len: usize) -> Result<Vec<LineEntry>, Error> {
    let mut entries = Vec::new();
    let mut end = 0usize;
    let mut computed_line = first_line as i64;

    let mut i = 0usize;
    while i < table.len() {
        let first = table[i];
        if first & 0x80 == 0 {
            return Err(Error::CorruptedLineTable(i));
        }

        let kind = (first >> 3) & 15;
        let units = (first & 7) as usize + 1;

        let mut no_line = false;
        let line_delta = match kind {
            LOCATION_NONE => {
                no_line = true;
                0
            }
            LOCATION_NO_COLUMNS | LOCATION_LONG => scan_signed_varint(&table[i + 1..])?,
            LOCATION_ONE_LINE0..=LOCATION_ONE_LINE2 => (kind - LOCATION_ONE_LINE0) as i64,
            _ => 0, // short forms stay on the same line
        };

        computed_line += line_delta;
        let start = end;
        end += units * 2;
        entries.push(LineEntry {
            start,
            end: end.min(code_len),
            line: if no_line {
                None
            } else {
                Some(computed_line as u32)
            },
        });

        i += 1;
        while i < table.len() && table[i] & 0x80 == 0 {
            i += 1;
        }
    }

    Ok(entries)
}

fn scan_signed_varint(bytes: &[u8]) -> Result<i64, Error> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &b) in bytes.iter().enumerate() {
        value |= ((b & 63) as u64) << shift;
        if b & 64 == 0 {
            return Ok(if value & 1 != 0 {
                -((value >> 1) as i64)
            } else {
                (value >> 1) as i64
            });
        }
        shift += 6;
        if shift > 60 {
            return Err(Error::CorruptedLineTable(i));
        }
    }
    Err(Error::CorruptedLineTable(bytes.len()))
}

/// Encode monotone `(offset, line)` boundaries into the byte-delta form.
///
/// The inverse of [`decode`] for the byte-delta variant: oversized deltas are
/// split into `(0xFF, 0)` / `(0, 0xFF)` continuation pairs.
pub fn encode_byte_delta(positions: &[(usize, u32)], first_line: u32) -> Vec<u8> {
    let mut table = Vec::new();
    let mut prev_offset = 0usize;
    let mut prev_line = first_line;

    for &(offset, line) in positions {
        let mut offset_delta = offset - prev_offset;
        let mut line_delta = line - prev_line;

        while offset_delta > 0xFF {
            table.push(0xFF);
            table.push(0);
            offset_delta -= 0xFF;
        }
        while line_delta > 0xFF {
            table.push(0);
            table.push(0xFF);
            line_delta -= 0xFF;
        }
        table.push(offset_delta as u8);
        table.push(line_delta as u8);

        prev_offset = offset;
        prev_line = line;
    }

    table
}

/// Rewrite the table for an insertion of `size` bytes at `at_offset`: the
/// entry whose span covers the offset is extended, splitting into capped
/// continuation pairs when the delta field overflows.
///
/// An insertion past the end of the table leaves it unchanged.
pub fn insert_gap(
    format: LineTableFormat,
    table: &[u8],
    at_offset: usize,
    size: usize,
) -> Result<Vec<u8>, Error> {
    match format {
        LineTableFormat::ByteDelta => Ok(insert_gap_pairs(table, at_offset, size, 0xFF)),
        // The address-range delta field caps at one byte less: 0xFF in the
        // line position of a pair is the "no line" marker.
        LineTableFormat::AddressRange => Ok(insert_gap_pairs(table, at_offset, size, 0xFE)),
        LineTableFormat::Locations => Err(Error::ReadOnlyLineTable),
    }
}

fn insert_gap_pairs(table: &[u8], at_offset: usize, size: usize, cap: usize) -> Vec<u8> {
    let mut out = table.to_vec();
    let mut current_offset = 0usize;

    let mut i = 0;
    while i + 1 < out.len() {
        current_offset += out[i] as usize;
        if current_offset > at_offset {
            let mut remaining_size = out[i] as usize + size;
            let remaining_lines = out[i + 1];

            let mut expansion = Vec::new();
            while remaining_size > cap {
                expansion.push(cap as u8);
                expansion.push(0);
                remaining_size -= cap;
            }
            expansion.push(remaining_size as u8);
            expansion.push(remaining_lines);

            out.splice(i..i + 2, expansion);
            return out;
        }
        i += 2;
    }

    out
}
