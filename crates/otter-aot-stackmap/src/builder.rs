//! Stack map section encoder

use crate::error::{Result, StackMapError};
use crate::header::{CallsiteHeader, StackMapHeader};
use crate::leb128::{write_sleb128, write_uleb128};
use crate::types::{CallSiteInfo, DeoptEntry, DeoptValue, Location};

/// Alignment of each call site's deopt payload inside the section
pub const DEOPT_ALIGN: usize = 4;

/// Collects call sites in any order and encodes them sorted.
#[derive(Debug, Default, Clone)]
pub struct StackMapBuilder {
    callsites: Vec<CallSiteInfo>,
}

impl StackMapBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call site
    pub fn push(&mut self, info: CallSiteInfo) -> &mut Self {
        self.callsites.push(info);
        self
    }

    /// Number of recorded call sites
    pub fn len(&self) -> usize {
        self.callsites.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.callsites.is_empty()
    }

    /// Sort the call sites by pc offset and encode the section
    pub fn build(mut self) -> Result<Vec<u8>> {
        self.callsites.sort_by_key(|c| c.pc_offset);
        encode(&self.callsites)
    }
}

fn field_u16(what: &'static str, value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| StackMapError::FieldOverflow {
        what,
        value: value as u64,
    })
}

fn field_u32(what: &'static str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| StackMapError::FieldOverflow {
        what,
        value: value as u64,
    })
}

fn write_location(out: &mut Vec<u8>, location: Location, has_derived: bool) {
    write_uleb128(out, (u64::from(location.reg) << 1) | u64::from(has_derived));
    write_sleb128(out, i64::from(location.offset));
}

fn write_deopt(out: &mut Vec<u8>, entry: &DeoptEntry) {
    write_sleb128(out, i64::from(entry.id));
    out.push(entry.value.kind() as u8);
    match entry.value {
        DeoptValue::Constant(value) => write_sleb128(out, i64::from(value)),
        DeoptValue::LargeConstant(value) => write_sleb128(out, value),
        DeoptValue::Indirect(location) => {
            write_uleb128(out, u64::from(location.reg));
            write_sleb128(out, i64::from(location.offset));
        }
    }
}

fn sorted_deopts(info: &CallSiteInfo) -> Result<Vec<DeoptEntry>> {
    let mut deopts = info.deopts.clone();
    deopts.sort_by_key(|d| d.id);
    if let Some(pair) = deopts.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(StackMapError::DuplicateDeoptId {
            pc_offset: info.pc_offset,
            id: pair[0].id,
        });
    }
    Ok(deopts)
}

/// Encode call sites that are already strictly ascending by pc offset.
///
/// Deopt entries are sorted by id on the way out. Plain roots take one
/// encoded location, derived pairs take two.
pub fn encode(callsites: &[CallSiteInfo]) -> Result<Vec<u8>> {
    for pair in callsites.windows(2) {
        if pair[0].pc_offset >= pair[1].pc_offset {
            return Err(StackMapError::UnsortedCallSites {
                previous: pair[0].pc_offset,
                current: pair[1].pc_offset,
            });
        }
    }

    let table_end = StackMapHeader::SIZE + callsites.len() * CallsiteHeader::SIZE;
    let mut payload = Vec::new();
    let mut headers = Vec::with_capacity(callsites.len());

    for info in callsites {
        let stackmap_offset = table_end + payload.len();
        let mut locations = 0usize;
        for entry in &info.stack_map {
            if entry.is_plain() {
                write_location(&mut payload, entry.base, false);
                locations += 1;
            } else {
                write_location(&mut payload, entry.base, true);
                write_location(&mut payload, entry.derived, false);
                locations += 2;
            }
        }

        while (table_end + payload.len()) % DEOPT_ALIGN != 0 {
            payload.push(0);
        }
        let deopt_offset = table_end + payload.len();
        let deopts = sorted_deopts(info)?;
        for entry in &deopts {
            write_deopt(&mut payload, entry);
        }

        headers.push(CallsiteHeader {
            pc_offset: info.pc_offset,
            stackmap_offset: field_u32("stackmap offset", stackmap_offset)?,
            stackmap_num: field_u16("stackmap count", locations)?,
            deopt_num: field_u16("deopt count", deopts.len())?,
            deopt_offset: field_u32("deopt offset", deopt_offset)?,
        });
    }

    let sec_size = table_end + payload.len();
    let mut out = Vec::with_capacity(sec_size);
    StackMapHeader {
        callsite_num: field_u32("call site count", callsites.len())?,
        sec_size: field_u32("section size", sec_size)?,
    }
    .write(&mut out);
    for header in &headers {
        header.write(&mut out);
    }
    out.extend_from_slice(&payload);
    Ok(out)
}
