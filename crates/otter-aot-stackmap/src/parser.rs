//! Stack map section decoder.
//!
//! The parser borrows the section bytes and never copies them. Call-site
//! dispatch is a binary search over the fixed-size header table; only the
//! payload of the matching call site is decoded.

use crate::error::{Result, StackMapError};
use crate::header::{CallsiteHeader, StackMapHeader};
use crate::leb128::Leb128Reader;
use crate::types::{
    CallSiteInfo, DeoptEntry, DeoptKind, DeoptValue, DwarfReg, Location, StackMapEntry,
};

/// Read-only view over an encoded stack map section
#[derive(Debug, Clone, Copy)]
pub struct StackMapParser<'a> {
    data: &'a [u8],
    header: StackMapHeader,
}

impl<'a> StackMapParser<'a> {
    /// Wrap a section, checking that the header table fits inside it.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let header = StackMapHeader::read(data)?;
        let sec_size = header.sec_size as usize;
        if sec_size > data.len() {
            return Err(StackMapError::OutOfSection {
                offset: sec_size,
                size: data.len(),
            });
        }
        let table_end = (header.callsite_num as usize)
            .checked_mul(CallsiteHeader::SIZE)
            .and_then(|n| n.checked_add(StackMapHeader::SIZE))
            .ok_or(StackMapError::Truncated { offset: sec_size })?;
        if table_end > sec_size {
            return Err(StackMapError::Truncated { offset: sec_size });
        }
        Ok(Self {
            data: &data[..sec_size],
            header,
        })
    }

    /// Section header
    pub fn header(&self) -> StackMapHeader {
        self.header
    }

    /// Number of call sites
    pub fn callsite_count(&self) -> usize {
        self.header.callsite_num as usize
    }

    /// Call-site header at table position `index`
    pub fn callsite_header(&self, index: usize) -> Option<CallsiteHeader> {
        if index >= self.callsite_count() {
            return None;
        }
        let at = StackMapHeader::SIZE + index * CallsiteHeader::SIZE;
        Some(CallsiteHeader::read_at(self.data, at))
    }

    /// Iterate all call-site headers in table order
    pub fn callsite_headers(&self) -> impl Iterator<Item = CallsiteHeader> + '_ {
        (0..self.callsite_count()).filter_map(move |i| self.callsite_header(i))
    }

    /// Binary search for the call site at exactly `pc_offset`.
    pub fn find(&self, pc_offset: u32) -> Option<CallsiteHeader> {
        let mut lo = 0usize;
        let mut hi = self.callsite_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let header = self.callsite_header(mid)?;
            debug_assert!(
                self.callsite_header(mid + 1)
                    .is_none_or(|next| next.pc_offset > header.pc_offset),
                "call-site table is not sorted"
            );
            match header.pc_offset.cmp(&pc_offset) {
                std::cmp::Ordering::Equal => return Some(header),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Decode the call site at `pc_offset`, or `None` if no call site is recorded there
    pub fn lookup(&self, pc_offset: u32) -> Result<Option<CallSiteInfo>> {
        let Some(header) = self.find(pc_offset) else {
            return Ok(None);
        };
        self.decode(&header).map(Some)
    }

    /// Decode one call site
    pub fn decode(&self, header: &CallsiteHeader) -> Result<CallSiteInfo> {
        Ok(CallSiteInfo {
            pc_offset: header.pc_offset,
            stack_map: self.stack_map(header)?,
            deopts: self.deopts(header)?,
        })
    }

    /// Decode the GC reference pairs of a call site
    pub fn stack_map(&self, header: &CallsiteHeader) -> Result<Vec<StackMapEntry>> {
        let mut reader = Leb128Reader::at(self.data, header.stackmap_offset as usize)?;
        let count = header.stackmap_num as usize;
        let mut entries = Vec::with_capacity(count);
        let mut consumed = 0usize;
        while consumed < count {
            let (base, has_derived) = read_location(&mut reader)?;
            consumed += 1;
            if !has_derived {
                entries.push(StackMapEntry::plain(base));
                continue;
            }
            if consumed == count {
                return Err(StackMapError::UnpairedEntry {
                    pc_offset: header.pc_offset,
                });
            }
            let (derived, _) = read_location(&mut reader)?;
            consumed += 1;
            entries.push(StackMapEntry::derived(base, derived));
        }
        Ok(entries)
    }

    /// Decode the deopt values of a call site, sorted by id
    pub fn deopts(&self, header: &CallsiteHeader) -> Result<Vec<DeoptEntry>> {
        let mut reader = Leb128Reader::at(self.data, header.deopt_offset as usize)?;
        (0..header.deopt_num)
            .map(|_| read_deopt(&mut reader))
            .collect()
    }

    /// Value recorded for virtual register `id` at a call site
    pub fn deopt_value(&self, header: &CallsiteHeader, id: i32) -> Result<Option<DeoptValue>> {
        let deopts = self.deopts(header)?;
        Ok(deopts
            .binary_search_by_key(&id, |d| d.id)
            .ok()
            .map(|i| deopts[i].value))
    }

    /// Decode every call site in table order
    pub fn decode_all(&self) -> Result<Vec<CallSiteInfo>> {
        self.callsite_headers().map(|h| self.decode(&h)).collect()
    }

    /// Full structural check, run once when a section is loaded.
    ///
    /// Verifies ordering of the header table, payload offsets and every
    /// payload's encoding.
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<u32> = None;
        for header in self.callsite_headers() {
            if let Some(prev) = previous {
                if prev >= header.pc_offset {
                    return Err(StackMapError::UnsortedCallSites {
                        previous: prev,
                        current: header.pc_offset,
                    });
                }
            }
            previous = Some(header.pc_offset);
            for offset in [header.stackmap_offset, header.deopt_offset] {
                if offset as usize > self.data.len() {
                    return Err(StackMapError::OutOfSection {
                        offset: offset as usize,
                        size: self.data.len(),
                    });
                }
            }
            self.decode(&header)?;
        }
        Ok(())
    }
}

/// Decode the call site at `pc_offset` from a raw section
pub fn parse(data: &[u8], pc_offset: u32) -> Result<Option<CallSiteInfo>> {
    StackMapParser::new(data)?.lookup(pc_offset)
}

fn read_reg(reader: &mut Leb128Reader<'_>, raw: u64) -> Result<DwarfReg> {
    DwarfReg::try_from(raw).map_err(|_| StackMapError::Leb128Overflow {
        offset: reader.position(),
    })
}

fn read_location(reader: &mut Leb128Reader<'_>) -> Result<(Location, bool)> {
    let tagged = reader.read_uleb128()?;
    let reg = read_reg(reader, tagged >> 1)?;
    let offset = reader.read_sleb128_i32()?;
    Ok((Location::new(reg, offset), tagged & 1 != 0))
}

fn read_deopt(reader: &mut Leb128Reader<'_>) -> Result<DeoptEntry> {
    let id = reader.read_sleb128_i32()?;
    let value = match DeoptKind::try_from(reader.read_u8()?)? {
        DeoptKind::Constant => DeoptValue::Constant(reader.read_sleb128_i32()?),
        DeoptKind::LargeConstant => DeoptValue::LargeConstant(reader.read_sleb128()?),
        DeoptKind::Indirect => {
            let raw = reader.read_uleb128()?;
            let reg = read_reg(reader, raw)?;
            DeoptValue::Indirect(Location::new(reg, reader.read_sleb128_i32()?))
        }
    };
    Ok(DeoptEntry::new(id, value))
}
