//! Minimal FlatBuffers builder and table reader.
//!
//! Only the pieces the `MnistProt` schema needs: scalar slots, table
//! offsets and `[float]` vectors. The builder reproduces the byte layout
//! of the reference FlatBuffers builders (back-to-front, same alignment
//! rules) so buffers produced by the stock Python/C++ FlatBuffers peers and by this
//! crate are interchangeable.
//!
//! # Buffer Layout
//!
//! ```text
//! [root: u32]                 offset to the root table
//! ...
//! [vtable]                    u16 vtable_len, u16 object_len, u16 field offsets...
//! [table]                     i32 (table_pos - vtable_pos), then inline fields
//! ...
//! [vector]                    u32 len, then len elements
//! ```
//!
//! The builder always writes scalars, even when they equal the schema
//! default (`force_defaults`), so a given message shape always encodes to
//! the same number of bytes. The reader treats a missing slot as zero.

use super::DecodeError;

const UOFFSET_SIZE: usize = 4;
const VTABLE_META_FIELDS: usize = 2;

// ── Builder ───────────────────────────────────────────────────────

/// Back-to-front buffer builder.
///
/// Offsets handed out by the builder are measured from the END of the
/// buffer, as in the reference implementations.
#[derive(Debug)]
pub(crate) struct Builder {
    buf: Vec<u8>,
    head: usize,
    min_align: usize,
    vtable: Vec<u32>,
    object_end: u32,
    nested: bool,
}

impl Builder {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        Self {
            buf: vec![0u8; capacity],
            head: capacity,
            min_align: 1,
            vtable: Vec::new(),
            object_end: 0,
            nested: false,
        }
    }

    /// Bytes written so far.
    fn offset(&self) -> u32 {
        (self.buf.len() - self.head) as u32
    }

    fn grow(&mut self, needed: usize) {
        while self.head < needed {
            let used = self.buf.len() - self.head;
            let new_len = (self.buf.len() * 2).max(64);
            let mut grown = vec![0u8; new_len];
            grown[new_len - used..].copy_from_slice(&self.buf[self.head..]);
            self.buf = grown;
            self.head = new_len - used;
        }
    }

    fn pad(&mut self, count: usize) {
        self.grow(count);
        for _ in 0..count {
            self.head -= 1;
            self.buf[self.head] = 0;
        }
    }

    /// Pad so that after writing `additional` bytes the next `size`-byte
    /// value lands on a `size` boundary.
    fn prep(&mut self, size: usize, additional: usize) {
        if size > self.min_align {
            self.min_align = size;
        }
        let used = self.offset() as usize + additional;
        let align = (!used).wrapping_add(1) & (size - 1);
        self.pad(align);
    }

    fn place(&mut self, bytes: &[u8]) {
        self.grow(bytes.len());
        self.head -= bytes.len();
        self.buf[self.head..self.head + bytes.len()].copy_from_slice(bytes);
    }

    fn push_u8(&mut self, value: u8) {
        self.prep(1, 0);
        self.place(&[value]);
    }

    fn push_u16(&mut self, value: u16) {
        self.prep(2, 0);
        self.place(&value.to_le_bytes());
    }

    fn push_u32(&mut self, value: u32) {
        self.prep(4, 0);
        self.place(&value.to_le_bytes());
    }

    fn push_f32(&mut self, value: f32) {
        self.prep(4, 0);
        self.place(&value.to_le_bytes());
    }

    fn push_uoffset(&mut self, target: u32) {
        self.prep(UOFFSET_SIZE, 0);
        debug_assert!(target <= self.offset(), "offset must point backwards");
        let relative = self.offset() - target + UOFFSET_SIZE as u32;
        self.place(&relative.to_le_bytes());
    }

    pub(crate) fn start_table(&mut self, slots: usize) {
        debug_assert!(!self.nested, "tables cannot be nested while building");
        self.vtable.clear();
        self.vtable.resize(slots, 0);
        self.object_end = self.offset();
        self.nested = true;
    }

    pub(crate) fn add_u8(&mut self, slot: usize, value: u8) {
        self.push_u8(value);
        self.vtable[slot] = self.offset();
    }

    pub(crate) fn add_i8(&mut self, slot: usize, value: i8) {
        self.add_u8(slot, value as u8);
    }

    pub(crate) fn add_u32(&mut self, slot: usize, value: u32) {
        self.push_u32(value);
        self.vtable[slot] = self.offset();
    }

    pub(crate) fn add_f32(&mut self, slot: usize, value: f32) {
        self.push_f32(value);
        self.vtable[slot] = self.offset();
    }

    pub(crate) fn add_offset(&mut self, slot: usize, target: u32) {
        self.push_uoffset(target);
        self.vtable[slot] = self.offset();
    }

    /// Close the current table, emitting its vtable directly in front of it.
    pub(crate) fn end_table(&mut self) -> u32 {
        // Placeholder for the vtable back-offset, patched below.
        self.push_u32(0);
        let object_offset = self.offset();

        let used = self
            .vtable
            .iter()
            .rposition(|&slot| slot != 0)
            .map_or(0, |i| i + 1);
        for i in (0..used).rev() {
            let slot = self.vtable[i];
            let field = if slot == 0 { 0 } else { object_offset - slot };
            self.push_u16(field as u16);
        }
        self.push_u16((object_offset - self.object_end) as u16);
        self.push_u16(((used + VTABLE_META_FIELDS) * 2) as u16);

        let table_pos = self.buf.len() - object_offset as usize;
        let back_offset = (self.offset() - object_offset) as i32;
        self.buf[table_pos..table_pos + 4].copy_from_slice(&back_offset.to_le_bytes());

        self.vtable.clear();
        self.nested = false;
        object_offset
    }

    pub(crate) fn create_f32_vector(&mut self, items: &[f32]) -> u32 {
        debug_assert!(!self.nested, "vectors must be created outside tables");
        let body = items.len() * 4;
        self.prep(UOFFSET_SIZE, body);
        self.prep(4, body);
        for value in items.iter().rev() {
            self.push_f32(*value);
        }
        // Already aligned by the prep above.
        self.place(&(items.len() as u32).to_le_bytes());
        self.offset()
    }

    /// Write the root offset and hand back the finished bytes.
    pub(crate) fn finish(mut self, root: u32) -> Vec<u8> {
        let align = self.min_align;
        self.prep(align, UOFFSET_SIZE);
        self.push_uoffset(root);
        self.buf.split_off(self.head)
    }
}

// ── Reader ────────────────────────────────────────────────────────

fn slice_at(buf: &[u8], pos: usize, len: usize) -> Result<&[u8], DecodeError> {
    pos.checked_add(len)
        .and_then(|end| buf.get(pos..end))
        .ok_or_else(|| {
            DecodeError::Malformed(format!(
                "read of {} bytes at {} exceeds buffer of {}",
                len,
                pos,
                buf.len()
            ))
        })
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DecodeError> {
    let bytes = slice_at(buf, pos, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DecodeError> {
    let bytes = slice_at(buf, pos, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(buf: &[u8], pos: usize) -> Result<i32, DecodeError> {
    read_u32(buf, pos).map(|v| v as i32)
}

/// A table inside a received buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    /// Locate the root table of `buf`.
    pub(crate) fn root(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let root = read_u32(buf, 0)? as usize;
        Self::at(buf, root)
    }

    fn at(buf: &'a [u8], pos: usize) -> Result<Self, DecodeError> {
        let back = read_i32(buf, pos)? as i64;
        let vtable = pos as i64 - back;
        if vtable < 0 {
            return Err(DecodeError::Malformed(format!(
                "vtable of table at {} points before the buffer",
                pos
            )));
        }
        let vtable = vtable as usize;
        let vtable_len = read_u16(buf, vtable)? as usize;
        if vtable_len < VTABLE_META_FIELDS * 2 || vtable_len % 2 != 0 {
            return Err(DecodeError::Malformed(format!(
                "invalid vtable length {} at {}",
                vtable_len, vtable
            )));
        }
        slice_at(buf, vtable, vtable_len)?;
        Ok(Self { buf, pos, vtable, vtable_len })
    }

    fn field_pos(&self, slot: usize) -> Result<Option<usize>, DecodeError> {
        let entry = (VTABLE_META_FIELDS + slot) * 2;
        if entry + 2 > self.vtable_len {
            return Ok(None);
        }
        match read_u16(self.buf, self.vtable + entry)? {
            0 => Ok(None),
            off => Ok(Some(self.pos + off as usize)),
        }
    }

    pub(crate) fn get_u8(&self, slot: usize) -> Result<u8, DecodeError> {
        match self.field_pos(slot)? {
            Some(pos) => Ok(slice_at(self.buf, pos, 1)?[0]),
            None => Ok(0),
        }
    }

    pub(crate) fn get_i8(&self, slot: usize) -> Result<i8, DecodeError> {
        self.get_u8(slot).map(|v| v as i8)
    }

    pub(crate) fn get_u32(&self, slot: usize) -> Result<Option<u32>, DecodeError> {
        self.field_pos(slot)?
            .map(|pos| read_u32(self.buf, pos))
            .transpose()
    }

    pub(crate) fn get_f32(&self, slot: usize) -> Result<f32, DecodeError> {
        match self.field_pos(slot)? {
            Some(pos) => read_u32(self.buf, pos).map(f32::from_bits),
            None => Ok(0.0),
        }
    }

    fn follow(&self, slot: usize) -> Result<Option<usize>, DecodeError> {
        match self.field_pos(slot)? {
            Some(pos) => {
                let rel = read_u32(self.buf, pos)? as usize;
                pos.checked_add(rel).map(Some).ok_or_else(|| {
                    DecodeError::Malformed(format!("offset overflow at {}", pos))
                })
            }
            None => Ok(None),
        }
    }

    pub(crate) fn get_table(&self, slot: usize) -> Result<Option<Table<'a>>, DecodeError> {
        self.follow(slot)?
            .map(|pos| Table::at(self.buf, pos))
            .transpose()
    }

    /// Read a `[float]` vector; a missing slot reads as empty.
    pub(crate) fn get_f32_vector(&self, slot: usize) -> Result<Vec<f32>, DecodeError> {
        let Some(pos) = self.follow(slot)? else {
            return Ok(Vec::new());
        };
        let len = read_u32(self.buf, pos)? as usize;
        let body = len.checked_mul(4).ok_or_else(|| {
            DecodeError::Malformed(format!("vector length {} overflows", len))
        })?;
        let bytes = slice_at(self.buf, pos + 4, body)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
