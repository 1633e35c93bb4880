//! ISOBMFF box walking over a shared `Bytes` buffer.

use bytes::Bytes;

/// One box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxView {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) fourcc: [u8; 4],
    pub(crate) body_start: usize,
}

impl BoxView {
    pub(crate) fn body<'a>(&self, data: &'a Bytes) -> &'a [u8] {
        &data[self.body_start..self.end]
    }
}

/// Read a box header: `(total_size, fourcc, header_size)`.
///
/// Handles the 64-bit extended size (`size == 1`) and boxes that run to the
/// end of the buffer (`size == 0`).
pub(crate) fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc = [data[4], data[5], data[6], data[7]];
    match size {
        1 => {
            let ext = data.get(8..16)?;
            let ext_size = u64::from_be_bytes(ext.try_into().ok()?);
            Some((usize::try_from(ext_size).ok()?, fourcc, 16))
        }
        0 => Some((data.len(), fourcc, 8)),
        _ => Some((size as usize, fourcc, 8)),
    }
}

/// Parse the box at `offset` within `[..end)`.
pub(crate) fn box_at(data: &Bytes, offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end || end > data.len() {
        return None;
    }
    let (size, fourcc, header_size) = read_box_header(&data[offset..end])?;
    if size < header_size || offset.checked_add(size)? > end {
        return None;
    }
    Some(BoxView {
        start: offset,
        end: offset + size,
        fourcc,
        body_start: offset + header_size,
    })
}

/// Iterate the boxes laid out back to back in `[start..end)`. Stops at the
/// first malformed header.
pub(crate) fn children(data: &Bytes, start: usize, end: usize) -> impl Iterator<Item = BoxView> + '_ {
    let mut offset = start;
    std::iter::from_fn(move || {
        let b = box_at(data, offset, end)?;
        offset = b.end;
        Some(b)
    })
}

pub(crate) fn find_first_box(data: &Bytes, start: usize, end: usize, target: [u8; 4]) -> Option<BoxView> {
    children(data, start, end).find(|b| b.fourcc == target)
}

/// Follow a path of nested boxes from `[start..end)`.
pub(crate) fn find_path(data: &Bytes, start: usize, end: usize, path: &[[u8; 4]]) -> Option<BoxView> {
    let (first, rest) = path.split_first()?;
    let found = find_first_box(data, start, end, *first)?;
    if rest.is_empty() {
        Some(found)
    } else {
        find_path(data, found.body_start, found.end, rest)
    }
}

/// Version and 24-bit flags of a full box body.
pub(crate) fn full_box_header(body: &[u8]) -> Option<(u8, u32)> {
    let h = body.get(0..4)?;
    Some((h[0], u32::from_be_bytes([0, h[1], h[2], h[3]])))
}

/// Big-endian cursor over a box body.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn skip(&mut self, n: usize) -> Option<()> {
        if self.buf.len().checked_sub(self.pos)? < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        let b = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        let b = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_be_bytes(raw))
    }

    pub(crate) fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }
}
