//! SCNP: dependency-light container for one collated dataset split.
//!
//! A split pack holds every scan record of a split concatenated into flat
//! per-point and per-box arrays, plus a slice index (record boundaries) so
//! individual scans can be cut back out later.
//!
//! - Per point: position (f32 xyz), color (f32 rgb in 0..1), semantic label (i32).
//! - Optional per-point instance labels (u32).
//! - Optional per-scan instance boxes (f32 cx, cy, cz, dx, dy, dz, label).
//! - Optional raw-deflate compression of the payload block.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"SCNP"
//!   04  : u32     version = 1
//!   08  : u32     flags (bitfield)
//!                 bit 0 => per-point instance labels present
//!                 bit 1 => instance boxes present (adds box slice index)
//!                 bit 2 => payload is deflate-compressed
//!   0C  : u32     record_count (scans included)
//!   10  : u32     requested_count (scans asked for)
//!   14  : u64     total_points
//!   1C  : u64     total_boxes
//!   24  : u64[record_count + 1]  point offsets
//!   ..  : u64[record_count + 1]  box offsets           (if bit1)
//!   ..  : record_count x (u16 len, [u8; len] utf-8 scan id)
//!   ..  : "PAYL" u64 raw_len u64 stored_len [stored_len bytes]
//!
//! Payload (after optional inflate):
//!   f32[3 * N] positions, f32[3 * N] colors, i32[N] semantic labels,
//!   u32[N] instance labels (if bit0), f32[7 * B] instance boxes (if bit1)

use std::borrow::Cow;
use std::io::{self, ErrorKind, Write};
use std::ops::Range;
use std::path::Path;

pub const SCNP_MAGIC: [u8; 4] = *b"SCNP";
pub const SCNP_VERSION: u32 = 1;

pub const FLAG_INSTANCE_LABELS: u32 = 1 << 0;
pub const FLAG_INSTANCE_BOXES: u32 = 1 << 1;
pub const FLAG_DEFLATE: u32 = 1 << 2;

const PAYLOAD_TAG: &[u8; 4] = b"PAYL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Raw,
    /// Raw deflate at the given level (0..=10).
    Deflate(u8),
}

/// Borrowed view of one scan inside a pack.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub scan_id: &'a str,
    pub positions: &'a [[f32; 3]],
    pub colors: &'a [[f32; 3]],
    pub semantic_labels: &'a [i32],
    pub instance_labels: Option<&'a [u32]>,
    pub instance_boxes: Option<&'a [[f32; 7]]>,
}

/// A collated split: concatenated record arrays plus the slice index.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPack {
    pub requested_count: u32,
    pub scan_ids: Vec<String>,
    /// `scan_ids.len() + 1` monotone offsets into the per-point arrays.
    pub point_slices: Vec<u64>,
    pub positions: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 3]>,
    pub semantic_labels: Vec<i32>,
    pub instance_labels: Option<Vec<u32>>,
    /// `scan_ids.len() + 1` monotone offsets into `instance_boxes`.
    pub box_slices: Option<Vec<u64>>,
    pub instance_boxes: Option<Vec<[f32; 7]>>,
}

impl SplitPack {
    /// Empty pack; the flags decide which optional blocks every pushed record must carry.
    pub fn new(requested_count: u32, with_instance_labels: bool, with_instance_boxes: bool) -> Self {
        Self {
            requested_count,
            scan_ids: Vec::new(),
            point_slices: vec![0],
            positions: Vec::new(),
            colors: Vec::new(),
            semantic_labels: Vec::new(),
            instance_labels: with_instance_labels.then(Vec::new),
            box_slices: with_instance_boxes.then(|| vec![0]),
            instance_boxes: with_instance_boxes.then(Vec::new),
        }
    }

    pub fn record_count(&self) -> usize {
        self.scan_ids.len()
    }

    pub fn total_points(&self) -> usize {
        self.positions.len()
    }

    pub fn total_boxes(&self) -> usize {
        self.instance_boxes.as_ref().map_or(0, Vec::len)
    }

    /// Append one scan. Array lengths must agree with each other and with the
    /// optional blocks this pack was created with; a rejected record leaves the
    /// pack untouched.
    pub fn push_record(&mut self, record: RecordView<'_>) -> io::Result<()> {
        let n = record.positions.len();
        if record.colors.len() != n || record.semantic_labels.len() != n {
            return Err(bad("record arrays differ in length"));
        }

        match (&self.instance_labels, record.instance_labels) {
            (Some(_), Some(labels)) if labels.len() != n => {
                return Err(bad("instance labels length != points length"));
            }
            (Some(_), Some(_)) | (None, None) => {}
            _ => return Err(bad("instance label presence differs from pack flags")),
        }

        if self.instance_boxes.is_some() != record.instance_boxes.is_some() {
            return Err(bad("instance box presence differs from pack flags"));
        }

        if record.scan_id.len() > u16::MAX as usize {
            return Err(bad("scan id too long"));
        }

        if let (Some(all), Some(labels)) = (self.instance_labels.as_mut(), record.instance_labels) {
            all.extend_from_slice(labels);
        }

        if let (Some(all), Some(slices), Some(boxes)) = (
            self.instance_boxes.as_mut(),
            self.box_slices.as_mut(),
            record.instance_boxes,
        ) {
            all.extend_from_slice(boxes);
            slices.push(all.len() as u64);
        }

        self.scan_ids.push(record.scan_id.to_owned());
        self.positions.extend_from_slice(record.positions);
        self.colors.extend_from_slice(record.colors);
        self.semantic_labels.extend_from_slice(record.semantic_labels);
        self.point_slices.push(self.positions.len() as u64);

        Ok(())
    }

    pub fn point_range(&self, index: usize) -> Option<Range<usize>> {
        let start = *self.point_slices.get(index)? as usize;
        let end = *self.point_slices.get(index + 1)? as usize;
        Some(start..end)
    }

    pub fn box_range(&self, index: usize) -> Option<Range<usize>> {
        let slices = self.box_slices.as_ref()?;
        let start = *slices.get(index)? as usize;
        let end = *slices.get(index + 1)? as usize;
        Some(start..end)
    }

    /// Slice a single scan back out of the collated arrays.
    pub fn record(&self, index: usize) -> Option<RecordView<'_>> {
        let scan_id = self.scan_ids.get(index)?;
        let points = self.point_range(index)?;

        let instance_boxes = match (&self.instance_boxes, self.box_range(index)) {
            (Some(boxes), Some(range)) => Some(&boxes[range]),
            _ => None,
        };

        Some(RecordView {
            scan_id,
            positions: &self.positions[points.clone()],
            colors: &self.colors[points.clone()],
            semantic_labels: &self.semantic_labels[points.clone()],
            instance_labels: self.instance_labels.as_ref().map(|l| &l[points]),
            instance_boxes,
        })
    }

    pub fn position_of(&self, scan_id: &str) -> Option<usize> {
        self.scan_ids.iter().position(|id| id == scan_id)
    }

    fn flags(&self) -> u32 {
        let mut flags = 0u32;

        if self.instance_labels.is_some() {
            flags |= FLAG_INSTANCE_LABELS;
        }

        if self.instance_boxes.is_some() {
            flags |= FLAG_INSTANCE_BOXES;
        }

        flags
    }

    /// Checks the invariants `parse_pack_bytes` relies on.
    pub fn validate(&self) -> io::Result<()> {
        let n = self.positions.len();
        if self.colors.len() != n || self.semantic_labels.len() != n {
            return Err(bad("point arrays differ in length"));
        }

        if let Some(labels) = &self.instance_labels {
            if labels.len() != n {
                return Err(bad("instance labels length != points length"));
            }
        }

        check_offsets(&self.point_slices, self.scan_ids.len(), n)?;

        match (&self.box_slices, &self.instance_boxes) {
            (Some(slices), Some(boxes)) => check_offsets(slices, self.scan_ids.len(), boxes.len())?,
            (None, None) => {}
            _ => return Err(bad("box slices and boxes must be present together")),
        }

        Ok(())
    }
}

fn check_offsets(offsets: &[u64], records: usize, total: usize) -> io::Result<()> {
    if offsets.len() != records + 1 {
        return Err(bad("slice index length != record count + 1"));
    }

    if offsets.first() != Some(&0) || offsets.last() != Some(&(total as u64)) {
        return Err(bad("slice index does not span the data"));
    }

    if offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(bad("slice index not monotone"));
    }

    Ok(())
}

/// Fixed-width little-endian scalars stored in the payload.
trait LeScalar: bytemuck::Pod {
    #[cfg(not(target_endian = "little"))]
    fn to_le(self) -> [u8; 4];
    fn from_le(bytes: [u8; 4]) -> Self;
}

impl LeScalar for f32 {
    #[cfg(not(target_endian = "little"))]
    fn to_le(self) -> [u8; 4] {
        self.to_le_bytes()
    }
    fn from_le(bytes: [u8; 4]) -> Self {
        f32::from_le_bytes(bytes)
    }
}

impl LeScalar for i32 {
    #[cfg(not(target_endian = "little"))]
    fn to_le(self) -> [u8; 4] {
        self.to_le_bytes()
    }
    fn from_le(bytes: [u8; 4]) -> Self {
        i32::from_le_bytes(bytes)
    }
}

impl LeScalar for u32 {
    #[cfg(not(target_endian = "little"))]
    fn to_le(self) -> [u8; 4] {
        self.to_le_bytes()
    }
    fn from_le(bytes: [u8; 4]) -> Self {
        u32::from_le_bytes(bytes)
    }
}

fn put_scalars<T: LeScalar>(out: &mut Vec<u8>, values: &[T]) {
    #[cfg(target_endian = "little")]
    {
        out.extend_from_slice(bytemuck::cast_slice(values));
    }

    #[cfg(not(target_endian = "little"))]
    {
        for &v in values {
            out.extend_from_slice(&v.to_le());
        }
    }
}

fn get_scalars<T: LeScalar>(buf: &mut &[u8], count: usize) -> io::Result<Vec<T>> {
    let bytes = count.checked_mul(4).ok_or_else(|| bad("payload size overflow"))?;
    let raw = take(buf, bytes)?;

    #[cfg(target_endian = "little")]
    {
        // Direct cast when the slice happens to be 4-aligned; decode otherwise.
        if let Ok(values) = bytemuck::try_cast_slice::<u8, T>(raw) {
            return Ok(values.to_vec());
        }
    }

    Ok(raw
        .chunks_exact(4)
        .map(|c| T::from_le([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn get_vec3s(buf: &mut &[u8], count: usize) -> io::Result<Vec<[f32; 3]>> {
    let flat: Vec<f32> = get_scalars(buf, count.checked_mul(3).ok_or_else(|| bad("size overflow"))?)?;
    Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn get_boxes(buf: &mut &[u8], count: usize) -> io::Result<Vec<[f32; 7]>> {
    let flat: Vec<f32> = get_scalars(buf, count.checked_mul(7).ok_or_else(|| bad("size overflow"))?)?;
    Ok(flat
        .chunks_exact(7)
        .map(|c| {
            let mut b = [0f32; 7];
            b.copy_from_slice(c);
            b
        })
        .collect())
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated SCNP"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_u64(buf: &mut &[u8]) -> io::Result<u64> {
    let b = take(buf, 8)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

fn as_len(v: u64) -> io::Result<usize> {
    usize::try_from(v).map_err(|_| bad("length does not fit in usize"))
}

fn read_offsets(buf: &mut &[u8], count: usize) -> io::Result<Vec<u64>> {
    need(buf, count.checked_mul(8).ok_or_else(|| bad("slice index overflow"))?)?;
    (0..count).map(|_| le_u64(buf)).collect()
}

/// Parse SCNP from a contiguous byte slice. This is the single source of truth for parsing.
pub fn parse_pack_bytes(mut p: &[u8]) -> io::Result<SplitPack> {
    // Header
    if take(&mut p, 4)? != SCNP_MAGIC {
        return Err(bad("bad SCNP magic"));
    }

    let version = le_u32(&mut p)?;
    if version != SCNP_VERSION {
        return Err(bad("unsupported SCNP version"));
    }

    let flags = le_u32(&mut p)?;
    let has_instances = (flags & FLAG_INSTANCE_LABELS) != 0;
    let has_boxes     = (flags & FLAG_INSTANCE_BOXES) != 0;
    let deflated      = (flags & FLAG_DEFLATE) != 0;

    let record_count = le_u32(&mut p)? as usize;
    let requested_count = le_u32(&mut p)?;
    let total_points = as_len(le_u64(&mut p)?)?;
    let total_boxes = as_len(le_u64(&mut p)?)?;

    if !has_boxes && total_boxes != 0 {
        return Err(bad("boxes counted but box flag unset"));
    }

    // Slice index
    let point_slices = read_offsets(&mut p, record_count + 1)?;
    check_offsets(&point_slices, record_count, total_points)?;

    let box_slices = if has_boxes {
        let slices = read_offsets(&mut p, record_count + 1)?;
        check_offsets(&slices, record_count, total_boxes)?;
        Some(slices)
    } else {
        None
    };

    // Scan ids
    let mut scan_ids = Vec::with_capacity(record_count);
    for _ in 0..record_count {
        let len = le_u16(&mut p)? as usize;
        let raw = take(&mut p, len)?;
        let id = std::str::from_utf8(raw).map_err(|_| bad("scan id is not utf-8"))?;
        scan_ids.push(id.to_owned());
    }

    // Payload
    if take(&mut p, 4)? != PAYLOAD_TAG {
        return Err(bad("expected PAYL tag"));
    }

    let raw_len = as_len(le_u64(&mut p)?)?;
    let stored_len = as_len(le_u64(&mut p)?)?;
    let stored = take(&mut p, stored_len)?;

    let payload: Cow<'_, [u8]> = if deflated {
        let inflated = miniz_oxide::inflate::decompress_to_vec(stored)
            .map_err(|e| bad(&format!("payload inflate failed: {:?}", e.status)))?;
        Cow::Owned(inflated)
    } else {
        Cow::Borrowed(stored)
    };

    if payload.len() != raw_len {
        return Err(bad("payload length mismatch"));
    }

    let mut q: &[u8] = &payload;
    let positions = get_vec3s(&mut q, total_points)?;
    let colors = get_vec3s(&mut q, total_points)?;
    let semantic_labels = get_scalars::<i32>(&mut q, total_points)?;

    let instance_labels = if has_instances {
        Some(get_scalars::<u32>(&mut q, total_points)?)
    } else {
        None
    };

    let instance_boxes = if has_boxes {
        Some(get_boxes(&mut q, total_boxes)?)
    } else {
        None
    };

    if !q.is_empty() {
        return Err(bad("trailing bytes in payload"));
    }

    Ok(SplitPack {
        requested_count,
        scan_ids,
        point_slices,
        positions,
        colors,
        semantic_labels,
        instance_labels,
        box_slices,
        instance_boxes,
    })
}

/// Serialize a pack to bytes. Fails if the pack violates its own invariants.
pub fn encode_pack_bytes(pack: &SplitPack, encoding: PayloadEncoding) -> io::Result<Vec<u8>> {
    pack.validate()?;

    let mut flags = pack.flags();
    if matches!(encoding, PayloadEncoding::Deflate(_)) {
        flags |= FLAG_DEFLATE;
    }

    let record_count =
        u32::try_from(pack.record_count()).map_err(|_| bad("too many records"))?;

    let mut out = Vec::<u8>::new();
    out.write_all(&SCNP_MAGIC)?;

    write_u32(&mut out, SCNP_VERSION)?;
    write_u32(&mut out, flags)?;
    write_u32(&mut out, record_count)?;
    write_u32(&mut out, pack.requested_count)?;
    write_u64(&mut out, pack.total_points() as u64)?;
    write_u64(&mut out, pack.total_boxes() as u64)?;

    for &offset in &pack.point_slices {
        write_u64(&mut out, offset)?;
    }

    if let Some(slices) = &pack.box_slices {
        for &offset in slices {
            write_u64(&mut out, offset)?;
        }
    }

    for id in &pack.scan_ids {
        write_u16(&mut out, id.len() as u16)?;
        out.write_all(id.as_bytes())?;
    }

    let mut payload = Vec::<u8>::new();
    put_scalars(&mut payload, bytemuck::cast_slice::<[f32; 3], f32>(&pack.positions));
    put_scalars(&mut payload, bytemuck::cast_slice::<[f32; 3], f32>(&pack.colors));
    put_scalars(&mut payload, &pack.semantic_labels);

    if let Some(labels) = &pack.instance_labels {
        put_scalars(&mut payload, labels);
    }

    if let Some(boxes) = &pack.instance_boxes {
        put_scalars(&mut payload, bytemuck::cast_slice::<[f32; 7], f32>(boxes));
    }

    out.write_all(PAYLOAD_TAG)?;
    write_u64(&mut out, payload.len() as u64)?;

    match encoding {
        PayloadEncoding::Raw => {
            write_u64(&mut out, payload.len() as u64)?;
            out.write_all(&payload)?;
        }
        PayloadEncoding::Deflate(level) => {
            let compressed = miniz_oxide::deflate::compress_to_vec(&payload, level.min(10));
            write_u64(&mut out, compressed.len() as u64)?;
            out.write_all(&compressed)?;
        }
    }

    Ok(out)
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<SplitPack> {
    let file = std::fs::File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_pack_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<SplitPack> {
    let bytes = std::fs::read(path)?;
    parse_pack_bytes(&bytes)
}

pub fn write_file<P: AsRef<Path>>(path: P, pack: &SplitPack, encoding: PayloadEncoding) -> io::Result<()> {
    let bytes = encode_pack_bytes(pack, encoding)?;

    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)?;
    file.flush()?;

    Ok(())
}

#[inline]
fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
