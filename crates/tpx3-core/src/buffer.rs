//! The flat acquisition buffer and its mutation policies.
//!
//! One [`DataBuffer`] backs one measurement. It is allocated from the
//! [`DetectorConfig`](crate::config::DetectorConfig) in effect at start
//! and discarded at the next start. Storage is a raw little-endian byte
//! vector; the logical multi-dimensional shape is carried alongside and
//! typed access goes through the `as_*_slice` views, so reshaping never
//! copies.
//!
//! The three mutation entry points map one-to-one onto the apply
//! policies: [`fill_from`](DataBuffer::fill_from) (replace),
//! [`write_at`](DataBuffer::write_at) (windowed accumulate) and
//! [`increment`](DataBuffer::increment) (histogram).

use crate::config::DetectorConfig;
use crate::error::{CoreResult, Tpx3Error};
use crate::limits::MAX_BUFFER_BYTES;
use serde::{Deserialize, Serialize};

/// Element type of buffer cells and event words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    U8,
    U16,
    U32,
    U64,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::U32 => 4,
            ElementType::U64 => 8,
        }
    }

    /// Map a configured byte width onto an element type.
    pub fn from_byte_width(width: u8) -> CoreResult<Self> {
        match width {
            1 => Ok(ElementType::U8),
            2 => Ok(ElementType::U16),
            4 => Ok(ElementType::U32),
            8 => Ok(ElementType::U64),
            other => Err(Tpx3Error::ByteWidth(other)),
        }
    }

    /// Map a wire-header bit depth onto an element type.
    pub fn from_bit_depth(bits: u32) -> CoreResult<Self> {
        match bits {
            8 => Ok(ElementType::U8),
            16 => Ok(ElementType::U16),
            32 => Ok(ElementType::U32),
            64 => Ok(ElementType::U64),
            other => Err(Tpx3Error::Decode(format!("unsupported bit depth {other}"))),
        }
    }
}

/// Flat numeric buffer with a logical multi-dimensional shape.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBuffer {
    elem: ElementType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl DataBuffer {
    /// Allocate a zeroed buffer sized and typed from the configuration.
    ///
    /// Rejects zero-sized requests and anything above
    /// [`MAX_BUFFER_BYTES`], so a misconfigured mode cannot request
    /// unbounded memory.
    pub fn allocate(config: &DetectorConfig) -> CoreResult<Self> {
        let shape = config.array_shape()?;
        let elem = config.element_type()?;
        let bytes = config.byte_len()?;
        if bytes == 0 || bytes > MAX_BUFFER_BYTES {
            return Err(Tpx3Error::BufferSize {
                bytes,
                max: MAX_BUFFER_BYTES,
            });
        }
        Ok(Self {
            elem,
            shape,
            data: vec![0; bytes],
        })
    }

    /// Element type of the buffer cells.
    pub fn element_type(&self) -> ElementType {
        self.elem
    }

    /// Logical shape, slowest axis first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    pub fn element_count(&self) -> usize {
        self.data.len() / self.elem.width()
    }

    /// Total byte length of the storage.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Raw little-endian storage.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// REPLACE policy: overwrite the whole buffer with one payload.
    pub fn fill_from(&mut self, payload: &[u8]) -> CoreResult<()> {
        if payload.len() != self.data.len() {
            return Err(Tpx3Error::Framing(format!(
                "payload of {} bytes does not cover buffer of {} bytes",
                payload.len(),
                self.data.len()
            )));
        }
        self.data.copy_from_slice(payload);
        Ok(())
    }

    /// WINDOWED-ACCUMULATE policy: write one payload at an element offset.
    pub fn write_at(&mut self, elem_offset: usize, payload: &[u8]) -> CoreResult<()> {
        let start = elem_offset
            .checked_mul(self.elem.width())
            .ok_or(Tpx3Error::Framing("window offset overflowed".into()))?;
        let end = start
            .checked_add(payload.len())
            .ok_or(Tpx3Error::Framing("window extent overflowed".into()))?;
        if end > self.data.len() {
            return Err(Tpx3Error::Framing(format!(
                "window {start}..{end} exceeds buffer of {} bytes",
                self.data.len()
            )));
        }
        self.data[start..end].copy_from_slice(payload);
        Ok(())
    }

    /// HISTOGRAM policy: increment one cell per address, saturating.
    ///
    /// Out-of-range addresses are skipped; the caller gets the applied
    /// count back and decides how to report the difference. This is the
    /// performance-critical path: one pass per chunk, no allocation.
    pub fn increment(&mut self, addresses: &[u64]) -> usize {
        let cells = self.element_count() as u64;
        let mut applied = 0;
        match self.elem {
            ElementType::U8 => {
                for &addr in addresses {
                    if addr < cells {
                        let cell = &mut self.data[addr as usize];
                        *cell = cell.saturating_add(1);
                        applied += 1;
                    }
                }
            }
            ElementType::U16 => {
                for &addr in addresses {
                    if addr < cells {
                        let at = addr as usize * 2;
                        let value = u16::from_le_bytes([self.data[at], self.data[at + 1]]);
                        self.data[at..at + 2].copy_from_slice(&value.saturating_add(1).to_le_bytes());
                        applied += 1;
                    }
                }
            }
            ElementType::U32 => {
                for &addr in addresses {
                    if addr < cells {
                        let at = addr as usize * 4;
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(&self.data[at..at + 4]);
                        let value = u32::from_le_bytes(raw).saturating_add(1);
                        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
                        applied += 1;
                    }
                }
            }
            ElementType::U64 => {
                for &addr in addresses {
                    if addr < cells {
                        let at = addr as usize * 8;
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&self.data[at..at + 8]);
                        let value = u64::from_le_bytes(raw).saturating_add(1);
                        self.data[at..at + 8].copy_from_slice(&value.to_le_bytes());
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    /// View the storage as `u16` cells, if that is the element type.
    ///
    /// Requires a little-endian host, which is what every deployment
    /// target of this driver is.
    pub fn as_u16_slice(&self) -> Option<&[u16]> {
        if self.elem != ElementType::U16 {
            return None;
        }
        // SAFETY: casting [u8] to [u16] is valid when alignment holds;
        // align_to reports any misaligned prefix/suffix and we refuse those.
        let (prefix, mid, suffix) = unsafe { self.data.align_to::<u16>() };
        (prefix.is_empty() && suffix.is_empty()).then_some(mid)
    }

    /// View the storage as `u32` cells, if that is the element type.
    pub fn as_u32_slice(&self) -> Option<&[u32]> {
        if self.elem != ElementType::U32 {
            return None;
        }
        // SAFETY: as in as_u16_slice; misalignment is detected and refused.
        let (prefix, mid, suffix) = unsafe { self.data.align_to::<u32>() };
        (prefix.is_empty() && suffix.is_empty()).then_some(mid)
    }

    /// Value of one cell widened to `u64`, by flat element index.
    pub fn cell(&self, index: usize) -> Option<u64> {
        let at = index.checked_mul(self.elem.width())?;
        if at + self.elem.width() > self.data.len() {
            return None;
        }
        let value = match self.elem {
            ElementType::U8 => self.data[at] as u64,
            ElementType::U16 => u16::from_le_bytes([self.data[at], self.data[at + 1]]) as u64,
            ElementType::U32 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&self.data[at..at + 4]);
                u32::from_le_bytes(raw) as u64
            }
            ElementType::U64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.data[at..at + 8]);
                u64::from_le_bytes(raw)
            }
        };
        Some(value)
    }
}
