use serde::{Deserialize, Serialize};

use crate::{MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE, TransferError};

/// One contiguous slice of an object's byte range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// 1-based position within the plan.
    pub part_number: u32,
    /// Byte offset within the object.
    pub offset: u64,
    /// Size of this part in bytes.
    pub length: u64,
    /// Set once the part's transfer has been confirmed.
    pub is_completed: bool,
}

impl Part {
    /// Last byte offset covered by this part (inclusive).
    pub fn last_byte(&self) -> u64 {
        self.offset + self.length - 1
    }
}

/// Slices `[0, total_size)` into parts of `part_size` bytes.
///
/// Only the final part may be shorter. A zero total yields no parts.
pub fn plan_parts(total_size: u64, part_size: u64) -> Result<Vec<Part>, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidPartSize(part_size));
    }

    let count = total_size.div_ceil(part_size);
    let mut parts = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for number in 1..=count {
        let length = if number == count {
            total_size - (count - 1) * part_size
        } else {
            part_size
        };
        parts.push(Part {
            part_number: number as u32,
            offset,
            length,
            is_completed: false,
        });
        offset += part_size;
    }
    Ok(parts)
}

/// Clamps a requested part size into the accepted range.
pub fn clamp_part_size(part_size: u64) -> u64 {
    part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE)
}

/// Grows `part_size` when `total_size` would otherwise exceed the part limit.
pub fn fit_part_size(total_size: u64, part_size: u64) -> u64 {
    let part_size = clamp_part_size(part_size);
    if total_size / part_size >= MAX_PART_COUNT {
        total_size.div_ceil(MAX_PART_COUNT - 1)
    } else {
        part_size
    }
}

/// Fails if `total_size` cannot be covered within the part limit.
pub fn check_part_count(total_size: u64, part_size: u64) -> Result<(), TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidPartSize(part_size));
    }
    let parts = total_size.div_ceil(part_size);
    if parts > MAX_PART_COUNT {
        return Err(TransferError::TooManyParts {
            size: total_size,
            part_size,
            parts,
            max: MAX_PART_COUNT,
        });
    }
    Ok(())
}
