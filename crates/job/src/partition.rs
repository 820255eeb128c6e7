// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Splitting a file length into ordered, contiguous byte ranges.
//!
//! Every range except possibly the last is exactly `max_segment_size` long.
//! A remainder becomes one shorter trailing range instead of being spread
//! over the others, so the plan for a given length never depends on anything
//! but the two inputs. Resume detection relies on that.

use shardkeep_base::readable_size::ReadableSize;
use snafu::{Snafu, ensure};

use crate::types::ByteRange;

/// Segment size used when none is configured.
pub const DEFAULT_SEGMENT_SIZE: ReadableSize = ReadableSize::mb(64);

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum PartitionError {
    #[snafu(display("Cannot partition an empty file"))]
    EmptyInput,

    #[snafu(display("Segment size must be at least one byte"))]
    ZeroSegmentSize,
}

/// Boundary offsets: multiples of `max_segment_size`, then `total_length`
/// when it is not itself a multiple.
fn boundaries(total_length: u64, max_segment_size: u64) -> Vec<u64> {
    let measure_count = total_length / max_segment_size;
    if measure_count == 0 {
        return vec![total_length];
    }

    let mut offsets: Vec<u64> = (1..=measure_count).map(|i| i * max_segment_size).collect();
    if total_length % max_segment_size != 0 {
        offsets.push(total_length);
    }
    offsets
}

/// Compute the part plan for a file of `total_length` bytes.
///
/// # Errors
///
/// [`PartitionError::EmptyInput`] for a zero length (there is no range
/// `[start, end)` with `start < end` to hand out) and
/// [`PartitionError::ZeroSegmentSize`] for a zero segment size.
pub fn partition(total_length: u64, max_segment_size: u64) -> Result<Vec<ByteRange>, PartitionError> {
    ensure!(max_segment_size > 0, ZeroSegmentSizeSnafu);
    ensure!(total_length > 0, EmptyInputSnafu);

    let mut start = 0;
    let ranges = boundaries(total_length, max_segment_size)
        .into_iter()
        .map(|end| {
            let range = ByteRange::new(start, end);
            start = end;
            range
        })
        .collect();
    Ok(ranges)
}
