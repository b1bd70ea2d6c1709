//! In-memory hold of all six directory segments plus a dirty flag per
//! segment, read and written through a [`crate::codec::BlockCodec`].

use log::{debug, warn};
use os8_err::{FormatError, Result};

use super::model::{Segment, FLAG_BASE, HEADER_WORDS};
use crate::codec::BlockCodec;

pub const SEGMENT_COUNT: usize = 6;

#[derive(Debug)]
pub struct Directory {
    segments: [Option<Segment>; 6],
    dirty: [bool; 6],
}

impl Directory {
    /// Builds a Directory directly from a fully-populated segment table,
    /// all dirty. Used by [`crate::engine::create_filesystem`], which
    /// writes the segments itself rather than reading them back.
    pub fn from_segments(segments: [Option<Segment>; 6]) -> Self {
        Directory {
            segments,
            dirty: [true; SEGMENT_COUNT],
        }
    }

    pub fn segment(&self, seg_index: u8) -> Option<&Segment> {
        self.segments.get(seg_index as usize)?.as_ref()
    }

    pub fn segment_mut(&mut self, seg_index: u8) -> Option<&mut Segment> {
        self.segments.get_mut(seg_index as usize)?.as_mut()
    }

    pub fn set_segment(&mut self, seg_index: u8, segment: Segment) {
        self.segments[seg_index as usize] = Some(segment);
        self.dirty[seg_index as usize] = true;
    }

    pub fn mark_dirty(&mut self, seg_index: u8) {
        self.dirty[seg_index as usize] = true;
    }

    /// Reads segments following the `next_segment` chain starting at block
    /// 1 (`seg_index = 0`). Segments not reachable from the chain are left
    /// absent in the in-memory table.
    pub fn read<C: BlockCodec>(codec: &C) -> Result<Self> {
        let mut segments: [Option<Segment>; 6] = Default::default();
        let mut visited = [false; SEGMENT_COUNT];
        let mut block_no = 1u32;

        while block_no != 0 {
            if !(1..=6).contains(&block_no) {
                return Err(FormatError::ChainOutOfRange(block_no as u16).into());
            }
            let seg_index = (block_no - 1) as u8;
            if visited[seg_index as usize] {
                return Err(FormatError::ChainCycle(seg_index).into());
            }
            visited[seg_index as usize] = true;

            let block = codec.read(block_no)?;
            let segment = Segment::decode(seg_index, &block)?;
            block_no = segment.next_segment_word as u32;
            segments[seg_index as usize] = Some(segment);
        }

        let dir = Directory {
            segments,
            dirty: [false; SEGMENT_COUNT],
        };
        dir.validate()?;
        Ok(dir)
    }

    /// Checks invariants 1–4 of the data model on every segment reached via
    /// the chain, plus invariant 5 (`first_file_block` chaining).
    pub fn validate(&self) -> Result<()> {
        let mut visited = [false; SEGMENT_COUNT];
        let mut seg_index = 0u8;
        let mut expected_first_block: Option<u32> = None;

        loop {
            let seg = self.segment(seg_index).ok_or_else(|| {
                FormatError::InvalidDirectory {
                    seg_index,
                    reason: "segment on chain is absent from the in-memory table".to_string(),
                }
            })?;
            if visited[seg_index as usize] {
                return Err(FormatError::ChainCycle(seg_index).into());
            }
            visited[seg_index as usize] = true;

            if seg.number_files == 0 {
                return Err(FormatError::InvalidDirectory {
                    seg_index,
                    reason: "number_files is 0 in a live segment".to_string(),
                }
                .into());
            }
            if seg.number_files >= 100 {
                return Err(FormatError::InvalidDirectory {
                    seg_index,
                    reason: format!("|number_files| = {} is not < 100", seg.number_files),
                }
                .into());
            }
            if seg.additional_words >= 10 {
                return Err(FormatError::InvalidDirectory {
                    seg_index,
                    reason: format!(
                        "|additional_words| = {} is not < 10",
                        seg.additional_words
                    ),
                }
                .into());
            }
            if seg.next_segment_word != 0 && !(1..=6).contains(&seg.next_segment_word) {
                return Err(FormatError::ChainOutOfRange(seg.next_segment_word).into());
            }
            if seg.flag_word != 0 {
                if !(FLAG_BASE..=0o1777).contains(&seg.flag_word) {
                    return Err(FormatError::InvalidDirectory {
                        seg_index,
                        reason: format!("flag_word {:#o} is out of range", seg.flag_word),
                    }
                    .into());
                }
                if (seg.flag_word - FLAG_BASE) < HEADER_WORDS as u16 {
                    return Err(FormatError::InvalidDirectory {
                        seg_index,
                        reason: "flag_word indexes before the first entry".to_string(),
                    }
                    .into());
                }
            }
            if let Some(expected) = expected_first_block {
                if seg.first_file_block != expected {
                    return Err(FormatError::InvalidDirectory {
                        seg_index,
                        reason: format!(
                            "first_file_block {} does not follow predecessor's chaining ({})",
                            seg.first_file_block, expected
                        ),
                    }
                    .into());
                }
            }

            let sum = seg.sum_entry_lengths()?;
            expected_first_block = Some(seg.first_file_block + sum);

            if seg.next_segment_word == 0 {
                break;
            }
            seg_index = (seg.next_segment_word - 1) as u8;
        }
        Ok(())
    }

    /// Total length of all entries across the chain; callers compare this
    /// against `device.filesystem_size` for invariant 6.
    pub fn total_length(&self) -> Result<u32> {
        let mut total = 0u32;
        let mut seg_index = 0u8;
        loop {
            let seg = self
                .segment(seg_index)
                .expect("validate() must run before total_length()");
            total += seg.sum_entry_lengths()?;
            if seg.next_segment_word == 0 {
                break;
            }
            seg_index = (seg.next_segment_word - 1) as u8;
        }
        Ok(total)
    }

    /// Writes every dirty segment reachable via the chain, in chain order.
    /// Halts and reports on the first write failure, leaving the dirty
    /// flags of segments not yet flushed set (the caller's retry, or the
    /// next flush, will pick them up; the segments already written are
    /// clean).
    pub fn flush<C: BlockCodec>(&mut self, codec: &C) -> Result<()> {
        self.validate()?;
        let mut seg_index = 0u8;
        loop {
            let next_segment_word = {
                let seg = self.segment(seg_index).expect("chain segment missing");
                if self.dirty[seg_index as usize] {
                    codec.write(seg_index as u32 + 1, &seg.encode())?;
                    debug!("flushed segment {seg_index}");
                }
                seg.next_segment_word
            };
            self.dirty[seg_index as usize] = false;
            if next_segment_word == 0 {
                break;
            }
            seg_index = (next_segment_word - 1) as u8;
        }
        Ok(())
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        if self.dirty.iter().any(|&d| d) {
            warn!("directory dropped with unflushed segments");
        }
    }
}
