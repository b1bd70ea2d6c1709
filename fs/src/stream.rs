//! Copies blocks between an allocated OS/8 empty-file region and a host
//! byte stream.
//!
//! Text transcoding (carriage-return injection, mark-bit, trailing `^Z`)
//! stays an external collaborator; this module only moves raw 512-byte
//! blocks, which is also the path a transcoder funnels through after
//! writing its expanded output to a scratch host file (§4.6).

use std::io::{Read, Write};

use os8_err::{Error, FormatError, Result};

use crate::codec::BlockCodec;
use crate::directory::model::{empty_block, Block, EntryRef};
use crate::device::PRE_DIRECTORY_BLOCKS;

pub const HOST_BLOCK_BYTES: usize = 512;

fn check_not_directory_block(block_no: u32) -> Result<()> {
    if block_no < PRE_DIRECTORY_BLOCKS {
        return Err(Error::Invariant(format!(
            "refusing to write file data over directory region block {block_no}"
        )));
    }
    Ok(())
}

fn block_to_bytes(block: &Block) -> [u8; HOST_BLOCK_BYTES] {
    let mut out = [0u8; HOST_BLOCK_BYTES];
    for (i, w) in block.iter().enumerate() {
        let v = w.get();
        out[i * 2] = (v & 0xFF) as u8;
        out[i * 2 + 1] = (v >> 8) as u8;
    }
    out
}

fn bytes_to_block(bytes: &[u8; HOST_BLOCK_BYTES]) -> Block {
    let mut block = empty_block();
    for i in 0..256 {
        let v = bytes[i * 2] as u16 | ((bytes[i * 2 + 1] as u16) << 8);
        block[i] = crate::directory::model::Word::new(v);
    }
    block
}

fn host_io_err(reason: &str) -> Error {
    FormatError::InvalidDirectory {
        seg_index: 0,
        reason: reason.to_string(),
    }
    .into()
}

/// Reads every block of `entry`'s data range and writes the decoded bytes
/// to `sink`, in image mode (no text transcoding).
pub fn copy_out<C: BlockCodec, W: Write>(codec: &C, entry: &EntryRef, sink: &mut W) -> Result<()> {
    let length = entry.entry.length();
    for i in 0..length as u32 {
        let block = codec.read(entry.file_block + i)?;
        let bytes = block_to_bytes(&block);
        sink.write_all(&bytes)
            .map_err(|_| host_io_err("host sink I/O error during copy_out"))?;
    }
    Ok(())
}

/// Computes `ceil(source_len / 512)` blocks, writes `source`'s bytes
/// block-by-block into `first_block..first_block+blocks`, zero-padding the
/// final block.
pub fn copy_in<C: BlockCodec, R: Read>(
    codec: &C,
    first_block: u32,
    blocks: u16,
    mut source: R,
) -> Result<()> {
    for i in 0..blocks as u32 {
        check_not_directory_block(first_block + i)?;
        let mut bytes = [0u8; HOST_BLOCK_BYTES];
        let mut filled = 0usize;
        while filled < HOST_BLOCK_BYTES {
            let n = source
                .read(&mut bytes[filled..])
                .map_err(|_| host_io_err("host source I/O error during copy_in"))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let block = bytes_to_block(&bytes);
        codec.write(first_block + i, &block)?;
    }
    Ok(())
}

pub fn blocks_needed(source_len: u64) -> u16 {
    ((source_len + HOST_BLOCK_BYTES as u64 - 1) / HOST_BLOCK_BYTES as u64) as u16
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::model::Entry;
    use std::cell::RefCell;
    use std::io::Cursor;

    struct MemCodec {
        blocks: RefCell<std::collections::HashMap<u32, Block>>,
    }

    impl MemCodec {
        fn new() -> Self {
            MemCodec {
                blocks: RefCell::new(std::collections::HashMap::new()),
            }
        }
    }

    impl BlockCodec for MemCodec {
        fn read(&self, block_no: u32) -> Result<Block> {
            Ok(self
                .blocks
                .borrow()
                .get(&block_no)
                .copied()
                .unwrap_or_else(empty_block))
        }
        fn write(&self, block_no: u32, block: &Block) -> Result<()> {
            self.blocks.borrow_mut().insert(block_no, *block);
            Ok(())
        }
    }

    #[test]
    fn copy_in_then_copy_out_round_trip_with_zero_padding() {
        let codec = MemCodec::new();
        let payload = vec![0x41u8; 768];
        let blocks = blocks_needed(payload.len() as u64);
        assert_eq!(blocks, 2);

        copy_in(&codec, 100, blocks, Cursor::new(payload.clone())).unwrap();

        let entry = EntryRef {
            seg_index: 0,
            word_offset: 0,
            file_number: 1,
            file_block: 100,
            entry: Entry::File {
                name: crate::directory::model::SixBitName::parse("A.BN").unwrap(),
                extras: vec![],
                length: blocks,
            },
        };
        let mut out = Vec::new();
        copy_out(&codec, &entry, &mut out).unwrap();

        assert_eq!(out.len(), 1024);
        assert_eq!(&out[0..768], &payload[..]);
        assert!(out[768..1024].iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_in_refuses_to_overwrite_directory_blocks() {
        let codec = MemCodec::new();
        let err = copy_in(&codec, 3, 1, Cursor::new(vec![0u8; 512])).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }
}
