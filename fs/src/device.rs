//! Per-format total block count and usable filesystem size.

use os8_ds::DataStorage;
use os8_err::Result;

use crate::codec::{RkSide, DECTAPE_BYTES_PER_BLOCK, DSK_BYTES_PER_BLOCK, RK05_PLATTER_BLOCKS};

/// Blocks 0..6 precede file data: block 0 is reserved, blocks 1..6 hold the
/// six directory segments.
pub const PRE_DIRECTORY_BLOCKS: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Dsk,
    Dectape,
    Rk05 { side: RkSide },
}

pub struct Device {
    pub format: Format,
}

impl Device {
    pub fn new(format: Format) -> Self {
        Device { format }
    }

    /// Total addressable OS/8 blocks. RK05 is a fixed-size platter (§4.1);
    /// DECtape and DSK have no stated fixed size, so both are derived from
    /// the host file's existing byte length.
    pub fn block_count<DS: DataStorage>(&self, storage: &DS) -> Result<u32> {
        match self.format {
            Format::Rk05 { .. } => Ok(RK05_PLATTER_BLOCKS),
            Format::Dectape => Ok((storage.len()? / DECTAPE_BYTES_PER_BLOCK) as u32),
            Format::Dsk => Ok((storage.len()? / DSK_BYTES_PER_BLOCK) as u32),
        }
    }

    pub fn filesystem_size(&self, block_count: u32) -> u32 {
        block_count - PRE_DIRECTORY_BLOCKS
    }

    pub fn bytes_per_block(&self) -> u64 {
        match self.format {
            Format::Rk05 { .. } => crate::codec::RK05_BYTES_PER_BLOCK,
            Format::Dectape => DECTAPE_BYTES_PER_BLOCK,
            Format::Dsk => DSK_BYTES_PER_BLOCK,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;

    struct FixedStorage(RefCell<u64>);

    impl DataStorage for FixedStorage {
        fn read(&self, _offset: u64, _buffer: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn write(&self, _offset: u64, _buffer: &[u8]) -> Result<()> {
            Ok(())
        }
        fn len(&self) -> Result<u64> {
            Ok(*self.0.borrow())
        }
        fn set_len(&self, len: u64) -> Result<()> {
            *self.0.borrow_mut() = len;
            Ok(())
        }
    }

    #[test]
    fn rk05_is_fixed_regardless_of_host_length() {
        let device = Device::new(Format::Rk05 { side: RkSide::A });
        let storage = FixedStorage(RefCell::new(1));
        assert_eq!(device.block_count(&storage).unwrap(), RK05_PLATTER_BLOCKS);
    }

    #[test]
    fn dectape_derives_from_host_length() {
        let device = Device::new(Format::Dectape);
        let storage = FixedStorage(RefCell::new(380292));
        let blocks = device.block_count(&storage).unwrap();
        assert_eq!(blocks, 737);
        assert_eq!(device.filesystem_size(blocks), 730);
    }
}
