//! Engine API consumed by the command layer: open an image, read/mutate its
//! directory, stream file data, and flush.

use std::io::{Read, Write};
use std::rc::Rc;

use log::info;
use os8_err::{ResourceError, Result};
use os8_ds::DataStorage;

use crate::codec::{Codec, DectapeCodec, DskCodec, Rk05Codec};
use crate::device::{Device, Format};
use crate::directory::model::{Entry, EntryRef, SixBitName};
use crate::directory::{Cursor, Directory};
use crate::engine::{self, for_each_entry, LookupAll};
use crate::pattern::Pattern;
use crate::stream;

/// An open OS/8 image: the chosen [`BlockCodec`](crate::codec::BlockCodec)
/// over a shared [`DataStorage`], plus the format needed to size the
/// device. Holds no directory state of its own — callers read a
/// [`Directory`], mutate it, and flush it back through the same handle.
///
/// Locking is the backing [`DataStorage`]'s responsibility (see
/// `os8_ds_std::DataStorageServer`, which takes a non-blocking advisory
/// exclusive lock at open and releases it on drop); `ImageHandle` itself
/// carries no lock, but dropping it drops its last strong reference to the
/// storage, so the lock-holding value is released once every handle and
/// codec referencing it is gone.
pub struct ImageHandle<DS> {
    storage: Rc<DS>,
    codec: Codec<Rc<DS>>,
    format: Format,
}

pub fn open_image<DS: DataStorage>(storage: DS, format: Format) -> ImageHandle<DS> {
    let storage = Rc::new(storage);
    let codec = match format {
        Format::Dsk => Codec::Dsk(DskCodec {
            storage: storage.clone(),
        }),
        Format::Dectape => Codec::Dectape(DectapeCodec {
            storage: storage.clone(),
        }),
        Format::Rk05 { side } => Codec::Rk05(Rk05Codec {
            storage: storage.clone(),
            side,
        }),
    };
    ImageHandle {
        storage,
        codec,
        format,
    }
}

#[derive(Clone, Debug)]
pub struct ListEntry {
    pub name: Option<String>,
    pub length: u16,
}

#[derive(Clone, Debug, Default)]
pub struct ListSummary {
    pub entries: Vec<ListEntry>,
    pub file_count: usize,
    pub used_blocks: u32,
    pub free_blocks: u32,
}

impl<DS: DataStorage> ImageHandle<DS> {
    pub fn read_directory(&self) -> Result<Directory> {
        Directory::read(&self.codec)
    }

    pub fn flush(&self, dir: &mut Directory) -> Result<()> {
        dir.flush(&self.codec)
    }

    fn device(&self) -> Device {
        Device::new(self.format)
    }

    /// Writes a brand-new image, sized from the host file's current
    /// length (RK05 is fixed-size regardless).
    pub fn create(&self) -> Result<Directory> {
        let device = self.device();
        let block_count = device.block_count(self.storage.as_ref())?;
        self.storage
            .set_len(block_count as u64 * device.bytes_per_block())?;
        engine::create_filesystem(&self.codec, block_count)
    }

    pub fn zero(&self, dir: &mut Directory) -> Result<()> {
        let device = self.device();
        let block_count = device.block_count(self.storage.as_ref())?;
        engine::zero_filesystem(dir, device.filesystem_size(block_count))
    }

    /// Yields `(name, length)` for matching files and, if `print_empties`,
    /// `(None, length)` for empty entries, plus a file-count/used/free
    /// summary. Column layout is a CLI-only formatting concern.
    pub fn list(&self, dir: &Directory, pattern: Option<&Pattern>, print_empties: bool) -> ListSummary {
        let mut summary = ListSummary::default();
        for_each_entry(dir, |entry_ref| match &entry_ref.entry {
            Entry::File { name, length, .. } => {
                if pattern.is_none_or(|p| p.matches(&name.to_words())) {
                    summary.entries.push(ListEntry {
                        name: Some(name.display()),
                        length: *length,
                    });
                    summary.file_count += 1;
                    summary.used_blocks += *length as u32;
                }
            }
            Entry::Empty { length } => {
                summary.free_blocks += *length as u32;
                if print_empties {
                    summary.entries.push(ListEntry {
                        name: None,
                        length: *length,
                    });
                }
            }
        });
        summary
    }

    pub fn lookup_all<'a>(&self, dir: &'a Directory, pattern: Pattern) -> LookupAll<'a> {
        LookupAll::new(dir, pattern)
    }

    /// Deletes every entry matching any of `patterns`. Entries are deleted
    /// in reverse on-media order within each segment so an earlier delete's
    /// in-segment word shift never invalidates a later delete's recorded
    /// position.
    pub fn delete_many(&self, dir: &mut Directory, patterns: &[Pattern], quiet: bool) -> Result<usize> {
        let mut to_delete: Vec<EntryRef> = Vec::new();
        for pattern in patterns {
            let mut cursor = Cursor::start(dir);
            while let Some(found) = engine::lookup(dir, pattern, &mut cursor) {
                to_delete.push(found);
            }
        }
        to_delete.sort_by(|a, b| (b.seg_index, b.word_offset).cmp(&(a.seg_index, a.word_offset)));

        let count = to_delete.len();
        for entry in &to_delete {
            engine::delete(dir, entry)?;
        }
        engine::consolidate(dir)?;
        if !quiet {
            info!("{count} files deleted");
        }
        Ok(count)
    }

    pub fn copy_out<W: Write>(&self, entry: &EntryRef, sink: &mut W) -> Result<()> {
        stream::copy_out(&self.codec, entry, sink)
    }

    /// Allocates room for `source_len` bytes, streams `source` into it
    /// image-mode, then enters the new file into the directory.
    pub fn copy_in<R: Read>(
        &self,
        dir: &mut Directory,
        name: SixBitName,
        source_len: u64,
        source: R,
    ) -> Result<EntryRef> {
        let blocks = stream::blocks_needed(source_len);
        if blocks == 0 {
            // Open question in the design notes: a zero-byte source would
            // leave the trailing empty unchanged, which `enter` already
            // rejects as a usage error via its zero-length check.
            return Err(os8_err::UsageError::ZeroLengthFile(name.display()).into());
        }
        let empty = engine::get_empty_entry(dir, None, blocks).ok_or(ResourceError::NoEmptyEntry {
            requested: blocks,
        })?;
        stream::copy_in(&self.codec, empty.file_block, blocks, source)?;
        engine::enter(dir, name, blocks, empty)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::RkSide;
    use std::cell::RefCell;
    use std::io::Cursor as IoCursor;

    struct MemStorage {
        bytes: RefCell<Vec<u8>>,
    }

    impl MemStorage {
        fn new(len: usize) -> Self {
            MemStorage {
                bytes: RefCell::new(vec![0u8; len]),
            }
        }
    }

    impl DataStorage for MemStorage {
        fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
            let bytes = self.bytes.borrow();
            let start = offset as usize;
            buffer.copy_from_slice(&bytes[start..start + buffer.len()]);
            Ok(())
        }
        fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
            let mut bytes = self.bytes.borrow_mut();
            let start = offset as usize;
            if start + buffer.len() > bytes.len() {
                bytes.resize(start + buffer.len(), 0);
            }
            bytes[start..start + buffer.len()].copy_from_slice(buffer);
            Ok(())
        }
        fn len(&self) -> Result<u64> {
            Ok(self.bytes.borrow().len() as u64)
        }
        fn set_len(&self, len: u64) -> Result<()> {
            self.bytes.borrow_mut().resize(len as usize, 0);
            Ok(())
        }
    }

    #[test]
    fn create_dectape_then_list_matches_worked_example() {
        let storage = MemStorage::new(380292);
        let handle = open_image(storage, Format::Dectape);
        let dir = handle.create().unwrap();

        let summary = handle.list(&dir, None, true);
        assert_eq!(summary.file_count, 0);
        assert_eq!(summary.used_blocks, 0);
        assert_eq!(summary.free_blocks, 730);
    }

    #[test]
    fn copy_in_then_copy_out_byte_identical() {
        let storage = MemStorage::new(4096 * 512);
        let handle = open_image(storage, Format::Dsk);
        let mut dir = handle.create().unwrap();

        let payload = vec![0xABu8; 768];
        let name = SixBitName::parse("A.BN").unwrap();
        let entry = handle
            .copy_in(&mut dir, name, payload.len() as u64, IoCursor::new(payload.clone()))
            .unwrap();
        assert_eq!(entry.entry.length(), 2);

        let mut out = Vec::new();
        handle.copy_out(&entry, &mut out).unwrap();
        assert_eq!(&out[0..768], &payload[..]);
        assert!(out[768..1024].iter().all(|&b| b == 0));

        handle.flush(&mut dir).unwrap();
    }

    #[test]
    fn wildcard_delete_quiet_removes_only_matching_files() {
        let storage = MemStorage::new(4096 * 512);
        let handle = open_image(storage, Format::Dsk);
        let mut dir = handle.create().unwrap();

        for spec in ["FOO.PA", "FOO.BN", "BAR.PA"] {
            let name = SixBitName::parse(spec).unwrap();
            handle
                .copy_in(&mut dir, name, 1, IoCursor::new(vec![0u8; 1]))
                .unwrap();
        }

        let pattern = Pattern::compile("FOO.*").unwrap();
        let count = handle.delete_many(&mut dir, &[pattern], true).unwrap();
        assert_eq!(count, 2);

        let summary = handle.list(&dir, None, false);
        let names: Vec<&str> = summary
            .entries
            .iter()
            .filter_map(|e| e.name.as_deref())
            .collect();
        assert_eq!(names, vec!["BAR.PA"]);
    }

    #[test]
    fn rk05_sides_are_independent() {
        let storage = MemStorage::new(2 * 3248 * 384);
        let a = open_image(Rc::new(storage), Format::Rk05 { side: RkSide::A });
        // Build the B-side handle from the same underlying storage by
        // sharing the Rc the A-side handle already holds.
        let b = open_image(a.storage.clone(), Format::Rk05 { side: RkSide::B });

        let dir_a = a.create().unwrap();
        let before_b_create = a.list(&dir_a, None, true).free_blocks;
        let _dir_b = b.create().unwrap();
        let after_b_create = a.read_directory().unwrap();
        assert_eq!(
            a.list(&after_b_create, None, true).free_blocks,
            before_b_create
        );
    }
}
