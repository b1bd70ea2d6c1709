//! Entry lookup, empty-entry best-fit search, delete, enter, segment
//! overflow shuffle, segment allocation, and consolidation. Enforces all
//! directory invariants.

use log::{debug, warn};
use os8_err::{Error, FormatError, Result, ResourceError, UsageError};

use crate::codec::BlockCodec;
use crate::directory::model::{
    encode_entry_into, Entry, EntryRef, Segment, SixBitName, Word, EMPTY_ENTRY_WORD_COUNT,
    ENTRY_REGION_WORDS,
};
use crate::directory::{Cursor, Directory};
use crate::pattern::Pattern;

/// Walks the whole chain in on-media order, calling `f` with every entry
/// (empty and file alike).
pub(crate) fn for_each_entry(dir: &Directory, mut f: impl FnMut(EntryRef)) {
    let mut cursor = Cursor::start(dir);
    loop {
        let current = match cursor.peek(dir) {
            Some(e) => e,
            None => break,
        };
        f(current);
        if !cursor.advance(dir) {
            break;
        }
    }
}

/// Walks the cursor forward, skipping empty entries and zero-length file
/// entries, yielding the next entry whose name matches `pattern`. Repeated
/// calls with the same cursor yield all further matches.
pub fn lookup(dir: &Directory, pattern: &Pattern, cursor: &mut Cursor) -> Option<EntryRef> {
    loop {
        let current = cursor.peek(dir)?;
        let candidate = match &current.entry {
            Entry::File { name, length, .. } if *length != 0 && pattern.matches(&name.to_words()) => {
                Some(current.clone())
            }
            _ => None,
        };
        let more = cursor.advance(dir);
        if candidate.is_some() {
            return candidate;
        }
        if !more {
            return None;
        }
    }
}

/// An iterator over every remaining match of `pattern`, built on repeated
/// [`lookup`] calls.
pub struct LookupAll<'a> {
    dir: &'a Directory,
    pattern: Pattern,
    cursor: Cursor,
}

impl<'a> LookupAll<'a> {
    pub fn new(dir: &'a Directory, pattern: Pattern) -> Self {
        LookupAll {
            dir,
            pattern,
            cursor: Cursor::start(dir),
        }
    }
}

impl Iterator for LookupAll<'_> {
    type Item = EntryRef;

    fn next(&mut self) -> Option<EntryRef> {
        lookup(self.dir, &self.pattern, &mut self.cursor)
    }
}

/// Best-fit search across all segments. `exclude` identifies `(seg_index,
/// file_number)` to skip (the empty produced by a just-deleted file, before
/// it is overwritten). `requested_length == 0` returns the largest
/// qualifying empty; otherwise the strict smallest.
pub fn get_empty_entry(
    dir: &Directory,
    exclude: Option<(u8, u16)>,
    requested_length: u16,
) -> Option<EntryRef> {
    let mut best: Option<EntryRef> = None;
    for_each_entry(dir, |candidate| {
        let length = match &candidate.entry {
            Entry::Empty { length } => *length,
            Entry::File { .. } => return,
        };
        if exclude == Some((candidate.seg_index, candidate.file_number)) {
            return;
        }
        if length < requested_length {
            return;
        }
        let better = match &best {
            None => true,
            Some(b) => {
                if requested_length == 0 {
                    length > b.entry.length()
                } else {
                    length < b.entry.length()
                }
            }
        };
        if better {
            best = Some(candidate);
        }
    });
    best
}

/// Turns a file entry back into an empty entry of the same length, in
/// place. Adjusts the segment's tentative-entry flag word if it pointed
/// beyond the deleted entry.
pub fn delete(dir: &mut Directory, entry_ref: &EntryRef) -> Result<()> {
    let length = match &entry_ref.entry {
        Entry::File { length, .. } => *length,
        Entry::Empty { .. } => {
            return Err(Error::Invariant("cannot delete an already-empty entry".into()))
        }
    };
    let seg = dir
        .segment_mut(entry_ref.seg_index)
        .ok_or_else(|| Error::Invariant("segment missing for delete".into()))?;
    let offset = entry_ref.word_offset;
    let file_word_count = entry_ref.entry.word_count();
    seg.splice(
        offset,
        file_word_count,
        &[Word::new(0), Word::new(crate::directory::model::neg12(length))],
    );
    dir.mark_dirty(entry_ref.seg_index);
    Ok(())
}

/// Single forward pass with one restart per merge: combines two adjacent
/// empties in the same segment into one, and removes any zero-length empty
/// that is not the only entry in its segment. Does not merge across
/// segments.
pub fn consolidate(dir: &mut Directory) -> Result<()> {
    for seg_index in 0..6u8 {
        if dir.segment(seg_index).is_none() {
            continue;
        }
        consolidate_segment(dir, seg_index)?;
    }
    Ok(())
}

fn consolidate_segment(dir: &mut Directory, seg_index: u8) -> Result<()> {
    loop {
        let entries = dir
            .segment(seg_index)
            .expect("checked present by caller")
            .entries_with_offsets()?;

        if let Some(pair) = entries.windows(2).find(|pair| {
            pair[0].2.is_empty_entry() && pair[1].2.is_empty_entry()
        }) {
            let (off_a, _, ea) = &pair[0];
            let (off_b, wc_b, eb) = &pair[1];
            let merged_length = ea.length() + eb.length();
            let seg = dir.segment_mut(seg_index).unwrap();
            seg.splice(*off_b, *wc_b, &[]);
            seg.words[*off_a + 1] =
                Word::new(crate::directory::model::neg12(merged_length));
            seg.number_files -= 1;
            dir.mark_dirty(seg_index);
            debug!("consolidate: merged adjacent empties in segment {seg_index}");
            continue;
        }

        let seg = dir.segment(seg_index).unwrap();
        if seg.number_files > 1 {
            if let Some((off, wc, _)) = entries
                .iter()
                .find(|(_, _, e)| matches!(e, Entry::Empty { length: 0 }))
            {
                let seg = dir.segment_mut(seg_index).unwrap();
                seg.splice(*off, *wc, &[]);
                seg.number_files -= 1;
                dir.mark_dirty(seg_index);
                debug!("consolidate: removed zero-length empty in segment {seg_index}");
                continue;
            }
        }
        break;
    }
    Ok(())
}

/// Finds the highest-word-offset `File` entry in `seg_index`'s entries.
fn last_file_entry(dir: &Directory, seg_index: u8) -> Result<Option<(usize, usize, Entry)>> {
    let entries = dir.segment(seg_index).unwrap().entries_with_offsets()?;
    Ok(entries
        .into_iter()
        .rev()
        .find(|(_, _, e)| matches!(e, Entry::File { .. })))
}

/// Migrates the last file of `from_idx` forward to become the first file
/// of `to_idx`. `tracked` is the empty entry the caller is trying to fill;
/// its recorded position is kept in sync if it shifts.
fn migrate_last_file(
    dir: &mut Directory,
    from_idx: u8,
    to_idx: u8,
    tracked: &mut EntryRef,
) -> Result<()> {
    let (off, wc, entry) = last_file_entry(dir, from_idx)?
        .ok_or_else(|| Error::Invariant("segment has no file entry to migrate".into()))?;
    let migrated_length = entry.length();
    let migrated_words: Vec<Word> = {
        let seg = dir.segment(from_idx).unwrap();
        seg.words[off..off + wc].to_vec()
    };

    {
        let seg = dir.segment_mut(from_idx).unwrap();
        seg.splice(off, wc, &[]);
        seg.number_files -= 1;
        dir.mark_dirty(from_idx);
    }
    if tracked.seg_index == from_idx && tracked.word_offset > off {
        tracked.word_offset -= wc;
    }

    {
        let seg = dir.segment_mut(to_idx).unwrap();
        seg.splice(0, 0, &migrated_words);
        seg.number_files += 1;
        seg.first_file_block -= migrated_length as u32;
        dir.mark_dirty(to_idx);
    }
    if tracked.seg_index == to_idx {
        tracked.word_offset += wc;
    }

    debug!("migrated file of {migrated_length} blocks from segment {from_idx} to {to_idx}");
    Ok(())
}

/// Allocates a new segment directly after `tail_idx` (which must be the
/// current end of the chain), linking it in and seeding it with a single
/// zero-length empty entry.
fn allocate_segment(dir: &mut Directory, tail_idx: u8) -> Result<()> {
    let new_idx = tail_idx + 1;
    if new_idx >= 6 {
        return Err(ResourceError::NoSpace.into());
    }

    let (new_first_block, additional_words) = {
        let tail = dir.segment(tail_idx).unwrap();
        let entries = tail.entries_with_offsets()?;
        let (_, _, last_entry) = entries
            .last()
            .cloned()
            .ok_or_else(|| Error::Invariant("segment has no entries to extend from".into()))?;
        let mut block = tail.first_file_block;
        for (_, _, e) in &entries[..entries.len() - 1] {
            block += e.length() as u32;
        }
        (block + last_entry.length() as u32, tail.additional_words)
    };

    let new_seg = Segment {
        seg_index: new_idx,
        number_files: 1,
        first_file_block: new_first_block,
        next_segment_word: 0,
        flag_word: 0,
        additional_words,
        words: vec![Word::new(0), Word::new(0)],
    };

    dir.segment_mut(tail_idx).unwrap().next_segment_word = (new_idx + 1) as u16;
    dir.mark_dirty(tail_idx);
    dir.set_segment(new_idx, new_seg);
    debug!("allocated segment {new_idx} (chain extended from {tail_idx})");
    Ok(())
}

/// Ensures `seg_index` has at least `min_free` free tail words, migrating
/// its last file into its immediate successor — allocating one if the chain
/// ends here — one hop at a time. Never skips over an intermediate segment:
/// before migrating `seg_index`'s last file forward, the successor itself is
/// recursively given room first, so every migration only ever moves data
/// between adjacent segments and no segment strictly between the two
/// endpoints is left with a stale `first_file_block` (invariant 5).
fn ensure_room(
    dir: &mut Directory,
    seg_index: u8,
    min_free: usize,
    tracked: &mut EntryRef,
) -> Result<()> {
    while dir.segment(seg_index).unwrap().free_tail_words() < min_free {
        let next_word = dir.segment(seg_index).unwrap().next_segment_word;
        let next_idx = if next_word == 0 {
            allocate_segment(dir, seg_index)?;
            seg_index + 1
        } else {
            (next_word - 1) as u8
        };
        ensure_room(dir, next_idx, min_free, tracked)?;
        migrate_last_file(dir, seg_index, next_idx, tracked)?;
    }
    Ok(())
}

/// Core mutation. `empty_entry_ref` must be an empty entry previously
/// returned by [`get_empty_entry`] for this transaction; no data has yet
/// been written outside its block range.
pub fn enter(
    dir: &mut Directory,
    name: SixBitName,
    actual_length: u16,
    mut empty_entry_ref: EntryRef,
) -> Result<EntryRef> {
    if actual_length == 0 {
        return Err(UsageError::ZeroLengthFile(name.display()).into());
    }
    let old_empty_length = match &empty_entry_ref.entry {
        Entry::Empty { length } => *length,
        Entry::File { .. } => {
            return Err(Error::Invariant("enter target is not an empty entry".into()))
        }
    };
    if old_empty_length < actual_length {
        return Err(Error::Invariant(
            "enter target empty entry is smaller than the requested length".into(),
        ));
    }
    let total_before = dir.total_length()?;

    let current = empty_entry_ref.seg_index;
    let additional_words = dir.segment(current).unwrap().additional_words;
    let new_entry_word_count = 4 + additional_words as usize + 1;
    let min_free = new_entry_word_count + EMPTY_ENTRY_WORD_COUNT;

    ensure_room(dir, current, min_free, &mut empty_entry_ref)?;

    let offset = empty_entry_ref.word_offset;
    let placeholder = vec![Word::new(0); new_entry_word_count];
    {
        let seg = dir.segment_mut(current).unwrap();
        seg.splice(offset, 0, &placeholder);
    }

    let stamped_name = name.clone();
    let entry = Entry::File {
        name,
        extras: vec![Word::new(0); additional_words as usize],
        length: actual_length,
    };
    {
        let seg = dir.segment_mut(current).unwrap();
        encode_entry_into(&mut seg.words, offset, &entry);
        seg.number_files += 1;
    }

    let new_empty_offset = offset + new_entry_word_count;
    let remaining = old_empty_length - actual_length;
    {
        let seg = dir.segment_mut(current).unwrap();
        seg.words[new_empty_offset] = Word::new(0);
        seg.words[new_empty_offset + 1] = Word::new(crate::directory::model::neg12(remaining));
    }
    dir.mark_dirty(current);

    consolidate(dir)?;
    dir.validate()?;

    // Entering a file only ever reclassifies bytes already accounted for by
    // the empty entry it was carved from (splitting lengths, migrating
    // whole files between segments), so the chain-wide total must come out
    // unchanged (invariant 6).
    let total_after = dir.total_length()?;
    if total_after != total_before {
        return Err(Error::Invariant(format!(
            "enter changed total entry length across the chain: {total_before} -> {total_after}"
        )));
    }

    // Consolidate may have shifted earlier entries in `current` (a merged
    // or reaped empty elsewhere in the segment moves every later word
    // offset, including ours and the segment-relative file number), so the
    // entry is relocated by identity rather than by the position recorded
    // before consolidate ran.
    locate_file(dir, current, &stamped_name, actual_length)
        .ok_or_else(|| Error::Invariant("stamped entry not found after consolidate".into()))
}

/// Finds the `File` entry named `name` of length `length` in `seg_index`,
/// recomputing its current word offset, file number, and file block.
fn locate_file(
    dir: &Directory,
    seg_index: u8,
    name: &SixBitName,
    length: u16,
) -> Option<EntryRef> {
    let seg = dir.segment(seg_index)?;
    let mut file_block = seg.first_file_block;
    let mut file_number = 1u16;
    for (offset, _wc, entry) in seg.entries_with_offsets().ok()? {
        if let Entry::File {
            name: n,
            length: l,
            ..
        } = &entry
        {
            if n == name && *l == length {
                return Some(EntryRef {
                    seg_index,
                    word_offset: offset,
                    file_number,
                    file_block,
                    entry,
                });
            }
        }
        file_block += entry.length() as u32;
        file_number += 1;
    }
    None
}

/// Retains `first_file_block`, resets segment 0 to one empty entry
/// spanning `device.filesystem_size`, clears `next_segment`/`flag_word`.
/// Other segments become unreachable and are not rewritten.
pub fn zero_filesystem(dir: &mut Directory, filesystem_size: u32) -> Result<()> {
    let seg0 = dir
        .segment_mut(0)
        .ok_or_else(|| Error::Invariant("segment 0 missing".into()))?;
    let first_file_block = seg0.first_file_block;
    if filesystem_size < first_file_block {
        return Err(Error::Invariant("filesystem_size precedes first_file_block".into()));
    }
    let empty_length = filesystem_size - first_file_block;
    seg0.number_files = 1;
    seg0.next_segment_word = 0;
    seg0.flag_word = 0;
    seg0.words = vec![
        Word::new(0),
        Word::new(crate::directory::model::neg12(empty_length as u16)),
    ];
    dir.mark_dirty(0);
    Ok(())
}

/// Writes a brand-new image: every directory segment slot is written (only
/// segment 0 is chain-reachable), segment 0 holds a single empty entry
/// spanning the whole usable filesystem.
pub fn create_filesystem<C: BlockCodec>(codec: &C, block_count: u32) -> Result<Directory> {
    let first_file_block = crate::device::PRE_DIRECTORY_BLOCKS;
    if block_count <= first_file_block {
        return Err(FormatError::InvalidDirectory {
            seg_index: 0,
            reason: "device is too small to hold a directory and any file data".to_string(),
        }
        .into());
    }
    let filesystem_size = block_count - first_file_block;

    codec.write(0, &crate::directory::model::empty_block())?;

    let mut segments: [Option<Segment>; 6] = Default::default();
    for idx in 0..6u8 {
        let seg = Segment {
            seg_index: idx,
            number_files: 1,
            first_file_block,
            next_segment_word: 0,
            flag_word: 0,
            additional_words: 1,
            words: if idx == 0 {
                vec![
                    Word::new(0),
                    Word::new(crate::directory::model::neg12(filesystem_size as u16)),
                ]
            } else {
                vec![Word::new(0), Word::new(0)]
            },
        };
        codec.write(idx as u32 + 1, &seg.encode())?;
        segments[idx as usize] = Some(seg);
    }

    if block_count > 0 {
        codec.write(block_count - 1, &crate::directory::model::empty_block())?;
    }

    let dir = Directory::from_segments(segments);
    dir.validate()?;
    Ok(dir)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::model::{Block, SixBitName};

    fn fresh_directory(first_file_block: u32, filesystem_size: u32) -> Directory {
        let mut segments: [Option<Segment>; 6] = Default::default();
        segments[0] = Some(Segment {
            seg_index: 0,
            number_files: 1,
            first_file_block,
            next_segment_word: 0,
            flag_word: 0,
            additional_words: 1,
            words: vec![
                Word::new(0),
                Word::new(crate::directory::model::neg12(filesystem_size as u16)),
            ],
        });
        Directory::from_segments(segments)
    }

    fn enter_file(dir: &mut Directory, name: &str, blocks: u16) -> EntryRef {
        let empty = get_empty_entry(dir, None, blocks).expect("room for new file");
        enter(dir, SixBitName::parse(name).unwrap(), blocks, empty).unwrap()
    }

    #[test]
    fn enter_then_lookup_then_delete_round_trip() {
        let mut dir = fresh_directory(7, 100);
        enter_file(&mut dir, "A.BN", 2);

        let pattern = Pattern::compile("A.BN").unwrap();
        let mut cursor = Cursor::start(&dir);
        let found = lookup(&dir, &pattern, &mut cursor).expect("entry found");
        assert_eq!(found.entry.length(), 2);
        assert_eq!(found.file_block, 7);

        delete(&mut dir, &found).unwrap();
        let mut cursor = Cursor::start(&dir);
        assert!(lookup(&dir, &pattern, &mut cursor).is_none());
        dir.validate().unwrap();
    }

    #[test]
    fn consolidate_merges_only_adjacent_empties() {
        let mut dir = fresh_directory(7, 100);
        enter_file(&mut dir, "A.PA", 1);
        enter_file(&mut dir, "B.PA", 1);
        enter_file(&mut dir, "C.PA", 1);

        let pattern_b = Pattern::compile("B.PA").unwrap();
        let mut cursor = Cursor::start(&dir);
        let b = lookup(&dir, &pattern_b, &mut cursor).unwrap();
        delete(&mut dir, &b).unwrap();
        consolidate(&mut dir).unwrap();

        let seg0 = dir.segment(0).unwrap();
        let entries = seg0.entries().unwrap();
        // A, empty(B), C, trailing empty — consolidate must not merge
        // across the still-live C entry.
        assert!(matches!(entries[1], Entry::Empty { length: 1 }));
        assert!(matches!(entries[2], Entry::File { .. }));

        let pattern_a = Pattern::compile("A.PA").unwrap();
        let mut cursor = Cursor::start(&dir);
        let a = lookup(&dir, &pattern_a, &mut cursor).unwrap();
        let before = seg0.number_files;
        delete(&mut dir, &a).unwrap();
        consolidate(&mut dir).unwrap();
        let after = dir.segment(0).unwrap().number_files;
        assert_eq!(after, before - 1);

        let entries = dir.segment(0).unwrap().entries().unwrap();
        assert!(matches!(entries[0], Entry::Empty { length: 2 }));
    }

    #[test]
    fn enter_forces_segment_migration_on_small_device() {
        // Filesystem sized so 49 one-block files plus the trailing empty
        // cannot all fit in one segment's 251-word entry region (49 * 6 +
        // 2 = 296 > 251), forcing `enter` to allocate and migrate across
        // segments.
        let mut dir = fresh_directory(7, 200);
        for i in 0..49u32 {
            let name = format!("F{i}.DA");
            enter_file(&mut dir, &name, 1);
        }
        dir.validate().unwrap();

        let mut seg_index = 0u8;
        loop {
            let seg = dir.segment(seg_index).unwrap();
            assert!(seg.number_files <= 50);
            if seg.next_segment_word == 0 {
                break;
            }
            seg_index = (seg.next_segment_word - 1) as u8;
        }
        assert!(seg_index > 0, "expected the chain to have grown");
    }

    #[test]
    fn enter_cascades_through_a_full_intermediate_segment() {
        // Enough one-block files that the chain must grow past a second
        // segment and into a third. The empty entry `enter` keeps carving
        // from stays in segment 0 for the whole run, so once segment 0
        // fills it evicts its own most-recently-entered file into segment
        // 1 on every subsequent call — and once segment 1 fills the same
        // way, `enter`'s room-making step must recurse into segment 1
        // before it can migrate segment 0's file into it, rather than
        // reaching past segment 1 straight into a freshly allocated
        // segment 2. A direct (non-cascading) jump would leave segment 1's
        // `first_file_block` stale, which `validate` below would catch.
        let mut dir = fresh_directory(7, 1000);
        for i in 0..160u32 {
            let name = format!("F{i}.DA");
            enter_file(&mut dir, &name, 1);
        }
        dir.validate().unwrap();
        assert_eq!(dir.total_length().unwrap(), 1000);

        let mut seg_index = 0u8;
        let mut segment_count = 1u32;
        loop {
            let seg = dir.segment(seg_index).unwrap();
            if seg.next_segment_word == 0 {
                break;
            }
            seg_index = (seg.next_segment_word - 1) as u8;
            segment_count += 1;
        }
        assert!(
            segment_count >= 3,
            "expected the chain to reach a third segment, got {segment_count}"
        );
    }

    #[test]
    fn zero_filesystem_resets_to_one_empty_entry() {
        let mut dir = fresh_directory(7, 100);
        enter_file(&mut dir, "A.BN", 3);
        zero_filesystem(&mut dir, 100).unwrap();

        let seg0 = dir.segment(0).unwrap();
        assert_eq!(seg0.number_files, 1);
        assert_eq!(seg0.next_segment_word, 0);
        assert_eq!(seg0.flag_word, 0);
        let entries = seg0.entries().unwrap();
        assert!(matches!(entries[0], Entry::Empty { length: 93 }));
    }

    struct NullCodec;
    impl BlockCodec for NullCodec {
        fn read(&self, _block_no: u32) -> Result<Block> {
            Ok(crate::directory::model::empty_block())
        }
        fn write(&self, _block_no: u32, _block: &Block) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn create_filesystem_matches_worked_dectape_example() {
        let dir = create_filesystem(&NullCodec, 737).unwrap();
        let seg0 = dir.segment(0).unwrap();
        assert_eq!(seg0.number_files, 1);
        assert_eq!(seg0.first_file_block, 7);
        assert_eq!(seg0.next_segment_word, 0);
        assert_eq!(seg0.additional_words, 1);
        let entries = seg0.entries().unwrap();
        assert!(matches!(entries[0], Entry::Empty { length: 730 }));
    }
}
