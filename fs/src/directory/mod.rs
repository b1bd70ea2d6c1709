pub mod cursor;
pub mod model;
pub mod store;

pub use cursor::Cursor;
pub use model::{Block, Entry, EntryRef, Segment, SixBitName, Word};
pub use store::Directory;
