use parking_lot::Mutex;
use std::cell::RefCell;
use std::fs::File;
use std::sync::Arc;

thread_local! {
    pub(crate) static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(128 * 1024));
}

/// An open concrete file behind a kernel file handle.
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub file: Arc<Mutex<File>>,
    /// Whether the handle was opened with write access.
    pub writable: bool,
}

impl FileHandle {
    pub fn new(file: File, writable: bool) -> Self {
        FileHandle {
            file: Arc::new(Mutex::new(file)),
            writable,
        }
    }
}
