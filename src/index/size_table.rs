use std::collections::HashMap;

const SHIFT: u32 = 3;
const MASK: i64 = 0xff;

/// Per id object sizes, kept only to report what a purge frees.
///
/// A size that is a multiple of 8 and below 2 KiB fits in one byte; every
/// other size goes to the overflow map.
#[derive(Clone, Debug, Default)]
pub struct SizeTable {
    small: Vec<u8>,
    big: HashMap<usize, i64>,
}

impl SizeTable {
    pub fn new(len: usize) -> Self {
        SizeTable {
            small: vec![0; len],
            big: HashMap::new(),
        }
    }

    pub fn get(&self, id: usize) -> i64 {
        if let Some(&size) = self.big.get(&id) {
            return size;
        }
        self.small.get(id).map_or(0, |&s| (s as i64) << SHIFT)
    }

    pub fn set(&mut self, id: usize, size: i64) {
        if id >= self.small.len() {
            self.small.resize(id + 1, 0);
        }
        let packed = size >> SHIFT;
        if size >= 0 && packed << SHIFT == size && packed <= MASK {
            self.small[id] = packed as u8;
            self.big.remove(&id);
        } else {
            self.small[id] = 0;
            self.big.insert(id, size);
        }
    }

    pub fn len(&self) -> usize {
        self.small.len()
    }

    pub fn is_empty(&self) -> bool {
        self.small.is_empty()
    }

    /// Number of sizes that did not fit the compact form
    pub fn overflow_len(&self) -> usize {
        self.big.len()
    }
}
