/// Dense ids for every object and class address in a dump.
///
/// Addresses are appended in any order while the dump is walked, then
/// sorted once; from then on an id is the position of its address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentifierTable {
    addresses: Vec<u64>,
    sorted: bool,
}

impl IdentifierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: u64) {
        self.addresses.push(address);
        self.sorted = false;
    }

    pub fn sort(&mut self) {
        self.addresses.sort_unstable();
        self.sorted = true;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// The id of `address`, if the table holds it
    pub fn reverse(&self, address: u64) -> Option<usize> {
        debug_assert!(self.sorted, "reverse lookup on an unsorted identifier table");
        self.addresses.binary_search(&address).ok()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.reverse(address).is_some()
    }

    pub fn get(&self, id: usize) -> u64 {
        self.addresses[id]
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.addresses.iter().copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.addresses
    }
}
