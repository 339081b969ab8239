//! The interface between the indexer and whatever reads the dump.
//!
//! A provider exposes a possibly damaged view of a captured process. Any
//! enumeration may hand out a [`CorruptMarker`] in place of an entry, and
//! most attributes of an entry can individually fail to read. The indexer
//! never trusts a provider to be complete or consistent.

use std::fmt;

/// An entry or attribute the provider could not read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptMarker {
    pub address: Option<u64>,
    pub description: String,
}

impl CorruptMarker {
    pub fn new(description: impl Into<String>) -> Self {
        CorruptMarker {
            address: None,
            description: description.into(),
        }
    }

    pub fn at(address: u64, description: impl Into<String>) -> Self {
        CorruptMarker {
            address: Some(address),
            description: description.into(),
        }
    }
}

impl fmt::Display for CorruptMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(a) => write!(f, "corrupt data at 0x{:x}: {}", a, self.description),
            None => write!(f, "corrupt data: {}", self.description),
        }
    }
}

impl std::error::Error for CorruptMarker {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderError {
    Corrupt(CorruptMarker),
    /// The dump doesn't carry this piece of information
    Unavailable(String),
    /// The provider doesn't implement this query at all
    Unsupported,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Corrupt(c) => c.fmt(f),
            ProviderError::Unavailable(what) => write!(f, "data unavailable: {}", what),
            ProviderError::Unsupported => write!(f, "operation not supported"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<CorruptMarker> for ProviderError {
    fn from(c: CorruptMarker) -> Self {
        ProviderError::Corrupt(c)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAccessError {
    pub address: u64,
}

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to read memory at 0x{:x}", self.address)
    }
}

impl std::error::Error for MemoryAccessError {}

/// A lazy, finite, single pass enumeration where any element may be corrupt.
pub type Entries<'a, T> = Box<dyn Iterator<Item = Result<T, CorruptMarker>> + 'a>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassKey(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderKey(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(pub usize);

pub use crate::heapdump::{HeapRootKind, Reachability, ReferenceKind, RuntimeKind};

impl Reachability {
    pub fn is_weak(self) -> bool {
        matches!(
            self,
            Reachability::Weak | Reachability::Soft | Reachability::Phantom
        )
    }
}

#[derive(Clone, Debug)]
pub struct AddressSpaceRecord {
    pub index: usize,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct ProcessRecord {
    pub space: usize,
    pub index: usize,
    pub id: Result<String, ProviderError>,
    pub pointer_bits: Result<u32, CorruptMarker>,
}

#[derive(Clone, Debug)]
pub struct RuntimeRecord {
    pub space: usize,
    pub process: usize,
    pub index: usize,
    pub kind: RuntimeKind,
    pub version: Result<String, CorruptMarker>,
}

#[derive(Clone, Debug)]
pub struct HeapRecord {
    pub index: usize,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Section {
    pub base: u64,
    pub size: i64,
}

impl Section {
    pub fn end(&self) -> u64 {
        self.base.wrapping_add(self.size.max(0) as u64)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

#[derive(Clone, Debug)]
pub struct ObjectRecord {
    pub address: u64,
    pub class: Result<ClassKey, CorruptMarker>,
    pub size: Result<i64, CorruptMarker>,
    /// Present for arrays only
    pub array_length: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct LoaderRecord {
    pub key: LoaderKey,
    /// `Ok(None)` is the bootstrap loader in dumps which give it no object
    pub object: Result<Option<u64>, CorruptMarker>,
}

#[derive(Clone, Debug)]
pub struct ClassRecord {
    pub key: ClassKey,
    /// Provider specific identity, used when the class has no object
    pub id: Option<u64>,
    pub object: Result<Option<u64>, CorruptMarker>,
    pub name: Result<String, CorruptMarker>,
    pub superclass: Result<Option<ClassKey>, CorruptMarker>,
    pub loader: Result<Option<LoaderKey>, CorruptMarker>,
    pub component_type: Option<ClassKey>,
    pub is_array: bool,
    pub modifiers: u32,
}

#[derive(Clone, Debug)]
pub struct FieldRecord {
    pub declaring: ClassKey,
    pub index: usize,
    pub name: String,
    pub signature: String,
    pub modifiers: u32,
}

impl FieldRecord {
    pub fn is_static(&self) -> bool {
        self.modifiers & crate::constants::ACC_STATIC != 0
    }

    pub fn is_reference(&self) -> bool {
        self.signature.starts_with('L') || self.signature.starts_with('[')
    }
}

#[derive(Clone, Debug)]
pub struct MethodRecord {
    pub declaring: ClassKey,
    pub name: String,
    pub signature: Result<String, CorruptMarker>,
    pub modifiers: u32,
    pub bytecode_sections: Vec<Result<Section, CorruptMarker>>,
    pub compiled_sections: Vec<Result<Section, CorruptMarker>>,
}

impl MethodRecord {
    pub fn is_native(&self) -> bool {
        self.modifiers & crate::constants::ACC_NATIVE != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolEntry {
    Object(u64),
    Class(ClassKey),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Object(u64),
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

#[derive(Clone, Debug)]
pub struct ThreadRecord {
    pub key: ThreadKey,
    pub name: Result<String, CorruptMarker>,
    pub object: Result<Option<u64>, CorruptMarker>,
    pub state: Result<u32, CorruptMarker>,
    pub jni_env: Result<u64, CorruptMarker>,
    /// Handle for the native side of the thread, if the dump has one
    pub native_thread: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Location {
    pub method: Result<MethodRecord, CorruptMarker>,
    pub file_name: Result<String, ProviderError>,
    pub line_number: Result<i32, ProviderError>,
}

#[derive(Clone, Debug)]
pub struct FrameRecord {
    pub thread: ThreadKey,
    pub index: usize,
    pub base_pointer: Result<u64, CorruptMarker>,
    pub location: Result<Location, CorruptMarker>,
}

#[derive(Clone, Debug)]
pub struct MonitorRecord {
    pub address: u64,
    pub object: Option<u64>,
    pub owner: Result<Option<ThreadRecord>, CorruptMarker>,
    pub enter_waiters: Vec<Result<ThreadRecord, CorruptMarker>>,
    pub notify_waiters: Vec<Result<ThreadRecord, CorruptMarker>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefTarget {
    Object(u64),
    Class(ClassKey),
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootSource {
    Unknown,
    Object(u64),
    Class(ClassKey),
    /// A frame of the thread currently being walked
    StackFrame,
    /// A thread, given by the address of its object if it has one
    Thread(Option<u64>),
    Runtime,
}

#[derive(Clone, Debug)]
pub struct RootRecord {
    pub kind: Result<HeapRootKind, CorruptMarker>,
    pub reachability: Result<Reachability, CorruptMarker>,
    pub target: Result<RefTarget, ProviderError>,
    pub source: Result<RootSource, ProviderError>,
    pub description: String,
}

#[derive(Clone, Debug)]
pub struct ReferenceRecord {
    pub target: Result<RefTarget, ProviderError>,
    pub kind: ReferenceKind,
    pub description: String,
}

pub trait DumpImage {
    /// Milliseconds since the epoch, when the dump records it
    fn creation_time(&self) -> Option<u64>;
    fn address_spaces(&self) -> Entries<'_, AddressSpaceRecord>;
    fn processes(&self, space: &AddressSpaceRecord) -> Entries<'_, ProcessRecord>;
    fn runtimes(&self, process: &ProcessRecord) -> Entries<'_, RuntimeRecord>;
    fn java_runtime(&self, runtime: &RuntimeRecord) -> Option<&dyn JavaRuntime>;
}

pub trait JavaRuntime {
    fn version(&self) -> Result<String, CorruptMarker>;
    fn full_version(&self) -> Result<String, CorruptMarker>;

    fn heaps(&self) -> Entries<'_, HeapRecord>;
    fn heap_sections(&self, heap: &HeapRecord) -> Entries<'_, Section>;
    fn heap_objects(&self, heap: &HeapRecord) -> Entries<'_, ObjectRecord>;
    /// Any object known to the runtime, inside a heap or not
    fn object(&self, address: u64) -> Result<ObjectRecord, CorruptMarker>;

    fn class_loaders(&self) -> Entries<'_, LoaderRecord>;
    fn defined_classes(&self, loader: &LoaderRecord) -> Entries<'_, ClassKey>;
    fn cached_classes(&self, loader: &LoaderRecord) -> Entries<'_, ClassKey>;
    fn class(&self, key: ClassKey) -> Result<ClassRecord, CorruptMarker>;
    fn declared_fields(&self, class: &ClassRecord) -> Entries<'_, FieldRecord>;
    fn declared_methods(&self, class: &ClassRecord) -> Entries<'_, MethodRecord>;
    fn constant_pool(&self, class: &ClassRecord) -> Entries<'_, PoolEntry>;

    /// Reads a static field when `object` is `None`, an instance field otherwise
    fn field_value(
        &self,
        object: Option<&ObjectRecord>,
        field: &FieldRecord,
    ) -> Result<FieldValue, ProviderError>;
    /// Copies `count` reference elements starting at `offset`; `None` is null
    fn array_elements(
        &self,
        array: &ObjectRecord,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Option<u64>>, ProviderError>;

    fn object_references(
        &self,
        object: &ObjectRecord,
    ) -> Result<Entries<'_, ReferenceRecord>, ProviderError>;
    fn class_references(
        &self,
        class: &ClassRecord,
    ) -> Result<Entries<'_, ReferenceRecord>, ProviderError>;

    fn threads(&self) -> Entries<'_, ThreadRecord>;
    fn stack_frames(&self, thread: &ThreadRecord) -> Entries<'_, FrameRecord>;
    fn stack_sections(&self, thread: &ThreadRecord) -> Entries<'_, Section>;
    /// `None` when the dump keeps no roots for this frame
    fn frame_roots(&self, frame: &FrameRecord) -> Option<Entries<'_, RootRecord>>;
    fn native_frames(&self, native_thread: usize) -> Result<Entries<'_, u64>, ProviderError>;
    fn native_sections(&self, native_thread: usize) -> Entries<'_, Section>;
    fn monitors(&self) -> Entries<'_, MonitorRecord>;

    fn heap_roots(&self) -> Result<Entries<'_, RootRecord>, ProviderError>;

    fn read_pointer(&self, address: u64, pointer_size: usize) -> Result<u64, MemoryAccessError>;
}
