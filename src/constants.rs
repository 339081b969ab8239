pub const LOG_BYTES_IN_KBYTE: u8 = 10;
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

pub const LOG_BYTES_IN_MBYTE: u8 = 20;
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// Objects are laid out on 8 byte boundaries in every supported runtime
pub const LOG_OBJECT_ALIGNMENT: u8 = 3;
pub const OBJECT_ALIGNMENT: u64 = 1 << LOG_OBJECT_ALIGNMENT;

/// Elements copied out of an array per provider read
pub const ARRAY_PIECE_SIZE: usize = 100_000;

/// Upper bounds on a single frame when the base pointer of the neighbouring
/// frame can't narrow it down
pub const JAVA_STACK_FRAME_SIZE: i64 = 256;
pub const NATIVE_STACK_FRAME_SIZE: i64 = 2048;

/// Stack sections larger than this are only sampled at the head and tail
pub const JAVA_STACK_SECTION_MAX_SIZE: i64 = BYTES_IN_MBYTE as i64;
pub const NATIVE_STACK_SECTION_MAX_SIZE: i64 = BYTES_IN_MBYTE as i64;

/// Method sections at or past these sizes are treated as corrupt
pub const BYTECODE_SECTION_LIMIT: i64 = 64 * BYTES_IN_KBYTE as i64;
pub const COMPILED_SECTION_LIMIT: i64 = 384 * BYTES_IN_KBYTE as i64;

/// First address handed out to classes which have no address of their own
pub const DUMMY_CLASS_ADDRESS_BASE: u64 = 0x1000_0000_8000_0000;

/// Address of the synthetic bootstrap loader when the dump has no object for it
pub const BOOT_LOADER_ADDRESS: u64 = 0;

/// Total units reported to the progress listener for a build
pub const WORK_COUNT: usize = 100_000;
/// Objects processed between two cancellation polls
pub const WORK_OBJECTS_STEP: usize = 10_000;

/// Messages of one kind printed before further ones are only counted
pub const DEFAULT_ERROR_COUNT: i32 = 20;
pub const DEBUG_ERROR_COUNT: i32 = 200;

pub const THREAD_STATE_ALIVE: u32 = 0x1;

pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_NATIVE: u32 = 0x0100;
pub const ACC_INTERFACE: u32 = 0x0200;
