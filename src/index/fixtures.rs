//! Small hand-built dumps shared by the index tests.

use super::*;
use crate::cache::{ImageCache, SharedImage};
use crate::heapdump::*;
use crate::listener::RecordingListener;
use std::sync::Arc;

pub(crate) const OBJECT_CLASS: u32 = 0;
pub(crate) const CLASS_CLASS: u32 = 1;
pub(crate) const LOADER_CLASS: u32 = 2;
pub(crate) const STRING_CLASS: u32 = 3;
pub(crate) const HOLDER_CLASS: u32 = 4;
pub(crate) const OBJECT_ARRAY_CLASS: u32 = 5;
pub(crate) const THREAD_CLASS: u32 = 6;
pub(crate) const MAIN_CLASS: u32 = 7;

pub(crate) const CLASS_OBJECT_SIZE: i64 = 48;

pub(crate) const HOLDER: u64 = 0x2000;
pub(crate) const TARGET: u64 = 0x2100;
pub(crate) const ARRAY: u64 = 0x2200;
pub(crate) const THREAD_OBJECT: u64 = 0x2300;
/// Only reachable from the stack of the thread in [`DumpBuilder::one_thread`]
pub(crate) const LOCAL_ONLY: u64 = 0x2400;

pub(crate) const STACK_BASE: u64 = 0x8000;
pub(crate) const STACK_SIZE: usize = 0x100;
/// Offset into the stack at which [`LOCAL_ONLY`] is stored
pub(crate) const LOCAL_SLOT: u64 = 0x48;

pub(crate) fn class_address(index: u32) -> u64 {
    0x1000 + index as u64 * 0x100
}

pub(crate) fn reference(address: u64) -> Option<Value> {
    Some(Value {
        kind: Some(value::Kind::Reference(address)),
    })
}

pub(crate) struct DumpBuilder {
    pub(crate) dump: HeapDump,
}

impl DumpBuilder {
    /// One 64 bit process with one Java runtime, a bootstrap loader without
    /// an object and the classes every runtime has
    pub(crate) fn new() -> Self {
        let runtime = Runtime {
            kind: RuntimeKind::Java as i32,
            version: Some("1.8.0".to_string()),
            full_version: Some("1.8.0_292-b10".to_string()),
            heaps: vec![Heap {
                name: "default".to_string(),
                sections: vec![MemorySection {
                    base: 0x1000,
                    size: 0x2000,
                    corrupt: None,
                }],
                ..Default::default()
            }],
            loaders: vec![ClassLoader::default()],
            references_unsupported: true,
            roots_unsupported: true,
            ..Default::default()
        };
        let mut builder = DumpBuilder {
            dump: HeapDump {
                creation_time: Some(1_700_000_000_000),
                address_spaces: vec![AddressSpace {
                    name: "fixture".to_string(),
                    processes: vec![Process {
                        id: Some("1".to_string()),
                        pointer_bits: 64,
                        runtimes: vec![runtime],
                        corrupt: None,
                    }],
                    ..Default::default()
                }],
            },
        };
        builder.add_class("java/lang/Object", None);
        builder.add_class("java/lang/Class", Some(OBJECT_CLASS));
        builder.add_class("java/lang/ClassLoader", Some(OBJECT_CLASS));
        builder.add_class("java/lang/String", Some(OBJECT_CLASS));
        builder
    }

    /// A holder with a field pointing at a string, and an object array
    /// holding the same string
    pub(crate) fn small_heap() -> Self {
        let mut b = Self::new();
        let holder = b.add_class("demo/Holder", Some(OBJECT_CLASS));
        b.class(holder).fields.push(FieldDecl {
            name: "target".to_string(),
            signature: "Ljava/lang/Object;".to_string(),
            ..Default::default()
        });
        let array = b.add_class("[Ljava/lang/Object;", Some(OBJECT_CLASS));
        let array_class = b.class(array);
        array_class.is_array = true;
        array_class.component_type = Some(OBJECT_CLASS);

        b.add_object(HOLDER, holder, 24).fields.push(FieldSlot {
            class_index: holder,
            name: "target".to_string(),
            value: reference(TARGET),
        });
        b.add_object(TARGET, STRING_CLASS, 24);
        let elements = b.add_object(ARRAY, array, 32);
        elements.array_length = Some(2);
        elements.elements = vec![TARGET, 0];
        b
    }

    /// [`DumpBuilder::small_heap`] plus a live thread whose first frame holds
    /// [`LOCAL_ONLY`]. With `with_roots` the frame reports it as a root;
    /// otherwise the dump has no root information at all.
    pub(crate) fn one_thread(with_roots: bool) -> Self {
        let mut b = Self::small_heap();
        let thread_class = b.add_class("java/lang/Thread", Some(OBJECT_CLASS));
        let main = b.add_class("demo/Main", Some(OBJECT_CLASS));
        b.class(main).methods = vec![
            Method {
                name: "run".to_string(),
                signature: Some("()V".to_string()),
                bytecode_sections: vec![MemorySection {
                    base: 0x9000,
                    size: 32,
                    corrupt: None,
                }],
                ..Default::default()
            },
            Method {
                name: "main".to_string(),
                signature: Some("([Ljava/lang/String;)V".to_string()),
                modifiers: ACC_STATIC,
                ..Default::default()
            },
        ];
        b.add_object(THREAD_OBJECT, thread_class, 40);
        b.add_object(LOCAL_ONLY, STRING_CLASS, 24);

        let mut stack = vec![0u8; STACK_SIZE];
        let slot = LOCAL_SLOT as usize;
        stack[slot..slot + 8].copy_from_slice(&LOCAL_ONLY.to_le_bytes());
        b.dump.address_spaces[0].memory.push(MemoryRegion {
            base: STACK_BASE,
            data: stack,
        });

        let local_root = Root {
            root_type: HeapRootKind::StackLocal as i32,
            reachability: Reachability::Strong as i32,
            target: Some(Target {
                object: Some(LOCAL_ONLY),
                ..Default::default()
            }),
            source: Some(Source {
                kind: SourceKind::StackFrame as i32,
                ..Default::default()
            }),
            description: "stack local".to_string(),
            corrupt: None,
        };
        let thread = Thread {
            name: "main".to_string(),
            object: Some(THREAD_OBJECT),
            state: THREAD_STATE_ALIVE,
            jni_env: 0x7000,
            frames: vec![
                Frame {
                    base_pointer: Some(STACK_BASE + 0x40),
                    class_index: Some(main),
                    method_index: Some(0),
                    file_name: Some("Main.java".to_string()),
                    line_number: Some(12),
                    roots: if with_roots { vec![local_root] } else { vec![] },
                    roots_unavailable: !with_roots,
                    corrupt: None,
                },
                Frame {
                    base_pointer: Some(STACK_BASE + 0x80),
                    class_index: Some(main),
                    method_index: Some(1),
                    roots_unavailable: !with_roots,
                    ..Default::default()
                },
            ],
            stack_sections: vec![MemorySection {
                base: STACK_BASE,
                size: STACK_SIZE as i64,
                corrupt: None,
            }],
            ..Default::default()
        };
        let rt = b.runtime();
        rt.threads.push(thread);
        rt.roots_unsupported = !with_roots;
        b
    }

    pub(crate) fn runtime(&mut self) -> &mut Runtime {
        &mut self.dump.address_spaces[0].processes[0].runtimes[0]
    }

    pub(crate) fn class(&mut self, index: u32) -> &mut Class {
        &mut self.runtime().classes[index as usize]
    }

    /// Adds a class defined by the bootstrap loader, with its class object
    /// on the heap at [`class_address`]
    pub(crate) fn add_class(&mut self, name: &str, superclass: Option<u32>) -> u32 {
        let rt = self.runtime();
        let index = rt.classes.len() as u32;
        let address = class_address(index);
        rt.classes.push(Class {
            object: Some(address),
            name: Some(name.to_string()),
            superclass,
            loader: Some(0),
            ..Default::default()
        });
        rt.loaders[0].defined_classes.push(index);
        rt.heaps[0].objects.push(Object {
            address,
            class_index: Some(CLASS_CLASS),
            size: Some(CLASS_OBJECT_SIZE),
            ..Default::default()
        });
        index
    }

    pub(crate) fn add_object(&mut self, address: u64, class: u32, size: i64) -> &mut Object {
        let objects = &mut self.runtime().heaps[0].objects;
        objects.push(Object {
            address,
            class_index: Some(class),
            size: Some(size),
            ..Default::default()
        });
        let last = objects.len() - 1;
        &mut objects[last]
    }

    pub(crate) fn image(self) -> ProtoImage {
        ProtoImage::from(self.dump)
    }
}

/// The Java runtime of a fixture image
pub(crate) fn java_runtime(image: &ProtoImage) -> &dyn JavaRuntime {
    let space = image.address_spaces().next().unwrap().unwrap();
    let process = image.processes(&space).next().unwrap().unwrap();
    let runtime = image.runtimes(&process).next().unwrap().unwrap();
    image.java_runtime(&runtime).unwrap()
}

/// An initialised [`IndexBuilder`] whose cache always hands out `dump`
pub(crate) fn builder_for(dump: DumpBuilder, policy: IndexPolicy, prefix: &str) -> IndexBuilder {
    let image: SharedImage = Arc::new(dump.image());
    let cache = ImageCache::with_loader(1, Box::new(move |_: &Path| Ok(image.clone()))).shared();
    let mut builder = IndexBuilder::new(cache, policy);
    builder.init("fixture.binpb", prefix);
    builder
}

/// Runs a complete build of `dump` through an [`IndexBuilder`]
pub(crate) fn build(
    dump: DumpBuilder,
    policy: IndexPolicy,
    sink: &mut dyn IndexSink,
    listener: &mut RecordingListener,
) -> Result<()> {
    builder_for(dump, policy, "").fill(sink, listener)
}

/// [`DumpBuilder::one_thread`] with dump roots, plus a JNI global root on
/// [`HOLDER`] so the dump's roots are trusted
pub(crate) fn one_thread_with_global_root() -> DumpBuilder {
    let mut b = DumpBuilder::one_thread(true);
    b.runtime().roots.push(Root {
        root_type: HeapRootKind::JniGlobal as i32,
        reachability: Reachability::Strong as i32,
        target: Some(Target {
            object: Some(HOLDER),
            ..Default::default()
        }),
        description: "global".to_string(),
        ..Default::default()
    });
    b
}

/// Builds and returns the index, panicking on failure
pub(crate) fn build_index(
    dump: DumpBuilder,
    policy: IndexPolicy,
    listener: &mut RecordingListener,
) -> PreliminaryIndex {
    let mut sink = CollectingSink::default();
    build(dump, policy, &mut sink, listener).unwrap();
    sink.index.unwrap()
}

/// Hands a fresh [`Pass`] over `dump` to `f`, for tests of single phases
pub(crate) fn with_pass<R>(
    dump: DumpBuilder,
    policy: &IndexPolicy,
    listener: &mut RecordingListener,
    f: impl FnOnce(&mut Pass<'_>) -> R,
) -> R {
    let image = dump.image();
    let rt = java_runtime(&image);
    let mut pass = Pass::new(rt, listener, policy, 8, None);
    f(&mut pass)
}
