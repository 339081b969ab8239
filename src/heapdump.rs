mod generated_src {
    include!(concat!(env!("OUT_DIR"), "/heapdump.generated_src.rs"));
}
use crate::provider::*;
use anyhow::Result;
use prost::Message;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

pub use generated_src::*;

impl HeapDump {
    pub fn from_binpb_zst(p: impl AsRef<Path>) -> Result<HeapDump> {
        let file = File::open(p)?;
        let mut reader = zstd::Decoder::new(file)?;
        let mut buf = vec![];
        reader.read_to_end(&mut buf)?;
        Ok(HeapDump::decode(buf.as_slice())?)
    }

    pub fn from_binpb(p: impl AsRef<Path>) -> Result<HeapDump> {
        let mut file = File::open(p)?;
        let mut buf = vec![];
        file.read_to_end(&mut buf)?;
        Ok(HeapDump::decode(buf.as_slice())?)
    }

    pub fn from_path(p: impl AsRef<Path>) -> Result<HeapDump> {
        let p = p.as_ref();
        if p.extension().map_or(false, |e| e == "zst") {
            Self::from_binpb_zst(p)
        } else {
            Self::from_binpb(p)
        }
    }
}

impl From<&Corruption> for CorruptMarker {
    fn from(c: &Corruption) -> Self {
        CorruptMarker {
            address: c.address,
            description: c.description.clone(),
        }
    }
}

fn checked<T>(corrupt: &Option<Corruption>, f: impl FnOnce() -> T) -> Result<T, CorruptMarker> {
    match corrupt {
        Some(c) => Err(c.into()),
        None => Ok(f()),
    }
}

fn section_of(s: &MemorySection) -> Result<Section, CorruptMarker> {
    checked(&s.corrupt, || Section {
        base: s.base,
        size: s.size,
    })
}

fn sections(list: &[MemorySection]) -> Entries<'_, Section> {
    Box::new(list.iter().map(section_of))
}

struct SpaceView {
    name: String,
    corrupt: Option<Corruption>,
    processes: Vec<ProcessView>,
}

struct ProcessView {
    id: Option<String>,
    pointer_bits: u32,
    corrupt: Option<Corruption>,
    runtimes: Vec<RuntimeView>,
}

struct RuntimeView {
    kind: RuntimeKind,
    version: Option<String>,
    corrupt: Option<Corruption>,
    java: Option<usize>,
}

/// A dump read from the protobuf format, served through [`DumpImage`].
pub struct ProtoImage {
    creation_time: Option<u64>,
    spaces: Vec<SpaceView>,
    runtimes: Vec<ProtoRuntime>,
}

impl ProtoImage {
    pub fn open(p: impl AsRef<Path>) -> Result<ProtoImage> {
        let p = p.as_ref();
        let dump = HeapDump::from_path(p)?;
        info!(
            "Loaded {} with {} address spaces",
            p.display(),
            dump.address_spaces.len()
        );
        Ok(dump.into())
    }
}

impl From<HeapDump> for ProtoImage {
    fn from(dump: HeapDump) -> Self {
        let mut runtimes = vec![];
        let mut spaces = vec![];
        for space in dump.address_spaces {
            let mut memory = space.memory;
            memory.sort_by_key(|m| m.base);
            let memory = Arc::new(memory);
            let mut processes = vec![];
            for process in space.processes {
                let mut views = vec![];
                for rt in process.runtimes {
                    let kind = rt.kind();
                    let version = rt.version.clone();
                    let corrupt = rt.corrupt.clone();
                    let java = if kind == RuntimeKind::Java && corrupt.is_none() {
                        runtimes.push(ProtoRuntime::new(rt, memory.clone()));
                        Some(runtimes.len() - 1)
                    } else {
                        None
                    };
                    views.push(RuntimeView {
                        kind,
                        version,
                        corrupt,
                        java,
                    });
                }
                processes.push(ProcessView {
                    id: process.id,
                    pointer_bits: process.pointer_bits,
                    corrupt: process.corrupt,
                    runtimes: views,
                });
            }
            spaces.push(SpaceView {
                name: space.name,
                corrupt: space.corrupt,
                processes,
            });
        }
        ProtoImage {
            creation_time: dump.creation_time,
            spaces,
            runtimes,
        }
    }
}

impl DumpImage for ProtoImage {
    fn creation_time(&self) -> Option<u64> {
        self.creation_time
    }

    fn address_spaces(&self) -> Entries<'_, AddressSpaceRecord> {
        Box::new(self.spaces.iter().enumerate().map(|(index, s)| {
            checked(&s.corrupt, || AddressSpaceRecord {
                index,
                name: s.name.clone(),
            })
        }))
    }

    fn processes(&self, space: &AddressSpaceRecord) -> Entries<'_, ProcessRecord> {
        let space_index = space.index;
        let Some(s) = self.spaces.get(space_index) else {
            return Box::new(std::iter::empty());
        };
        Box::new(s.processes.iter().enumerate().map(move |(index, p)| {
            checked(&p.corrupt, || ProcessRecord {
                space: space_index,
                index,
                id: p
                    .id
                    .clone()
                    .ok_or_else(|| ProviderError::Unavailable("process id".to_string())),
                pointer_bits: match p.pointer_bits {
                    0 => Err(CorruptMarker::new("pointer size")),
                    bits => Ok(bits),
                },
            })
        }))
    }

    fn runtimes(&self, process: &ProcessRecord) -> Entries<'_, RuntimeRecord> {
        let (space, proc_index) = (process.space, process.index);
        let Some(p) = self
            .spaces
            .get(space)
            .and_then(|s| s.processes.get(proc_index))
        else {
            return Box::new(std::iter::empty());
        };
        Box::new(p.runtimes.iter().enumerate().map(move |(index, r)| {
            checked(&r.corrupt, || RuntimeRecord {
                space,
                process: proc_index,
                index,
                kind: r.kind,
                version: r
                    .version
                    .clone()
                    .ok_or_else(|| CorruptMarker::new("runtime version")),
            })
        }))
    }

    fn java_runtime(&self, runtime: &RuntimeRecord) -> Option<&dyn JavaRuntime> {
        let view = self
            .spaces
            .get(runtime.space)?
            .processes
            .get(runtime.process)?
            .runtimes
            .get(runtime.index)?;
        let rt = self.runtimes.get(view.java?)?;
        Some(rt)
    }
}

#[derive(Clone, Copy)]
enum ObjectSlot {
    Heap(usize, usize),
    Extra(usize),
}

pub struct ProtoRuntime {
    data: Runtime,
    memory: Arc<Vec<MemoryRegion>>,
    objects: HashMap<u64, ObjectSlot>,
}

impl ProtoRuntime {
    fn new(data: Runtime, memory: Arc<Vec<MemoryRegion>>) -> Self {
        let mut objects = HashMap::new();
        for (i, o) in data.extra_objects.iter().enumerate() {
            objects.insert(o.address, ObjectSlot::Extra(i));
        }
        for (h, heap) in data.heaps.iter().enumerate() {
            for (i, o) in heap.objects.iter().enumerate() {
                objects.insert(o.address, ObjectSlot::Heap(h, i));
            }
        }
        ProtoRuntime {
            data,
            memory,
            objects,
        }
    }

    fn raw_object(&self, address: u64) -> Option<&Object> {
        match *self.objects.get(&address)? {
            ObjectSlot::Heap(h, i) => self.data.heaps.get(h)?.objects.get(i),
            ObjectSlot::Extra(i) => self.data.extra_objects.get(i),
        }
    }

    fn raw_class(&self, key: ClassKey) -> Result<&Class, CorruptMarker> {
        self.data
            .classes
            .get(key.0)
            .ok_or_else(|| CorruptMarker::new(format!("no class with index {}", key.0)))
    }

    fn object_record(o: &Object) -> Result<ObjectRecord, CorruptMarker> {
        checked(&o.corrupt, || ObjectRecord {
            address: o.address,
            class: o
                .class_index
                .map(|i| ClassKey(i as usize))
                .ok_or_else(|| CorruptMarker::at(o.address, "object class")),
            size: o
                .size
                .ok_or_else(|| CorruptMarker::at(o.address, "object size")),
            array_length: o.array_length.map(|l| l as usize),
        })
    }

    fn method_record(declaring: ClassKey, m: &Method) -> Result<MethodRecord, CorruptMarker> {
        checked(&m.corrupt, || MethodRecord {
            declaring,
            name: m.name.clone(),
            signature: m
                .signature
                .clone()
                .ok_or_else(|| CorruptMarker::new(format!("signature of {}", m.name))),
            modifiers: m.modifiers,
            bytecode_sections: m.bytecode_sections.iter().map(section_of).collect(),
            compiled_sections: m.compiled_sections.iter().map(section_of).collect(),
        })
    }

    fn thread_at(&self, index: usize) -> Result<ThreadRecord, CorruptMarker> {
        let t = self
            .data
            .threads
            .get(index)
            .ok_or_else(|| CorruptMarker::new(format!("no thread with index {}", index)))?;
        checked(&t.corrupt, || ThreadRecord {
            key: ThreadKey(index),
            name: Ok(t.name.clone()),
            object: Ok(t.object),
            state: Ok(t.state),
            jni_env: Ok(t.jni_env),
            native_thread: t.native.as_ref().map(|_| index),
        })
    }

    fn target_of(&self, target: Option<&Target>) -> Result<RefTarget, ProviderError> {
        match target {
            None => Ok(RefTarget::Null),
            Some(t) if t.unavailable => Err(ProviderError::Unavailable(
                "reference target".to_string(),
            )),
            Some(Target {
                object: Some(a), ..
            }) => Ok(RefTarget::Object(*a)),
            Some(Target {
                class_index: Some(c),
                ..
            }) => Ok(RefTarget::Class(ClassKey(*c as usize))),
            Some(_) => Ok(RefTarget::Null),
        }
    }

    fn source_of(&self, source: Option<&Source>) -> Result<RootSource, ProviderError> {
        let Some(s) = source else {
            return Ok(RootSource::Unknown);
        };
        match SourceKind::from_i32(s.kind) {
            Some(SourceKind::Unknown) => Ok(RootSource::Unknown),
            Some(SourceKind::Object) => Ok(RootSource::Object(s.address)),
            Some(SourceKind::Class) => Ok(RootSource::Class(ClassKey(s.index as usize))),
            Some(SourceKind::StackFrame) => Ok(RootSource::StackFrame),
            Some(SourceKind::Thread) => Ok(RootSource::Thread(
                self.data
                    .threads
                    .get(s.index as usize)
                    .and_then(|t| t.object),
            )),
            Some(SourceKind::Runtime) => Ok(RootSource::Runtime),
            None => Err(CorruptMarker::new(format!("root source kind {}", s.kind)).into()),
        }
    }

    fn root_record(&self, r: &Root) -> Result<RootRecord, CorruptMarker> {
        checked(&r.corrupt, || RootRecord {
            kind: HeapRootKind::from_i32(r.root_type)
                .ok_or_else(|| CorruptMarker::new(format!("root type {}", r.root_type))),
            reachability: Reachability::from_i32(r.reachability)
                .ok_or_else(|| CorruptMarker::new(format!("reachability {}", r.reachability))),
            target: self.target_of(r.target.as_ref()),
            source: self.source_of(r.source.as_ref()),
            description: r.description.clone(),
        })
    }

    fn references<'a>(&'a self, refs: &'a [Reference]) -> Entries<'a, ReferenceRecord> {
        Box::new(refs.iter().map(move |r| {
            checked(&r.corrupt, || ReferenceRecord {
                target: self.target_of(r.target.as_ref()),
                kind: r.reference_type(),
                description: r.description.clone(),
            })
        }))
    }
}

/// Interprets a stored value according to the field signature. Missing
/// values read as null or zero.
fn convert_value(value: Option<&Value>, signature: &str) -> Result<FieldValue, ProviderError> {
    use value::Kind;
    let kind = value.and_then(|v| v.kind.as_ref());
    let mismatch = || {
        Err(ProviderError::Corrupt(CorruptMarker::new(format!(
            "value {:?} does not match signature {}",
            kind, signature
        ))))
    };
    let integer = match kind {
        None => 0,
        Some(Kind::Integer(i)) => *i,
        Some(Kind::Boolean(b)) => *b as i64,
        Some(Kind::Real(r)) => *r as i64,
        Some(Kind::Reference(r)) => *r as i64,
    };
    let real = match kind {
        Some(Kind::Real(r)) => *r,
        _ => integer as f64,
    };
    match signature.as_bytes().first().copied() {
        Some(b'L') | Some(b'[') => match kind {
            None | Some(Kind::Reference(0)) => Ok(FieldValue::Null),
            Some(Kind::Reference(a)) => Ok(FieldValue::Object(*a)),
            _ => mismatch(),
        },
        _ if matches!(kind, Some(Kind::Reference(_))) => mismatch(),
        Some(b'Z') => Ok(FieldValue::Boolean(integer != 0)),
        Some(b'B') => Ok(FieldValue::Byte(integer as i8)),
        Some(b'C') => Ok(FieldValue::Char(integer as u16)),
        Some(b'S') => Ok(FieldValue::Short(integer as i16)),
        Some(b'I') => Ok(FieldValue::Int(integer as i32)),
        Some(b'J') => Ok(FieldValue::Long(integer)),
        Some(b'F') => Ok(FieldValue::Float(real as f32)),
        Some(b'D') => Ok(FieldValue::Double(real)),
        _ => mismatch(),
    }
}

impl JavaRuntime for ProtoRuntime {
    fn version(&self) -> Result<String, CorruptMarker> {
        self.data
            .version
            .clone()
            .ok_or_else(|| CorruptMarker::new("runtime version"))
    }

    fn full_version(&self) -> Result<String, CorruptMarker> {
        self.data
            .full_version
            .clone()
            .ok_or_else(|| CorruptMarker::new("runtime full version"))
    }

    fn heaps(&self) -> Entries<'_, HeapRecord> {
        Box::new(self.data.heaps.iter().enumerate().map(|(index, h)| {
            checked(&h.corrupt, || HeapRecord {
                index,
                name: h.name.clone(),
            })
        }))
    }

    fn heap_sections(&self, heap: &HeapRecord) -> Entries<'_, Section> {
        match self.data.heaps.get(heap.index) {
            Some(h) => sections(&h.sections),
            None => Box::new(std::iter::empty()),
        }
    }

    fn heap_objects(&self, heap: &HeapRecord) -> Entries<'_, ObjectRecord> {
        match self.data.heaps.get(heap.index) {
            Some(h) => Box::new(h.objects.iter().map(Self::object_record)),
            None => Box::new(std::iter::empty()),
        }
    }

    fn object(&self, address: u64) -> Result<ObjectRecord, CorruptMarker> {
        let o = self
            .raw_object(address)
            .ok_or_else(|| CorruptMarker::at(address, "no object at address"))?;
        Self::object_record(o)
    }

    fn class_loaders(&self) -> Entries<'_, LoaderRecord> {
        Box::new(self.data.loaders.iter().enumerate().map(|(i, l)| {
            checked(&l.corrupt, || LoaderRecord {
                key: LoaderKey(i),
                object: Ok(l.object),
            })
        }))
    }

    fn defined_classes(&self, loader: &LoaderRecord) -> Entries<'_, ClassKey> {
        match self.data.loaders.get(loader.key.0) {
            Some(l) => Box::new(
                l.defined_classes
                    .iter()
                    .map(|&i| Ok(ClassKey(i as usize))),
            ),
            None => Box::new(std::iter::empty()),
        }
    }

    fn cached_classes(&self, loader: &LoaderRecord) -> Entries<'_, ClassKey> {
        match self.data.loaders.get(loader.key.0) {
            Some(l) => Box::new(l.cached_classes.iter().map(|&i| Ok(ClassKey(i as usize)))),
            None => Box::new(std::iter::empty()),
        }
    }

    fn class(&self, key: ClassKey) -> Result<ClassRecord, CorruptMarker> {
        let c = self.raw_class(key)?;
        checked(&c.corrupt, || ClassRecord {
            key,
            id: c.id,
            object: Ok(c.object),
            name: c
                .name
                .clone()
                .ok_or_else(|| CorruptMarker::new(format!("name of class {}", key.0))),
            superclass: if c.corrupt_superclass {
                Err(CorruptMarker::new(format!("superclass of class {}", key.0)))
            } else {
                Ok(c.superclass.map(|i| ClassKey(i as usize)))
            },
            loader: if c.corrupt_loader {
                Err(CorruptMarker::new(format!("loader of class {}", key.0)))
            } else {
                Ok(c.loader.map(|i| LoaderKey(i as usize)))
            },
            component_type: c.component_type.map(|i| ClassKey(i as usize)),
            is_array: c.is_array,
            modifiers: c.modifiers,
        })
    }

    fn declared_fields(&self, class: &ClassRecord) -> Entries<'_, FieldRecord> {
        let declaring = class.key;
        match self.raw_class(declaring) {
            Ok(c) => Box::new(c.fields.iter().enumerate().map(move |(index, f)| {
                checked(&f.corrupt, || FieldRecord {
                    declaring,
                    index,
                    name: f.name.clone(),
                    signature: f.signature.clone(),
                    modifiers: f.modifiers,
                })
            })),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn declared_methods(&self, class: &ClassRecord) -> Entries<'_, MethodRecord> {
        let declaring = class.key;
        match self.raw_class(declaring) {
            Ok(c) => Box::new(
                c.methods
                    .iter()
                    .map(move |m| Self::method_record(declaring, m)),
            ),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn constant_pool(&self, class: &ClassRecord) -> Entries<'_, PoolEntry> {
        match self.raw_class(class.key) {
            Ok(c) => Box::new(c.constant_pool.iter().map(|p| match (p.object, p.class_index) {
                (Some(a), _) => Ok(PoolEntry::Object(a)),
                (None, Some(i)) => Ok(PoolEntry::Class(ClassKey(i as usize))),
                (None, None) => Err(CorruptMarker::new("empty constant pool entry")),
            })),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn field_value(
        &self,
        object: Option<&ObjectRecord>,
        field: &FieldRecord,
    ) -> Result<FieldValue, ProviderError> {
        match object {
            None => {
                let decl = self
                    .raw_class(field.declaring)?
                    .fields
                    .get(field.index)
                    .ok_or_else(|| CorruptMarker::new(format!("field {}", field.name)))?;
                convert_value(decl.static_value.as_ref(), &field.signature)
            }
            Some(o) => {
                let raw = self
                    .raw_object(o.address)
                    .ok_or_else(|| CorruptMarker::at(o.address, "no object at address"))?;
                let slot = raw.fields.iter().find(|s| {
                    s.class_index as usize == field.declaring.0 && s.name == field.name
                });
                convert_value(slot.and_then(|s| s.value.as_ref()), &field.signature)
            }
        }
    }

    fn array_elements(
        &self,
        array: &ObjectRecord,
        offset: usize,
        count: usize,
    ) -> Result<Vec<Option<u64>>, ProviderError> {
        let raw = self
            .raw_object(array.address)
            .ok_or_else(|| CorruptMarker::at(array.address, "no object at address"))?;
        let readable = raw
            .readable_elements
            .map_or(raw.elements.len(), |r| r as usize);
        let end = offset + count;
        match raw.elements.get(offset..end) {
            Some(elements) if end <= readable => {
                Ok(elements.iter().map(|&e| (e != 0).then_some(e)).collect())
            }
            _ => Err(CorruptMarker::at(
                array.address,
                format!("array elements {}..{} unreadable", offset, end),
            )
            .into()),
        }
    }

    fn object_references(
        &self,
        object: &ObjectRecord,
    ) -> Result<Entries<'_, ReferenceRecord>, ProviderError> {
        if self.data.references_unsupported {
            return Err(ProviderError::Unsupported);
        }
        let raw = self
            .raw_object(object.address)
            .ok_or_else(|| CorruptMarker::at(object.address, "no object at address"))?;
        Ok(self.references(&raw.references))
    }

    fn class_references(
        &self,
        class: &ClassRecord,
    ) -> Result<Entries<'_, ReferenceRecord>, ProviderError> {
        if self.data.references_unsupported {
            return Err(ProviderError::Unsupported);
        }
        Ok(self.references(&self.raw_class(class.key)?.references))
    }

    fn threads(&self) -> Entries<'_, ThreadRecord> {
        Box::new((0..self.data.threads.len()).map(|i| self.thread_at(i)))
    }

    fn stack_frames(&self, thread: &ThreadRecord) -> Entries<'_, FrameRecord> {
        let key = thread.key;
        let Some(t) = self.data.threads.get(key.0) else {
            return Box::new(std::iter::empty());
        };
        Box::new(t.frames.iter().enumerate().map(move |(index, f)| {
            checked(&f.corrupt, || FrameRecord {
                thread: key,
                index,
                base_pointer: f
                    .base_pointer
                    .ok_or_else(|| CorruptMarker::new("frame base pointer")),
                location: Ok(Location {
                    method: match (f.class_index, f.method_index) {
                        (Some(c), Some(m)) => self
                            .data
                            .classes
                            .get(c as usize)
                            .and_then(|cls| cls.methods.get(m as usize))
                            .ok_or_else(|| CorruptMarker::new("frame method"))
                            .and_then(|method| {
                                Self::method_record(ClassKey(c as usize), method)
                            }),
                        _ => Err(CorruptMarker::new("frame method")),
                    },
                    file_name: f
                        .file_name
                        .clone()
                        .ok_or_else(|| ProviderError::Unavailable("file name".to_string())),
                    line_number: f
                        .line_number
                        .ok_or_else(|| ProviderError::Unavailable("line number".to_string())),
                }),
            })
        }))
    }

    fn stack_sections(&self, thread: &ThreadRecord) -> Entries<'_, Section> {
        match self.data.threads.get(thread.key.0) {
            Some(t) => sections(&t.stack_sections),
            None => Box::new(std::iter::empty()),
        }
    }

    fn frame_roots(&self, frame: &FrameRecord) -> Option<Entries<'_, RootRecord>> {
        let f = self
            .data
            .threads
            .get(frame.thread.0)?
            .frames
            .get(frame.index)?;
        if f.roots_unavailable {
            return None;
        }
        Some(Box::new(f.roots.iter().map(move |r| self.root_record(r))))
    }

    fn native_frames(&self, native_thread: usize) -> Result<Entries<'_, u64>, ProviderError> {
        let native = self
            .data
            .threads
            .get(native_thread)
            .and_then(|t| t.native.as_ref())
            .ok_or_else(|| ProviderError::Unavailable("native thread".to_string()))?;
        if native.frames_unavailable {
            return Err(ProviderError::Unavailable(
                "native stack frames".to_string(),
            ));
        }
        Ok(Box::new(
            native
                .frames
                .iter()
                .map(|f| checked(&f.corrupt, || f.base_pointer)),
        ))
    }

    fn native_sections(&self, native_thread: usize) -> Entries<'_, Section> {
        match self
            .data
            .threads
            .get(native_thread)
            .and_then(|t| t.native.as_ref())
        {
            Some(n) => sections(&n.sections),
            None => Box::new(std::iter::empty()),
        }
    }

    fn monitors(&self) -> Entries<'_, MonitorRecord> {
        Box::new(self.data.monitors.iter().map(move |m| {
            checked(&m.corrupt, || MonitorRecord {
                address: m.address,
                object: m.object,
                owner: if m.corrupt_owner {
                    Err(CorruptMarker::at(m.address, "monitor owner"))
                } else {
                    m.owner.map(|i| self.thread_at(i as usize)).transpose()
                },
                enter_waiters: m
                    .enter_waiters
                    .iter()
                    .map(|&i| self.thread_at(i as usize))
                    .collect(),
                notify_waiters: m
                    .notify_waiters
                    .iter()
                    .map(|&i| self.thread_at(i as usize))
                    .collect(),
            })
        }))
    }

    fn heap_roots(&self) -> Result<Entries<'_, RootRecord>, ProviderError> {
        if self.data.roots_unsupported {
            return Err(ProviderError::Unsupported);
        }
        Ok(Box::new(
            self.data.roots.iter().map(move |r| self.root_record(r)),
        ))
    }

    fn read_pointer(&self, address: u64, pointer_size: usize) -> Result<u64, MemoryAccessError> {
        let err = MemoryAccessError { address };
        let idx = self.memory.partition_point(|m| m.base <= address);
        let region = idx
            .checked_sub(1)
            .and_then(|i| self.memory.get(i))
            .ok_or(err)?;
        let start = (address - region.base) as usize;
        let bytes = region
            .data
            .get(start..start + pointer_size)
            .ok_or(err)?;
        match pointer_size {
            4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                Ok(u32::from_le_bytes(buf) as u64)
            }
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(u64::from_le_bytes(buf))
            }
            _ => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn runtime_with_memory(memory: Vec<MemoryRegion>) -> ProtoRuntime {
        ProtoRuntime::new(Runtime::default(), Arc::new(memory))
    }

    #[test]
    fn test_read_pointer() {
        let mut data = vec![0u8; 16];
        data[8..16].copy_from_slice(&0xdead_beef_u64.to_le_bytes());
        let rt = runtime_with_memory(vec![MemoryRegion { base: 0x1000, data }]);
        assert_eq!(rt.read_pointer(0x1008, 8), Ok(0xdead_beef));
        assert_eq!(rt.read_pointer(0x1008, 4), Ok(0xdead_beef));
        assert_eq!(rt.read_pointer(0x1000, 8), Ok(0));
        // straddles the end of the region
        assert!(rt.read_pointer(0x100c, 8).is_err());
        assert!(rt.read_pointer(0xff8, 8).is_err());
    }

    #[test]
    fn test_convert_value() {
        let reference = Value {
            kind: Some(value::Kind::Reference(0x40)),
        };
        assert_eq!(
            convert_value(Some(&reference), "Ljava/lang/Object;"),
            Ok(FieldValue::Object(0x40))
        );
        assert_eq!(convert_value(None, "[I"), Ok(FieldValue::Null));
        assert_eq!(convert_value(None, "I"), Ok(FieldValue::Int(0)));
        let long = Value {
            kind: Some(value::Kind::Integer(-3)),
        };
        assert_eq!(convert_value(Some(&long), "J"), Ok(FieldValue::Long(-3)));
        assert!(convert_value(Some(&reference), "I").is_err());
    }

    #[test]
    fn test_array_elements_unreadable_tail() {
        let mut rt = Runtime::default();
        rt.extra_objects.push(Object {
            address: 0x100,
            class_index: Some(0),
            size: Some(48),
            array_length: Some(4),
            elements: vec![0x10, 0, 0x20, 0x30],
            readable_elements: Some(3),
            ..Default::default()
        });
        let rt = ProtoRuntime::new(rt, Arc::new(vec![]));
        let array = rt.object(0x100).unwrap();
        assert_eq!(
            rt.array_elements(&array, 0, 3).unwrap(),
            vec![Some(0x10), None, Some(0x20)]
        );
        assert!(rt.array_elements(&array, 2, 2).is_err());
    }

    #[test]
    fn test_from_binpb_zst() {
        let dump = HeapDump {
            creation_time: Some(1234),
            address_spaces: vec![AddressSpace {
                name: "space".to_string(),
                processes: vec![Process {
                    id: Some("42".to_string()),
                    pointer_bits: 64,
                    runtimes: vec![Runtime {
                        version: Some("17".to_string()),
                        ..Default::default()
                    }],
                    corrupt: None,
                }],
                ..Default::default()
            }],
        };
        let path = std::env::temp_dir().join(format!(
            "heap_indexer_test_{}.binpb.zst",
            std::process::id()
        ));
        {
            let file = File::create(&path).unwrap();
            let mut encoder = zstd::Encoder::new(file, 3).unwrap();
            encoder.write_all(&dump.encode_to_vec()).unwrap();
            encoder.finish().unwrap();
        }
        let image = ProtoImage::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(image.creation_time(), Some(1234));
        let spaces: Vec<_> = image.address_spaces().collect();
        assert_eq!(spaces.len(), 1);
        let space = spaces[0].as_ref().unwrap();
        let process = image.processes(space).next().unwrap().unwrap();
        assert_eq!(process.pointer_bits, Ok(64));
        let runtime = image.runtimes(&process).next().unwrap().unwrap();
        assert_eq!(runtime.kind, RuntimeKind::Java);
        let java = image.java_runtime(&runtime).unwrap();
        assert_eq!(java.version(), Ok("17".to_string()));
    }

    #[test]
    fn test_root_enums_from_generated_messages() {
        let root = Root {
            root_type: HeapRootKind::JniGlobal as i32,
            reachability: Reachability::Weak as i32,
            source: Some(Source {
                kind: SourceKind::StackFrame as i32,
                ..Default::default()
            }),
            description: "weak global".to_string(),
            ..Default::default()
        };
        let decoded = Root::decode(root.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.root_type(), HeapRootKind::JniGlobal);
        assert!(decoded.reachability().is_weak());
        assert_eq!(decoded.source.unwrap().kind(), SourceKind::StackFrame);
        assert_eq!(HeapRootKind::from_i32(11), Some(HeapRootKind::StringTable));
        assert_eq!(ReferenceKind::from_i32(9), Some(ReferenceKind::Interface));
        assert_eq!(HeapRootKind::from_i32(12), None);
    }
}
