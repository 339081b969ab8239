//! Instance sizes and outbound references of every object.

use super::class_info::is_primitive_name;
use super::{format_address, Pass, RefSubject};
use crate::constants::*;
use crate::listener::{MessageKind, Severity};
use crate::provider::*;
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// Splits `len` array elements into `(offset, count)` reads of at most
/// [`ARRAY_PIECE_SIZE`] elements.
pub fn array_chunks(len: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..len)
        .step_by(ARRAY_PIECE_SIZE)
        .map(move |offset| (offset, ARRAY_PIECE_SIZE.min(len - offset)))
}

/// `size` rounded up to the object alignment; negative sizes count as empty
pub(super) fn aligned_size(size: i64) -> i64 {
    let mask = OBJECT_ALIGNMENT as i64 - 1;
    (size.max(0) + mask) & !mask
}

impl<'a> Pass<'a> {
    pub(super) fn process_objects(&mut self) -> Result<()> {
        let rt = self.rt;
        // every loader refers to the classes it defined
        let mut loader_classes: HashMap<usize, Vec<u64>> = HashMap::new();
        for class in self.classes.values() {
            if let Some(loader) = class.loader_id {
                loader_classes.entry(loader).or_default().push(class.address);
            }
        }

        let mut count = 0usize;
        for heap in rt.heaps() {
            let Ok(heap) = heap else { continue };
            for object in rt.heap_objects(&heap) {
                count += 1;
                if count % WORK_OBJECTS_STEP == 0 {
                    self.progress(1)?;
                }
                match object {
                    Ok(o) => self.process_heap_object(&o, &loader_classes)?,
                    Err(e) => trace!("Skipping corrupt object: {}", e),
                }
            }
        }

        let missing = std::mem::take(&mut self.missing_objects);
        for object in missing.values() {
            self.process_heap_object(object, &loader_classes)?;
        }

        if !self.boot_loader_has_object {
            self.process_boot_loader(&loader_classes);
        }
        self.progress(1)
    }

    /// The dummy boot loader is an instance of its type referring to the
    /// classes it defined
    fn process_boot_loader(&mut self, loader_classes: &HashMap<usize, Vec<u64>>) {
        let Some(id) = self.ids.reverse(self.boot_loader_address) else {
            self.error("The boot loader has no identifier");
            return;
        };
        let type_id = self.boot_loader_type;
        let mut refs = vec![];
        if let Some(type_id) = type_id {
            refs.push(self.ids.get(type_id));
        }
        if let Some(classes) = loader_classes.get(&id) {
            refs.extend_from_slice(classes);
        }
        self.add_refs(&refs);
        self.log_refs(id, &refs);

        let Some(type_id) = type_id else { return };
        let size = match self.classes.get_mut(&type_id) {
            Some(class) => {
                let size = class.heap_size_per_instance.max(0);
                class.add_instance(size);
                size
            }
            None => 0,
        };
        self.sizes.set(id, size);
        self.object_to_class[id] = Some(type_id);
        debug!(
            "Boot loader {} is a dummy instance with {} references",
            format_address(self.boot_loader_address),
            refs.len()
        );
    }

    fn process_heap_object(
        &mut self,
        object: &ObjectRecord,
        loader_classes: &HashMap<usize, Vec<u64>>,
    ) -> Result<()> {
        let address = object.address;
        let Some(id) = self.ids.reverse(address) else {
            self.warning(&format!("Skipping object at {}", format_address(address)));
            return Ok(());
        };
        if self.classes.contains_key(&id) {
            return Ok(());
        }

        let known = match object.class {
            Ok(key) => {
                let class_address = self.class_address(key);
                self.ids
                    .reverse(class_address)
                    .filter(|c| self.classes.contains_key(c))
            }
            Err(_) => None,
        };
        let class_id = match known {
            Some(c) => c,
            None => match self.fallback_class(address) {
                Some(c) => {
                    let name = self.classes[&c].name.clone();
                    self.limited(MessageKind::ClassForObject, Severity::Warning, || {
                        format!(
                            "Unable to find the class of object {}, using {}",
                            format_address(address),
                            name
                        )
                    });
                    c
                }
                None => {
                    self.error(&format!(
                        "No class for object {}",
                        format_address(address)
                    ));
                    return Ok(());
                }
            },
        };
        self.object_to_class[id] = Some(class_id);

        let pointer_size = self.pointer_size as i64;
        let is_array = self.classes[&class_id].is_array_type();
        match object.size {
            Ok(size) => {
                let size = aligned_size(size);
                self.sizes.set(id, size);
                if let Some(class) = self.classes.get_mut(&class_id) {
                    if is_array {
                        class.heap_size_per_instance = pointer_size;
                    } else if class.heap_size_per_instance < 0 {
                        class.heap_size_per_instance = size;
                    }
                    class.add_instance(size);
                }
                if is_array {
                    self.array_to_size.insert(id, size);
                }
            }
            Err(ref e) => {
                let name = self.classes[&class_id].name.clone();
                self.limited(MessageKind::ObjectSize, Severity::Warning, || {
                    format!(
                        "Problem finding the size of object {} of type {}: {}",
                        format_address(address),
                        name,
                        e
                    )
                });
                if let Some(class) = self.classes.get_mut(&class_id) {
                    class.add_instance(0);
                }
            }
        }

        let mut refs = vec![self.classes[&class_id].address];
        if let Some(classes) = loader_classes.get(&id) {
            refs.extend_from_slice(classes);
        }
        if let Ok(key) = object.class {
            if known.is_some() {
                match object.array_length {
                    Some(len) => self.explore_array(object, key, len, &mut refs)?,
                    None => self.explore_object(object, key, &mut refs),
                }
            }
        }
        let mut refs = self.check_refs(RefSubject::Object(object), refs);
        self.add_thread_refs(id, &mut refs);
        self.add_refs(&refs);
        self.log_refs(id, &refs);
        Ok(())
    }

    /// Class for an object whose own class is unknown
    fn fallback_class(&self, address: u64) -> Option<usize> {
        if self.is_loader_object(address) {
            if let Some(id) = self.jlcl_id {
                return Some(id);
            }
        }
        let jlc = self.jlc_id?;
        self.classes[&jlc].super_id.or(Some(jlc))
    }

    fn is_primitive_array(&mut self, key: ClassKey) -> bool {
        let class = match self.rt.class(key) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let name = self.class_name(key);
        if name.starts_with("[[") {
            return false;
        }
        if let Some(component) = class.component_type {
            let component_name = self.class_name(component);
            if is_primitive_name(&component_name) {
                return true;
            }
        }
        let bytes = name.as_bytes();
        bytes.len() == 2 && bytes[0] == b'[' && b"ZBCSIJFD".contains(&bytes[1])
    }

    /// Reads the elements of a reference array piece by piece
    fn explore_array(
        &mut self,
        array: &ObjectRecord,
        key: ClassKey,
        len: usize,
        refs: &mut Vec<u64>,
    ) -> Result<()> {
        if self.is_primitive_array(key) {
            return Ok(());
        }
        let rt = self.rt;
        for (offset, count) in array_chunks(len) {
            self.check_cancel()?;
            let elements = match rt.array_elements(array, offset, count) {
                Ok(e) => e,
                Err(e) => {
                    self.warn_with(
                        &format!(
                            "Unable to read elements {}..{} of array {}",
                            offset,
                            offset + count,
                            format_address(array.address)
                        ),
                        &e,
                    );
                    continue;
                }
            };
            for (i, element) in elements.into_iter().enumerate() {
                let Some(target) = element else { continue };
                if self.ids.contains(target) {
                    refs.push(target);
                } else {
                    self.limited(MessageKind::ArrayElement, Severity::Warning, || {
                        format!(
                            "Element {} of array {} refers to unknown object {}",
                            offset + i,
                            format_address(array.address),
                            format_address(target)
                        )
                    });
                }
            }
        }
        Ok(())
    }

    /// Follows the reference fields declared by the class of `object` and
    /// every superclass
    fn explore_object(&mut self, object: &ObjectRecord, key: ClassKey, refs: &mut Vec<u64>) {
        let rt = self.rt;
        let mut next = Some(key);
        let mut seen = HashSet::new();
        while let Some(k) = next {
            if !seen.insert(k) {
                break;
            }
            let Ok(class) = rt.class(k) else { break };
            for field in rt.declared_fields(&class) {
                let Ok(field) = field else { continue };
                if field.is_static() || !field.is_reference() {
                    continue;
                }
                match rt.field_value(Some(object), &field) {
                    Ok(FieldValue::Object(target)) => {
                        if self.ids.contains(target) {
                            refs.push(target);
                        } else {
                            let address = object.address;
                            self.limited(MessageKind::FieldReference, Severity::Warning, || {
                                format!(
                                    "Field {} of object {} refers to unknown object {}",
                                    field.name,
                                    format_address(address),
                                    format_address(target)
                                )
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => self.warn_with(
                        &format!(
                            "Unable to read field {} of object {}",
                            field.name,
                            format_address(object.address)
                        ),
                        &e,
                    ),
                }
            }
            next = self.superclass(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::IndexPolicy;
    use super::*;
    use crate::listener::RecordingListener;

    const BIG_ARRAY: u64 = 0x2600;
    const FIRST: u64 = 0x2700;
    const MIDDLE: u64 = 0x2720;
    const LAST: u64 = 0x2740;

    fn big_array(len: usize, readable: Option<u64>) -> DumpBuilder {
        let mut b = DumpBuilder::small_heap();
        for address in [FIRST, MIDDLE, LAST] {
            b.add_object(address, STRING_CLASS, 24);
        }
        let mut elements = vec![0u64; len];
        elements[0] = FIRST;
        elements[150_000] = MIDDLE;
        elements[len - 1] = LAST;
        let array = b.add_object(BIG_ARRAY, OBJECT_ARRAY_CLASS, 16 + 8 * len as i64);
        array.array_length = Some(len as u64);
        array.elements = elements;
        array.readable_elements = readable;
        b
    }

    #[test]
    fn test_array_chunks() {
        let chunks: Vec<_> = array_chunks(250_000).collect();
        assert_eq!(chunks, vec![(0, 100_000), (100_000, 100_000), (200_000, 50_000)]);
        assert_eq!(array_chunks(0).count(), 0);
        assert_eq!(array_chunks(100_000).collect::<Vec<_>>(), vec![(0, 100_000)]);
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(17), 24);
        assert_eq!(aligned_size(24), 24);
        assert_eq!(aligned_size(-5), 0);
    }

    #[test]
    fn test_large_array_is_read_in_pieces() {
        let mut listener = RecordingListener::default();
        let index = build_index(big_array(250_000, None), IndexPolicy::default(), &mut listener);
        let ids = &index.identifiers;
        let array = ids.reverse(BIG_ARRAY).unwrap();
        for target in [FIRST, MIDDLE, LAST] {
            assert!(index.outbound[array].contains(&ids.reverse(target).unwrap()));
        }
        assert_eq!(index.array_to_size[&array], 16 + 8 * 250_000);
        let class = &index.classes[&index.object_to_class[array].unwrap()];
        assert_eq!(class.heap_size_per_instance, 8);
    }

    #[test]
    fn test_unreadable_array_piece() {
        let mut listener = RecordingListener::default();
        let index = build_index(
            big_array(250_000, Some(120_000)),
            IndexPolicy::default(),
            &mut listener,
        );
        let ids = &index.identifiers;
        let refs = &index.outbound[ids.reverse(BIG_ARRAY).unwrap()];
        assert!(refs.contains(&ids.reverse(FIRST).unwrap()));
        assert!(!refs.contains(&ids.reverse(MIDDLE).unwrap()));
        assert!(!refs.contains(&ids.reverse(LAST).unwrap()));
        assert!(listener.contains("Unable to read elements 100000..200000 of array 0x2600"));
        assert!(listener.contains("Unable to read elements 200000..250000 of array 0x2600"));
    }

    #[test]
    fn test_corrupt_class_falls_back() {
        const LOST: u64 = 0x2500;
        let mut b = DumpBuilder::small_heap();
        b.add_object(LOST, HOLDER_CLASS, 24).class_index = None;
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let id = index.identifiers.reverse(LOST).unwrap();
        let class = &index.classes[&index.object_to_class[id].unwrap()];
        assert_eq!(class.name, "java.lang.Object");
        assert!(listener.contains("Unable to find the class of object 0x2500"));
        assert_eq!(super::super::validate(&index, |_| {}), 0);
    }

    #[test]
    fn test_unknown_field_target_is_dropped() {
        let mut b = DumpBuilder::small_heap();
        let holder = b
            .runtime()
            .heaps[0]
            .objects
            .iter_mut()
            .find(|o| o.address == HOLDER)
            .unwrap();
        holder.fields[0].value = reference(0x7777_0000);
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let ids = &index.identifiers;
        let refs = &index.outbound[ids.reverse(HOLDER).unwrap()];
        assert_eq!(refs, &vec![ids.reverse(class_address(HOLDER_CLASS)).unwrap()]);
        assert!(listener.contains("Field target of object 0x2000 refers to unknown object"));
    }

    #[test]
    fn test_primitive_arrays_are_not_read() {
        let mut b = DumpBuilder::small_heap();
        let ints = b.add_class("[I", Some(OBJECT_CLASS));
        b.class(ints).is_array = true;
        let bytes = b.add_object(0x2800, ints, 32);
        bytes.array_length = Some(4);
        // garbage which would be unknown targets if read as references
        bytes.elements = vec![1, 2, 3, 4];
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let ids = &index.identifiers;
        assert_eq!(index.outbound[ids.reverse(0x2800).unwrap()].len(), 1);
        assert!(!listener.contains("refers to unknown object"));
    }
}
