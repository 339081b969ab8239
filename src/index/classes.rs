//! Identifier discovery and class metadata.

use super::class_info::is_primitive_name;
use super::objects::aligned_size;
use super::{display_name, format_address, ClassInfo, FieldDescriptor, FieldType, Pass};
use super::{RefSubject, SizeTable, StaticField};
use crate::constants::*;
use crate::listener::{MessageKind, Severity};
use crate::provider::*;
use anyhow::{anyhow, Result};
use fixedbitset::FixedBitSet;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Longest component chain followed for nested array types
const MAX_ARRAY_DEPTH: usize = 255;

type BootStrategy<'a> = fn(&mut Pass<'a>) -> Option<LoaderKey>;

impl<'a> Pass<'a> {
    /// Collects the address of every object, class and loader into the
    /// identifier table and sorts it.
    pub(super) fn discover_identifiers(&mut self) -> Result<()> {
        let rt = self.rt;
        let mut last = 0u64;
        for heap in rt.heaps() {
            let heap = match heap {
                Ok(h) => h,
                Err(e) => {
                    self.warn_with("Corrupt heap", &e);
                    continue;
                }
            };
            for section in rt.heap_sections(&heap) {
                match section {
                    Ok(s) => last = last.max(s.end()),
                    Err(e) => self.warn_with(&format!("Corrupt section in heap {}", heap.name), &e),
                }
            }
        }
        if last != 0 {
            self.next_class_address = (last + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1);
        }

        self.listener.sub_task("Finding class loaders");
        self.find_loaders();
        let loaders: Vec<LoaderRecord> = self.loaders.values().cloned().collect();
        for loader in &loaders {
            for class in rt.defined_classes(loader) {
                match class {
                    Ok(key) => {
                        self.defined_by.entry(key).or_insert(loader.key);
                        self.add_class_key(key);
                    }
                    Err(e) => self.warn_with(
                        &format!("Corrupt class defined by loader {}", loader.key.0),
                        &e,
                    ),
                }
            }
        }
        self.find_boot_loader();
        self.progress(1)?;

        self.listener.sub_task("Finding objects");
        let mut count = 0usize;
        for heap in rt.heaps() {
            let Ok(heap) = heap else { continue };
            for object in rt.heap_objects(&heap) {
                count += 1;
                if count % WORK_OBJECTS_STEP == 0 {
                    self.progress(1)?;
                }
                match object {
                    Ok(o) => self.remember_object(&o),
                    Err(e) => self.warn_with(&format!("Corrupt object in heap {}", heap.name), &e),
                }
            }
        }
        debug!("Objects on heap {}", count);

        self.listener.sub_task("Finding classes cached by class loaders");
        for loader in &loaders {
            self.check_cancel()?;
            for class in rt.cached_classes(loader) {
                let key = match class {
                    Ok(k) => k,
                    Err(e) => {
                        self.warn_with(
                            &format!("Corrupt class cached by loader {}", loader.key.0),
                            &e,
                        );
                        continue;
                    }
                };
                let address = self.class_address(key);
                if !self.all_classes.contains_key(&address) {
                    let name = self.class_name(key);
                    self.info(&format!("Adding extra class {} via the cached list", name));
                    self.all_classes.insert(address, key);
                }
            }
        }
        self.ids.sort();
        self.progress(1)?;

        self.listener.sub_task("Finding objects missing from the heap");
        self.find_missing_objects();
        let missing = std::mem::take(&mut self.missing_objects);
        for object in missing.values() {
            self.remember_object(object);
        }
        self.missing_objects = missing;
        self.ids.sort();
        self.progress(1)?;

        // Class objects are usually on the heap already; classes without
        // one still need an identifier
        let classes: Vec<(u64, ClassKey)> = self.all_classes.iter().map(|(&a, &k)| (a, k)).collect();
        let mut extra = vec![];
        for (address, key) in classes {
            if self.jlcl.is_none() && self.class_name(key) == "java/lang/ClassLoader" {
                self.jlcl = Some(key);
            }
            if self.ids.contains(address) {
                trace!("Class at {} already has an identifier", format_address(address));
            } else {
                extra.push(address);
            }
        }
        for address in extra {
            self.ids.add(address);
        }
        self.ids.sort();

        let len = self.ids.len();
        let classes = self.all_classes.len();
        self.message(
            Severity::Info,
            &format!(
                "Found {} identifiers, {} objects and {} classes",
                len,
                len.saturating_sub(classes),
                classes
            ),
            None,
        );
        self.object_to_class = vec![None; len];
        self.sizes = SizeTable::new(len);
        self.outbound = vec![None; len];
        self.refd = FixedBitSet::with_capacity(len);
        self.check_cancel()
    }

    fn find_loaders(&mut self) {
        let rt = self.rt;
        for loader in rt.class_loaders() {
            let loader = match loader {
                Ok(l) => l,
                Err(e) => {
                    self.warn_with("Corrupt class loader", &e);
                    continue;
                }
            };
            match &loader.object {
                Ok(Some(address)) => {
                    self.loader_objects.insert(*address, loader.key);
                    match rt.object(*address).and_then(|o| o.class) {
                        Ok(k) => {
                            self.loader_types.insert(k);
                        }
                        Err(e) => self.message(
                            Severity::Error,
                            &format!(
                                "Problem finding the type of class loader {}",
                                format_address(*address)
                            ),
                            Some(&e),
                        ),
                    }
                }
                Ok(None) => debug!("Class loader {} has no object", loader.key.0),
                Err(e) => self.message(
                    Severity::Error,
                    &format!("Problem finding class loader information for {}", loader.key.0),
                    Some(e),
                ),
            }
            self.loaders.insert(loader.key, loader);
        }
    }

    /// Tries each way of spotting the bootstrap loader in turn; without one
    /// a dummy loader is placed at [`BOOT_LOADER_ADDRESS`]
    fn find_boot_loader(&mut self) {
        let strategies: [(&str, BootStrategy<'a>); 4] = [
            ("without an object", Self::boot_without_object),
            ("of type *System*", Self::boot_of_system_type),
            ("which loaded itself", Self::boot_loaded_itself),
            ("found first", Self::boot_found_first),
        ];
        let found = strategies
            .iter()
            .find_map(|(how, strategy)| strategy(self).map(|key| (*how, key)));
        match found {
            Some((how, key)) => {
                self.boot_loader = Some(key);
                match self.loaders.get(&key).map(|l| &l.object) {
                    Some(Ok(Some(address))) => {
                        self.boot_loader_address = *address;
                        self.boot_loader_has_object = true;
                    }
                    _ => {
                        self.boot_loader_address = BOOT_LOADER_ADDRESS;
                        self.ids.add(BOOT_LOADER_ADDRESS);
                    }
                }
                debug!(
                    "Boot loader {} at {} is the loader {}",
                    key.0,
                    format_address(self.boot_loader_address),
                    how
                );
            }
            None => {
                self.boot_loader_address = BOOT_LOADER_ADDRESS;
                self.ids.add(BOOT_LOADER_ADDRESS);
                self.info(&format!(
                    "No boot class loader found, using a dummy loader at {}",
                    format_address(BOOT_LOADER_ADDRESS)
                ));
            }
        }
    }

    fn loaders_with_objects(&self) -> Vec<(LoaderKey, u64)> {
        self.loaders
            .values()
            .filter_map(|l| match l.object {
                Ok(Some(a)) => Some((l.key, a)),
                _ => None,
            })
            .collect()
    }

    fn boot_without_object(&mut self) -> Option<LoaderKey> {
        self.loaders
            .values()
            .find(|l| matches!(l.object, Ok(None)))
            .map(|l| l.key)
    }

    fn boot_of_system_type(&mut self) -> Option<LoaderKey> {
        let rt = self.rt;
        self.loaders_with_objects().into_iter().find_map(|(key, address)| {
            let type_key = rt.object(address).and_then(|o| o.class).ok()?;
            let name = rt.class(type_key).and_then(|c| c.name).ok()?;
            (name == "*System*").then_some(key)
        })
    }

    fn boot_loaded_itself(&mut self) -> Option<LoaderKey> {
        for (key, address) in self.loaders_with_objects() {
            let Ok(type_key) = self.rt.object(address).and_then(|o| o.class) else {
                continue;
            };
            if let Ok(Some(loader)) = self.class_loader(type_key) {
                if loader == key {
                    return Some(key);
                }
            }
        }
        None
    }

    fn boot_found_first(&mut self) -> Option<LoaderKey> {
        self.loaders_with_objects().first().map(|&(key, _)| key)
    }

    /// Adds `key` to the classes to build, returning whether it was new
    fn add_class_key(&mut self, key: ClassKey) -> bool {
        let address = self.class_address(key);
        match self.all_classes.entry(address) {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(key);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Gives `object` an identifier and makes sure its class, and every
    /// component class of an array, will be built
    fn remember_object(&mut self, object: &ObjectRecord) {
        self.ids.add(object.address);
        let mut key = match &object.class {
            Ok(k) => *k,
            Err(e) => {
                let address = object.address;
                self.limited(MessageKind::ClassForObject, Severity::Warning, || {
                    format!(
                        "Problem finding classes for object {}: {}",
                        format_address(address),
                        e
                    )
                });
                return;
            }
        };
        for _ in 0..MAX_ARRAY_DEPTH {
            if self.add_class_key(key) && self.policy.debug_info {
                debug!("Adding extra class {}", self.class_name(key));
            }
            match self.rt.class(key) {
                Ok(c) if c.is_array => match c.component_type {
                    Some(component) => key = component,
                    None => break,
                },
                Ok(_) => break,
                Err(e) => {
                    let address = object.address;
                    self.limited(MessageKind::ClassForObject, Severity::Warning, || {
                        format!(
                            "Problem finding classes for object {}: {}",
                            format_address(address),
                            e
                        )
                    });
                    break;
                }
            }
        }
    }

    /// Thread, monitor and loader objects the heaps did not list
    fn find_missing_objects(&mut self) {
        let rt = self.rt;
        let mut missing = BTreeMap::new();
        for thread in rt.threads() {
            let thread = match thread {
                Ok(t) => t,
                Err(e) => {
                    self.warn_with("Corrupt thread", &e);
                    continue;
                }
            };
            match thread.object {
                Ok(Some(address)) if !self.ids.contains(address) => {
                    self.warning(&format!(
                        "Thread object at {} not found in the heap",
                        format_address(address)
                    ));
                    missing.insert(address, self.lookup_object(address));
                }
                Ok(_) => {}
                Err(e) => {
                    let name = thread.name.clone().unwrap_or_else(|_| "<unknown>".to_string());
                    self.warn_with(
                        &format!("Problem reading Java thread information for {}", name),
                        &e,
                    );
                }
            }
        }

        for monitor in rt.monitors() {
            match monitor {
                Ok(m) => {
                    if let Some(address) = m.object {
                        if !self.ids.contains(address) && !missing.contains_key(&address) {
                            self.warning(&format!(
                                "Monitor object at {} not found in the heap",
                                format_address(address)
                            ));
                            missing.insert(address, self.lookup_object(address));
                        }
                    }
                }
                Err(e) => self.warn_with("Corrupt monitor", &e),
            }
        }

        let loader_objects: BTreeSet<u64> = self.loader_objects.keys().copied().collect();
        for address in loader_objects {
            if self.ids.contains(address) || missing.contains_key(&address) {
                continue;
            }
            let object = self.lookup_object(address);
            match object.class {
                Ok(k) => {
                    let name = self.class_name(k);
                    self.warning(&format!(
                        "Class loader object at {} of type {} not found in the heap",
                        format_address(address),
                        name
                    ));
                }
                Err(ref e) => self.warn_with(
                    &format!(
                        "Class loader object at {} not found in the heap",
                        format_address(address)
                    ),
                    e,
                ),
            }
            missing.insert(address, object);
        }
        self.missing_objects = missing;
    }

    /// The provider's view of `address`; an unreadable object keeps its
    /// address so it can still be given a fallback class
    fn lookup_object(&self, address: u64) -> ObjectRecord {
        self.rt.object(address).unwrap_or_else(|e| ObjectRecord {
            address,
            class: Err(e.clone()),
            size: Err(e),
            array_length: None,
        })
    }

    /// The loader of `key`. Arrays without a loader use the loader of their
    /// component type; failing that the loader that defined the class.
    pub(super) fn class_loader(&mut self, key: ClassKey) -> Result<Option<LoaderKey>, CorruptMarker> {
        match self.declared_loader(key) {
            Ok(Some(loader)) => Ok(Some(loader)),
            Ok(None) => Ok(self.defined_by.get(&key).copied()),
            Err(e) => match self.defined_by.get(&key) {
                Some(&loader) => Ok(Some(loader)),
                None => Err(e),
            },
        }
    }

    fn declared_loader(&mut self, key: ClassKey) -> Result<Option<LoaderKey>, CorruptMarker> {
        let mut class = self.rt.class(key)?;
        for _ in 0..MAX_ARRAY_DEPTH {
            if let Some(loader) = class.loader.clone()? {
                return Ok(Some(loader));
            }
            let component = match class.component_type {
                Some(c) if class.is_array => c,
                _ => return Ok(None),
            };
            let name = class.name.clone().unwrap_or_default();
            self.limited(MessageKind::MissingLoader, Severity::Info, || {
                format!(
                    "No class loader for {}, using the loader of its component type",
                    name
                )
            });
            class = self.rt.class(component)?;
        }
        Ok(None)
    }

    /// Address of the object of `loader`, the boot loader's for `None`
    pub(super) fn loader_address(&self, loader: Option<LoaderKey>) -> u64 {
        match loader.and_then(|k| self.loaders.get(&k)).map(|l| &l.object) {
            Some(Ok(Some(address))) => *address,
            _ => self.boot_loader_address,
        }
    }

    /// The address identifying a class: its object, else the provider's id
    /// for it, else a dummy address allocated once per class
    pub(super) fn class_address(&mut self, key: ClassKey) -> u64 {
        if let Some(&address) = self.class_addresses.get(&key) {
            return address;
        }
        let record = self.rt.class(key);
        let found = match &record {
            Ok(c) => match c.object {
                Ok(Some(a)) => Some(a),
                _ => c.id,
            },
            Err(_) => None,
        };
        let address = match found {
            Some(a) => a,
            None => {
                let address = self.next_class_address;
                self.next_class_address += OBJECT_ALIGNMENT;
                let name = match record.and_then(|c| c.name) {
                    Ok(n) => n,
                    Err(_) => format!("#{}", key.0),
                };
                self.info(&format!(
                    "Class {} has no address, using {}",
                    name,
                    format_address(address)
                ));
                address
            }
        };
        self.class_addresses.insert(key, address);
        address
    }

    /// The runtime name of a class, made up from its address when the name
    /// can't be read
    pub(super) fn class_name(&mut self, key: ClassKey) -> String {
        self.class_name_at(key, 0)
    }

    fn class_name_at(&mut self, key: ClassKey, depth: usize) -> String {
        let record = self.rt.class(key);
        if let Ok(Ok(name)) = record.as_ref().map(|c| c.name.clone()) {
            return name;
        }
        let address = self.class_address(key);
        let component = match record {
            Ok(c) if c.is_array => c.component_type,
            _ => return format!("corruptClassName@{}", format_address(address)),
        };
        match component {
            Some(component) if depth < MAX_ARRAY_DEPTH => {
                let name = self.class_name_at(component, depth + 1);
                if name.starts_with('[') {
                    format!("[{}", name)
                } else {
                    format!("[L{};", name)
                }
            }
            _ => format!("[LcorruptArrayClassName@{};", format_address(address)),
        }
    }

    /// The superclass of `key`, dropping the ones interfaces and primitive
    /// types should not have and inventing one for arrays
    pub(super) fn superclass(&mut self, key: ClassKey) -> Option<ClassKey> {
        let class = match self.rt.class(key) {
            Ok(c) => c,
            Err(e) => {
                self.superclass_problem(key, &e);
                return None;
            }
        };
        let sup = match &class.superclass {
            Ok(s) => *s,
            Err(e) => {
                self.superclass_problem(key, e);
                return None;
            }
        };
        let name = class.name.clone().unwrap_or_default();
        match sup {
            None if class.is_array => {
                let object_class = match class.object {
                    Ok(Some(a)) => self.rt.object(a).and_then(|o| o.class).ok()?,
                    _ => return None,
                };
                if !matches!(self.rt.class(object_class).map(|c| c.superclass), Ok(Ok(Some(_)))) {
                    return None;
                }
                let root = self.root_of(object_class);
                let root_name = self.class_name(root);
                self.info(&format!(
                    "Array class {} has no superclass, using {}",
                    name, root_name
                ));
                Some(root)
            }
            None => None,
            Some(s) if class.modifiers & ACC_INTERFACE != 0 => {
                let sup_name = self.class_name(s);
                self.limited(MessageKind::Interface, Severity::Info, || {
                    format!(
                        "Interface {} should not have a superclass {}",
                        name, sup_name
                    )
                });
                None
            }
            Some(s) if is_primitive_name(&name) => {
                let sup_name = self.class_name(s);
                self.info(&format!(
                    "Primitive type {} should not have a superclass {}",
                    name, sup_name
                ));
                None
            }
            Some(s) => Some(s),
        }
    }

    fn superclass_problem(&mut self, key: ClassKey, cause: &CorruptMarker) {
        let name = self.class_name(key);
        let address = self.class_address(key);
        self.limited(MessageKind::Superclass, Severity::Warning, || {
            format!(
                "Problem getting superclass for class {} at {}: {}",
                name,
                format_address(address),
                cause
            )
        });
    }

    /// The top of the superclass chain of `key`
    fn root_of(&self, mut key: ClassKey) -> ClassKey {
        let mut seen = HashSet::new();
        while seen.insert(key) {
            match self.rt.class(key).map(|c| c.superclass) {
                Ok(Ok(Some(s))) => key = s,
                _ => break,
            }
        }
        key
    }

    /// Builds the metadata of one class. `super_override` replaces the
    /// superclass the provider reports.
    fn gen_class(&mut self, key: ClassKey, super_override: Option<u64>) -> Option<usize> {
        let rt = self.rt;
        let record = match rt.class(key) {
            Ok(c) => c,
            Err(e) => {
                self.message(Severity::Error, "Problem building class", Some(&e));
                return None;
            }
        };
        let address = self.class_address(key);
        let raw_name = self.class_name(key);
        let Some(id) = self.ids.reverse(address) else {
            self.error(&format!(
                "Class {} at {} not found in the identifiers",
                raw_name,
                format_address(address)
            ));
            return None;
        };

        let loader_address = match self.class_loader(key) {
            Ok(loader) => {
                if loader.is_none() {
                    self.warning(&format!(
                        "Unable to find class loader for {} at {}",
                        raw_name,
                        format_address(address)
                    ));
                }
                self.loader_address(loader)
            }
            Err(e) => {
                self.warn_with(
                    &format!(
                        "Unable to find class loader for {} at {}",
                        raw_name,
                        format_address(address)
                    ),
                    &e,
                );
                self.boot_loader_address
            }
        };

        let mut super_address = match super_override {
            Some(a) => a,
            None => self.superclass(key).map_or(0, |s| self.class_address(s)),
        };
        let mut super_id = None;
        if super_address != 0 {
            super_id = self.ids.reverse(super_address);
            if super_id.is_none() {
                self.error(&format!(
                    "Superclass at {} of {} at {} not found",
                    format_address(super_address),
                    raw_name,
                    format_address(address)
                ));
                super_address = 0;
            }
        }

        let mut statics = vec![];
        if super_address != 0 {
            statics.push(StaticField::object("<super>", super_address));
        }
        let mut fields = vec![];
        for field in rt.declared_fields(&record) {
            let field = match field {
                Ok(f) => f,
                Err(e) => {
                    self.warn_with(&format!("Corrupt field in class {}", raw_name), &e);
                    continue;
                }
            };
            let field_type = FieldType::from_signature(&field.signature);
            if !field.is_static() {
                fields.push(FieldDescriptor {
                    name: field.name,
                    field_type,
                });
                continue;
            }
            let value = match rt.field_value(None, &field) {
                Ok(v) => v,
                Err(e) => {
                    self.warn_with(
                        &format!(
                            "Invalid static field {} {} in {} at {}",
                            field.name,
                            field.signature,
                            raw_name,
                            format_address(address)
                        ),
                        &e,
                    );
                    FieldValue::Null
                }
            };
            statics.push(StaticField {
                name: field.name,
                field_type,
                value,
            });
        }

        if let Ok(Some(object_address)) = record.object {
            match rt.object(object_address) {
                Ok(object) => match object.class {
                    Ok(k) => self.class_object_fields(&object, k, &raw_name, &mut statics),
                    Err(ref e) => self.message(
                        Severity::Error,
                        &format!(
                            "Unable to find the type of class object {} of {}",
                            format_address(object_address),
                            raw_name
                        ),
                        Some(e),
                    ),
                },
                Err(e) => trace!("No object for class {}: {}", raw_name, e),
            }
        }

        let mut pool_index = 0;
        for entry in rt.constant_pool(&record) {
            let target = match entry {
                Ok(PoolEntry::Object(a)) => a,
                Ok(PoolEntry::Class(k)) => self.class_address(k),
                Err(e) => {
                    self.warn_with(
                        &format!("Corrupt constant pool entry in class {}", raw_name),
                        &e,
                    );
                    continue;
                }
            };
            statics.push(StaticField::object(
                format!("<constant pool[{}]>", pool_index),
                target,
            ));
            pool_index += 1;
        }

        let loader_id = self.ids.reverse(loader_address);
        if loader_id.is_none() {
            self.error(&format!(
                "Class loader at {} of {} at {} not found",
                format_address(loader_address),
                raw_name,
                format_address(address)
            ));
        }

        let mut info = ClassInfo::new(id, address, display_name(&raw_name));
        info.super_id = super_id;
        info.super_address = super_address;
        info.loader_id = loader_id;
        info.loader_address = loader_address;
        info.fields = fields;
        info.statics = statics;
        self.classes.insert(id, info);
        Some(id)
    }

    /// Instance fields of the class object itself, as `<name>` pseudo fields
    fn class_object_fields(
        &mut self,
        object: &ObjectRecord,
        type_key: ClassKey,
        class_name: &str,
        statics: &mut Vec<StaticField>,
    ) {
        let rt = self.rt;
        let mut next = Some(type_key);
        let mut seen = HashSet::new();
        while let Some(key) = next {
            if !seen.insert(key) {
                break;
            }
            let Ok(class) = rt.class(key) else { break };
            for field in rt.declared_fields(&class) {
                let Ok(field) = field else { continue };
                if field.is_static() {
                    continue;
                }
                let value = match rt.field_value(Some(object), &field) {
                    Ok(FieldValue::Boolean(_)) | Ok(FieldValue::Char(_)) => FieldValue::Null,
                    Ok(v) => v,
                    Err(e) => {
                        self.warn_with(
                            &format!(
                                "Invalid field {} {} of the class object of {}",
                                field.name, field.signature, class_name
                            ),
                            &e,
                        );
                        FieldValue::Null
                    }
                };
                statics.push(StaticField {
                    name: format!("<{}>", field.name),
                    field_type: FieldType::from_signature(&field.signature),
                    value,
                });
            }
            next = self.superclass(key);
        }
    }

    /// Sizes a class and counts it as an instance of `java.lang.Class`
    fn gen_class_sizes(&mut self, key: ClassKey, id: usize, jlc_id: usize) {
        let rt = self.rt;
        let object_size = match rt.class(key).map(|c| c.object) {
            Ok(Ok(Some(a))) => rt.object(a).and_then(|o| o.size).ok().map(aligned_size),
            _ => None,
        };
        let jlc_address = self.ids.get(jlc_id);
        if let (Some(size), Some(jlc)) = (object_size, self.classes.get_mut(&jlc_id)) {
            jlc.heap_size_per_instance = size;
        }
        let size = object_size.unwrap_or(0) + self.class_size(key);
        if let Some(class) = self.classes.get_mut(&id) {
            class.class_id = Some(jlc_id);
            class.class_address = jlc_address;
            class.used_heap_size = size;
            trace!(
                "Built class {} at {} loader {:?} super {:?} size {}",
                class.name,
                format_address(class.address),
                class.loader_id,
                class.super_id,
                size
            );
        }
        self.sizes.set(id, size);
        if let Some(jlc) = self.classes.get_mut(&jlc_id) {
            jlc.add_instance(size);
        }
    }

    /// Bytecode and compiled code of every method of a class
    fn class_size(&mut self, key: ClassKey) -> i64 {
        let rt = self.rt;
        let Ok(class) = rt.class(key) else { return 0 };
        let name = self.class_name(key);
        let mut size = 0;
        for method in rt.declared_methods(&class) {
            let method = match method {
                Ok(m) => m,
                Err(e) => {
                    self.warn_with(&format!("Corrupt method in class {}", name), &e);
                    continue;
                }
            };
            for section in &method.bytecode_sections {
                size += self.check_section(&name, &method, section, BYTECODE_SECTION_LIMIT, "bytecode");
            }
            for section in &method.compiled_sections {
                size += self.check_section(
                    &name,
                    &method,
                    section,
                    COMPILED_SECTION_LIMIT,
                    "compiled code",
                );
            }
        }
        size
    }

    fn check_section(
        &mut self,
        class_name: &str,
        method: &MethodRecord,
        section: &Result<Section, CorruptMarker>,
        limit: i64,
        what: &str,
    ) -> i64 {
        match section {
            Ok(s) if s.size >= 0 && s.size < limit => s.size,
            Ok(s) => {
                let signature = method.signature.clone().unwrap_or_default();
                self.limited(MessageKind::MethodSection, Severity::Info, || {
                    format!(
                        "Unexpected {} section size at {} size {} limit {} in {}.{}{}",
                        what,
                        format_address(s.base),
                        s.size,
                        limit,
                        class_name,
                        method.name,
                        signature
                    )
                });
                0
            }
            Err(e) => {
                self.limited(MessageKind::MethodSection, Severity::Warning, || {
                    format!(
                        "Corrupt {} section in {}.{}: {}",
                        what, class_name, method.name, e
                    )
                });
                0
            }
        }
    }

    /// Builds `java.lang.Class` first, then `java.lang.ClassLoader`, then
    /// every other class, and links the results.
    pub(super) fn build_classes(&mut self) -> Result<()> {
        let rt = self.rt;
        let all: Vec<ClassKey> = self.all_classes.values().copied().collect();

        let mut jlc = None;
        for &key in &all {
            let object = match rt.class(key).map(|c| c.object) {
                Ok(Ok(Some(a))) => a,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) | Err(e) => {
                    self.limited(MessageKind::ClassForObject, Severity::Warning, || {
                        format!("Problem finding java.lang.Class: {}", e)
                    });
                    continue;
                }
            };
            match rt.object(object).and_then(|o| o.class) {
                Ok(k) => {
                    jlc = Some(k);
                    break;
                }
                Err(e) => self.limited(MessageKind::ClassForObject, Severity::Warning, || {
                    format!("Problem finding java.lang.Class: {}", e)
                }),
            }
        }
        if jlc.is_none() {
            jlc = all.iter().copied().find(|&k| {
                matches!(rt.class(k).map(|c| c.name), Ok(Ok(ref n)) if n == "java/lang/Class")
            });
        }
        let jlc = jlc.ok_or_else(|| anyhow!("Unable to find java.lang.Class"))?;
        let jlc_id = self
            .gen_class(jlc, None)
            .ok_or_else(|| anyhow!("Unable to build java.lang.Class"))?;
        self.jlc = Some(jlc);
        self.jlc_id = Some(jlc_id);
        self.gen_class_sizes(jlc, jlc_id, jlc_id);

        if let Some(jlcl) = self.jlcl.filter(|&k| k != jlc) {
            self.jlcl_id = self.gen_class(jlcl, None);
            if let Some(id) = self.jlcl_id {
                self.gen_class_sizes(jlcl, id, jlc_id);
            }
        }

        let mut found_fields = false;
        for (n, &key) in all.iter().enumerate() {
            if n % WORK_OBJECTS_STEP == 0 {
                self.check_cancel()?;
            }
            if key == jlc || Some(key) == self.jlcl {
                continue;
            }
            let super_override = self.loader_type_super(key);
            if let Some(id) = self.gen_class(key, super_override) {
                self.gen_class_sizes(key, id, jlc_id);
                found_fields |= self.classes.get(&id).map_or(false, |c| !c.fields.is_empty());
            }
        }

        if !self.boot_loader_has_object {
            self.boot_loader_type = self.jlcl_id.or_else(|| self.classes.keys().next().copied());
        }
        self.found_fields = found_fields;
        if !found_fields {
            self.info("No instance fields found in any class, using references from the dump");
            self.have_provider_refs = true;
            self.use_provider_refs = true;
        }

        let links: Vec<(usize, usize)> = self
            .classes
            .values()
            .filter_map(|c| c.super_id.map(|s| (s, c.id)))
            .collect();
        for (sup, sub) in links {
            if let Some(class) = self.classes.get_mut(&sup) {
                class.subclasses.push(sub);
            }
        }
        for (&id, class) in &self.classes {
            self.object_to_class[id] = class.class_id;
        }

        if self.policy.guess_finalizables {
            for &key in &all {
                if self.is_finalizable(key) {
                    let address = self.class_address(key);
                    if let Some(id) = self.ids.reverse(address) {
                        self.finalizable_classes.insert(id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Loader types with too shallow a superclass chain get
    /// `java.lang.ClassLoader` as their superclass
    fn loader_type_super(&mut self, key: ClassKey) -> Option<u64> {
        let jlcl_id = self.jlcl_id?;
        if !self.loader_types.contains(&key) {
            return None;
        }
        let shallow = match self.superclass(key) {
            None => true,
            Some(s) => self.superclass(s).is_none(),
        };
        shallow.then(|| self.ids.get(jlcl_id))
    }

    /// Whether some class below `java.lang.Object` in the chain of `key`
    /// declares `finalize()`
    fn is_finalizable(&mut self, key: ClassKey) -> bool {
        let rt = self.rt;
        let mut next = Some(key);
        let mut seen = HashSet::new();
        while let Some(k) = next {
            if !seen.insert(k) {
                break;
            }
            let sup = self.superclass(k);
            if sup.is_none() {
                break;
            }
            let class = match rt.class(k) {
                Ok(c) => c,
                Err(e) => {
                    let name = self.class_name(key);
                    self.warn_with(
                        &format!("Problem determining if class {} is finalizable", name),
                        &e,
                    );
                    break;
                }
            };
            for method in rt.declared_methods(&class) {
                let Ok(method) = method else { continue };
                if method.name != "finalize" {
                    continue;
                }
                match &method.signature {
                    Ok(s) if s == "()V" => return true,
                    Ok(_) => {}
                    Err(e) => {
                        let name = self.class_name(k);
                        self.warn_with(
                            &format!("Problem determining the finalize method signature of {}", name),
                            e,
                        );
                        return true;
                    }
                }
            }
            next = sup;
        }
        false
    }

    /// Outbound references of every class
    pub(super) fn process_class_refs(&mut self) -> Result<()> {
        self.listener.sub_task("Finding outbound references for classes");
        let all: Vec<ClassKey> = self.all_classes.values().copied().collect();
        let mut done = HashSet::new();
        for (n, key) in all.into_iter().enumerate() {
            if n % WORK_OBJECTS_STEP == 0 {
                self.check_cancel()?;
            }
            let address = self.class_address(key);
            let Some(id) = self.ids.reverse(address) else { continue };
            if !done.insert(id) {
                continue;
            }
            let Some(refs) = self.classes.get(&id).map(ClassInfo::references) else {
                continue;
            };
            let refs = self.check_refs(RefSubject::Class(key), refs);
            self.add_refs(&refs);
            self.log_refs(id, &refs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::IndexPolicy;
    use crate::heapdump::{ClassLoader, FieldDecl, Method, PoolSlot};
    use crate::listener::RecordingListener;

    #[test]
    fn test_boot_loader_without_object() {
        let mut listener = RecordingListener::default();
        let index = build_index(DumpBuilder::small_heap(), IndexPolicy::default(), &mut listener);
        assert_eq!(index.identifiers.get(0), 0);
        let string = index.classes.values().find(|c| c.name == "java.lang.String").unwrap();
        assert_eq!(string.loader_address, 0);
        assert_eq!(string.loader_id, Some(0));
        // the dummy boot loader is an instance of java.lang.ClassLoader
        let loader_class = index.object_to_class[0].unwrap();
        assert_eq!(index.classes[&loader_class].name, "java.lang.ClassLoader");
    }

    #[test]
    fn test_boot_loader_which_loaded_itself() {
        const BOOT_OBJECT: u64 = 0x2800;
        const APP_OBJECT: u64 = 0x2900;
        let mut b = DumpBuilder::small_heap();
        b.runtime().loaders[0].object = Some(BOOT_OBJECT);
        b.add_object(BOOT_OBJECT, LOADER_CLASS, 32);
        let app = b.add_class("demo/AppLoader", Some(LOADER_CLASS));
        b.add_object(APP_OBJECT, app, 32);
        // the application loader is listed first but did not load its own type
        b.runtime().loaders.insert(
            0,
            ClassLoader {
                object: Some(APP_OBJECT),
                ..Default::default()
            },
        );
        for class in b.runtime().classes.iter_mut() {
            class.loader = Some(1);
        }
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let object = index.classes.values().find(|c| c.name == "java.lang.Object").unwrap();
        assert_eq!(object.loader_address, BOOT_OBJECT);
        // no dummy loader was needed
        assert_ne!(index.identifiers.get(0), 0);
    }

    #[test]
    fn test_class_metadata() {
        let mut b = DumpBuilder::small_heap();
        let holder = HOLDER_CLASS;
        b.class(holder).fields.push(FieldDecl {
            name: "INSTANCE".to_string(),
            signature: "Ldemo/Holder;".to_string(),
            modifiers: crate::constants::ACC_STATIC,
            static_value: reference(HOLDER),
            corrupt: None,
        });
        b.class(holder).constant_pool.push(PoolSlot {
            object: None,
            class_index: Some(STRING_CLASS),
        });
        b.class(holder).methods.push(Method {
            name: "get".to_string(),
            signature: Some("()Ljava/lang/Object;".to_string()),
            bytecode_sections: vec![crate::heapdump::MemorySection {
                base: 0x9000,
                size: 40,
                corrupt: None,
            }],
            compiled_sections: vec![crate::heapdump::MemorySection {
                base: 0xa000,
                size: 0x100000,
                corrupt: None,
            }],
            ..Default::default()
        });
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let ids = &index.identifiers;
        let class = &index.classes[&ids.reverse(class_address(holder)).unwrap()];
        assert_eq!(class.name, "demo.Holder");
        assert_eq!(class.super_address, class_address(OBJECT_CLASS));
        assert_eq!(class.fields.len(), 1);
        let names: Vec<&str> = class.statics.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["<super>", "INSTANCE", "<constant pool[0]>"]);
        // the oversized compiled section is not counted
        assert_eq!(class.used_heap_size, CLASS_OBJECT_SIZE + 40);
        assert!(listener.contains("Unexpected compiled code section size"));
        let refs = &index.outbound[class.id];
        assert!(refs.contains(&ids.reverse(HOLDER).unwrap()));
        assert!(refs.contains(&ids.reverse(class_address(STRING_CLASS)).unwrap()));
        let object = &index.classes[&ids.reverse(class_address(OBJECT_CLASS)).unwrap()];
        assert!(object.subclasses.contains(&class.id));
        let jlc = &index.classes[&ids.reverse(class_address(CLASS_CLASS)).unwrap()];
        assert_eq!(jlc.instance_count, index.classes.len());
        assert_eq!(jlc.heap_size_per_instance, CLASS_OBJECT_SIZE);
    }

    #[test]
    fn test_interface_superclass_dropped() {
        let mut b = DumpBuilder::small_heap();
        let iface = b.add_class("demo/Api", Some(OBJECT_CLASS));
        b.class(iface).modifiers = crate::constants::ACC_INTERFACE;
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let api = index.classes.values().find(|c| c.name == "demo.Api").unwrap();
        assert_eq!(api.super_id, None);
        assert!(listener.contains("Interface demo/Api should not have a superclass"));
    }

    #[test]
    fn test_class_without_address_gets_dummy() {
        let mut b = DumpBuilder::small_heap();
        let lost = b.add_class("demo/Lost", Some(OBJECT_CLASS));
        b.class(lost).object = None;
        let class_object = class_address(lost);
        b.runtime().heaps[0].objects.retain(|o| o.address != class_object);
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let lost = index.classes.values().find(|c| c.name == "demo.Lost").unwrap();
        // first aligned address past the heap section ending at 0x3000
        assert_eq!(lost.address, 0x3000);
        assert!(listener.contains("Class demo/Lost has no address"));
    }

    #[test]
    fn test_missing_thread_object_is_indexed() {
        let mut b = DumpBuilder::one_thread(true);
        let objects = &mut b.runtime().heaps[0].objects;
        let at = objects.iter().position(|o| o.address == THREAD_OBJECT).unwrap();
        let thread_object = objects.remove(at);
        b.runtime().extra_objects.push(thread_object);
        let mut listener = RecordingListener::default();
        let index = build_index(b, IndexPolicy::default(), &mut listener);
        let id = index.identifiers.reverse(THREAD_OBJECT).unwrap();
        let class_id = index.object_to_class[id].unwrap();
        assert_eq!(index.classes[&class_id].name, "java.lang.Thread");
        assert!(listener.contains("not found in the heap"));
    }

    #[test]
    fn test_finalizable_classes() {
        let mut b = DumpBuilder::small_heap();
        let plain = b.add_class("demo/Plain", Some(OBJECT_CLASS));
        let closer = b.add_class("demo/Closer", Some(OBJECT_CLASS));
        b.class(closer).methods.push(Method {
            name: "finalize".to_string(),
            signature: Some("()V".to_string()),
            ..Default::default()
        });
        let child = b.add_class("demo/CloserChild", Some(closer));
        b.class(OBJECT_CLASS).methods.push(Method {
            name: "finalize".to_string(),
            signature: Some("()V".to_string()),
            ..Default::default()
        });
        let policy = IndexPolicy::default();
        let mut listener = RecordingListener::default();
        with_pass(b, &policy, &mut listener, |pass| {
            pass.discover_identifiers().unwrap();
            pass.build_classes().unwrap();
            let ids = &pass.ids;
            let id = |index: u32| ids.reverse(class_address(index)).unwrap();
            let (plain, closer, child, object) =
                (id(plain), id(closer), id(child), id(OBJECT_CLASS));
            assert!(!pass.finalizable_classes.contains(&plain));
            assert!(pass.finalizable_classes.contains(&closer));
            assert!(pass.finalizable_classes.contains(&child));
            assert!(!pass.finalizable_classes.contains(&object));
        });
    }

    #[test]
    fn test_corrupt_class_name() {
        let mut b = DumpBuilder::small_heap();
        b.class(OBJECT_ARRAY_CLASS).name = None;
        b.class(HOLDER_CLASS).name = None;
        let policy = IndexPolicy::default();
        let mut listener = RecordingListener::default();
        with_pass(b, &policy, &mut listener, |pass| {
            use crate::provider::ClassKey;
            assert_eq!(
                pass.class_name(ClassKey(OBJECT_ARRAY_CLASS as usize)),
                "[Ljava/lang/Object;"
            );
            assert_eq!(
                pass.class_name(ClassKey(HOLDER_CLASS as usize)),
                format!("corruptClassName@0x{:x}", class_address(HOLDER_CLASS))
            );
        });
    }
}
