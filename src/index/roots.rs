use super::{format_address, IdentifierTable, Pass};
use crate::constants::*;
use crate::listener::{MessageKind, Severity};
use crate::provider::*;
use crate::thread_report::ThreadReport;
use anyhow::Result;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Why an object is kept alive. The values are bit flags so that the types
/// of all roots of one object fit in a single integer.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootType {
    Unknown = 1,
    SystemClass = 2,
    NativeLocal = 4,
    NativeStatic = 8,
    ThreadBlock = 16,
    BusyMonitor = 32,
    JavaLocal = 64,
    NativeStack = 128,
    ThreadObj = 256,
    Finalizable = 512,
    Unfinalized = 1024,
}

impl RootType {
    pub fn bits(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            RootType::Unknown => "Unknown",
            RootType::SystemClass => "System Class",
            RootType::NativeLocal => "JNI Local",
            RootType::NativeStatic => "JNI Global",
            RootType::ThreadBlock => "Thread Block",
            RootType::BusyMonitor => "Busy Monitor",
            RootType::JavaLocal => "Java Local",
            RootType::NativeStack => "Native Stack",
            RootType::ThreadObj => "Thread",
            RootType::Finalizable => "Finalizable",
            RootType::Unfinalized => "Unfinalized",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcRootInfo {
    pub object_address: u64,
    pub object_id: usize,
    /// What holds the object: a thread, a loader or the object itself
    pub context_address: u64,
    pub context_id: Option<usize>,
    pub root_type: RootType,
}

pub type RootList = SmallVec<[GcRootInfo; 2]>;
pub type RootMap = BTreeMap<usize, RootList>;

/// Distinct root type names of `roots`, comma separated
pub fn type_set_string(roots: &[GcRootInfo]) -> String {
    let types: BTreeSet<RootType> = roots.iter().map(|r| r.root_type).collect();
    types
        .into_iter()
        .map(RootType::name)
        .collect::<Vec<_>>()
        .join(",")
}

/// Global roots plus the roots found on each thread, keyed by the id of the
/// thread object.
#[derive(Clone, Debug, Default)]
pub(crate) struct RootSet {
    pub(crate) global: RootMap,
    pub(crate) threads: BTreeMap<usize, RootMap>,
}

/// Roots of objects without an id are dropped
fn push_root(
    map: &mut RootMap,
    ids: &IdentifierTable,
    object: u64,
    context: u64,
    root_type: RootType,
) -> bool {
    let Some(object_id) = ids.reverse(object) else {
        return false;
    };
    map.entry(object_id).or_default().push(GcRootInfo {
        object_address: object,
        object_id,
        context_address: context,
        context_id: ids.reverse(context),
        root_type,
    });
    true
}

impl RootSet {
    pub(crate) fn add_global(
        &mut self,
        ids: &IdentifierTable,
        object: u64,
        context: u64,
        root_type: RootType,
    ) -> bool {
        push_root(&mut self.global, ids, object, context, root_type)
    }

    pub(crate) fn add_thread(
        &mut self,
        ids: &IdentifierTable,
        thread_id: usize,
        object: u64,
        context: u64,
        root_type: RootType,
    ) -> bool {
        push_root(
            self.threads.entry(thread_id).or_default(),
            ids,
            object,
            context,
            root_type,
        )
    }

    pub(crate) fn has_thread(&self, thread_id: usize) -> bool {
        self.threads.contains_key(&thread_id)
    }

    /// Ids with a root of any kind, global or per thread
    pub(crate) fn rooted_ids(&self) -> BTreeSet<usize> {
        let mut ids: BTreeSet<usize> = self.global.keys().copied().collect();
        for map in self.threads.values() {
            ids.extend(map.keys().copied());
        }
        ids
    }
}

fn align_down(address: u64, pointer_size: usize) -> u64 {
    address & !(pointer_size as u64 - 1)
}

/// Lowest address of the section holding `address`, or 0
fn stack_base(sections: &[Section], address: u64) -> u64 {
    sections
        .iter()
        .find(|s| s.contains(address))
        .map_or(0, |s| s.base)
}

impl<'a> Pass<'a> {
    /// Decides between the dump's own roots and roots found by scanning
    /// threads and monitors
    pub(super) fn resolve_roots(&mut self) -> Result<()> {
        // old runtimes without a boot loader object put the frame base at
        // the low end of the frame
        let scan_up = self.boot_loader_address == BOOT_LOADER_ADDRESS;
        let precise = self.process_provider_roots()?;
        let provider_rooted = self.roots.rooted_ids();
        if !precise {
            self.conservative_roots(scan_up)?;
            self.add_missed_roots();
            self.compare_roots(&provider_rooted);
        } else if self.policy.verbose {
            let provider = std::mem::take(&mut self.roots);
            self.conservative_roots(scan_up)?;
            self.add_missed_roots();
            self.compare_roots(&provider_rooted);
            self.roots = provider;
        }
        self.good_provider_roots = precise;
        Ok(())
    }

    /// Collects the roots the dump reports, globally and per stack frame.
    /// Returns whether they are good enough to use; they are kept either way.
    pub(super) fn process_provider_roots(&mut self) -> Result<bool> {
        let rt = self.rt;
        let heap_roots = match rt.heap_roots() {
            Ok(roots) => roots,
            Err(ProviderError::Unsupported) => {
                self.warning("The dump does not support heap roots");
                return Ok(false);
            }
            Err(e) => {
                self.warn_with("Heap roots are unavailable", &e);
                Box::new(std::iter::empty())
            }
        };
        debug!("Processing global roots");
        let mut found = RootSet::default();
        self.missed_roots.clear();
        for root in heap_roots {
            match root {
                Ok(root) => self.process_root(&mut found, &root, None),
                Err(e) => self.warn_with("Corrupt heap root", &e),
            }
        }

        debug!("Processing thread roots");
        let mut report = if found.global.is_empty() {
            None
        } else {
            self.report.take()
        };
        for thread in rt.threads() {
            let thread = match thread {
                Ok(t) => t,
                Err(e) => {
                    self.warn_with("Corrupt thread", &e);
                    continue;
                }
            };
            if let Some(r) = report.as_mut() {
                r.write_thread(rt, &thread);
            }
            for frame in rt.stack_frames(&thread) {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        self.warn_with("Corrupt Java stack frame", &e);
                        continue;
                    }
                };
                let Some(frame_roots) = rt.frame_roots(&frame) else {
                    self.limited(MessageKind::FrameRoots, Severity::Warning, || {
                        "The dump gives no roots for a stack frame".to_string()
                    });
                    continue;
                };
                for root in frame_roots {
                    let root = match root {
                        Ok(r) => r,
                        Err(e) => {
                            self.warn_with("Corrupt stack frame root", &e);
                            continue;
                        }
                    };
                    self.process_root(&mut found, &root, Some(&thread));
                    if report.is_some() {
                        let target = match root.target {
                            Ok(RefTarget::Object(a)) => Some(a),
                            Ok(RefTarget::Class(k)) => Some(self.class_address(k)),
                            _ => None,
                        };
                        if let (Some(r), Some(t)) = (report.as_mut(), target) {
                            if self.ids.contains(t) {
                                r.write_local(t, frame.index);
                            }
                        }
                    }
                }
            }
            if let Some(r) = report.as_mut() {
                r.end_thread();
            }
        }
        if let Some(r) = report {
            self.finish_report(r);
        }
        self.check_cancel()?;

        let mut good = true;
        if found.global.is_empty() {
            good = false;
            self.warning("No heap roots found in the dump");
        }
        if !self.policy.use_provider_roots {
            good = false;
            self.info("Roots from the dump are disabled");
        }
        self.roots = found;
        Ok(good)
    }

    fn process_root(&mut self, found: &mut RootSet, root: &RootRecord, thread: Option<&ThreadRecord>) {
        let mut thread_root = false;
        let mut root_type = match root.kind {
            Ok(kind) => match kind {
                HeapRootKind::JniGlobal => RootType::NativeStatic,
                HeapRootKind::JniLocal => {
                    thread_root = true;
                    RootType::NativeLocal
                }
                HeapRootKind::Monitor => {
                    thread_root = true;
                    RootType::BusyMonitor
                }
                HeapRootKind::StackLocal => {
                    thread_root = true;
                    RootType::JavaLocal
                }
                HeapRootKind::SystemClass | HeapRootKind::ClassLoader => {
                    // reachable through the boot loader anyway
                    if !self.policy.use_system_class_roots {
                        return;
                    }
                    RootType::SystemClass
                }
                HeapRootKind::Thread => RootType::ThreadObj,
                HeapRootKind::Finalizable => {
                    self.found_finalizable_roots = true;
                    RootType::Finalizable
                }
                HeapRootKind::Unfinalized => RootType::Unfinalized,
                HeapRootKind::Unknown | HeapRootKind::Other | HeapRootKind::StringTable => {
                    RootType::Unknown
                }
            },
            Err(ref e) => {
                self.message(Severity::Info, "Unable to find the type of a root", Some(e));
                RootType::Unknown
            }
        };
        match root.reachability {
            Ok(r) if r.is_weak() && self.policy.skip_weak_roots => return,
            Ok(_) => {}
            Err(ref e) => {
                self.message(Severity::Info, "Unable to find the reachability of a root", Some(e))
            }
        }
        let target = match root.target {
            Ok(RefTarget::Object(a)) => a,
            Ok(RefTarget::Class(k)) => self.class_address(k),
            Ok(RefTarget::Null) => {
                self.info("Null target of a root, ignoring it");
                return;
            }
            Err(ref e) => {
                self.warn_with("Problem getting the target of a root", e);
                return;
            }
        };

        let mut source = target;
        match root.source {
            Ok(RootSource::Object(a)) => source = a,
            Ok(RootSource::Class(k)) => source = self.class_address(k),
            Ok(RootSource::StackFrame) => {
                if let Some(ThreadRecord {
                    object: Ok(Some(obj)),
                    ..
                }) = thread
                {
                    source = *obj;
                }
            }
            Ok(RootSource::Thread(obj)) => {
                if let Some(obj) = obj {
                    source = obj;
                }
                if root.description.starts_with("stack") || root.description.starts_with("Register")
                {
                    root_type = RootType::NativeStack;
                    thread_root = true;
                }
            }
            Ok(RootSource::Runtime) | Ok(RootSource::Unknown) => {
                debug!("Root of {} has no usable source", format_address(target));
            }
            Err(ref e) => {
                let msg = format!("Unable to find the source of root {}", format_address(target));
                self.message(Severity::Info, &msg, Some(e));
            }
        }

        let Some(target_id) = self.ids.reverse(target) else {
            let class_name = self.target_class_name(root.target.as_ref().ok());
            self.warning(&format!(
                "Unable to find root {} of type {} with source {}, root kind {:?}: {}",
                format_address(target),
                class_name,
                format_address(source),
                root.kind.as_ref().ok(),
                root.description
            ));
            return;
        };
        let description = format!(
            "{} {} {} {:?} {:?} {}",
            target_id,
            format_address(target),
            format_address(source),
            root.kind.as_ref().ok(),
            root.reachability.as_ref().ok(),
            root.description
        );
        if root_type == RootType::Unknown {
            let class_name = self.target_class_name(root.target.as_ref().ok());
            self.info(&format!(
                "Root {} of type {} with source {} has unknown type, root kind {:?}: {}",
                format_address(target),
                class_name,
                format_address(source),
                root.kind.as_ref().ok(),
                root.description
            ));
        }

        let source_id = self.ids.reverse(source);
        match source_id {
            Some(thread_id) if thread_root => {
                found.add_thread(&self.ids, thread_id, target, source, root_type);
                if !self.policy.use_thread_refs_not_roots {
                    found.add_global(&self.ids, target, source, root_type);
                }
            }
            _ => {
                found.add_global(&self.ids, target, source, root_type);
            }
        }
        if source_id.is_none() {
            self.warning(&format!(
                "Unable to find the id of source {} of root {}: {}",
                format_address(source),
                format_address(target),
                root.description
            ));
        }
        self.missed_roots.insert(target_id, description);
    }

    fn target_class_name(&mut self, target: Option<&RefTarget>) -> String {
        match target {
            Some(RefTarget::Object(a)) => match self.rt.object(*a).and_then(|o| o.class) {
                Ok(k) => self.class_name(k),
                Err(_) => String::new(),
            },
            Some(RefTarget::Class(k)) => self.class_name(*k),
            _ => String::new(),
        }
    }

    /// Finds roots the way a conservative collector would: system classes,
    /// live threads and everything their stacks point at, and objects with
    /// busy monitors
    pub(super) fn conservative_roots(&mut self, scan_up: bool) -> Result<()> {
        self.roots = RootSet::default();
        let boot = self.boot_loader_address;
        let rt = self.rt;

        if self.policy.use_system_class_roots {
            self.roots.add_global(&self.ids, boot, boot, RootType::SystemClass);
            let system: Vec<u64> = self
                .classes
                .values()
                .filter(|c| c.loader_address == boot)
                .map(|c| c.address)
                .collect();
            for address in system {
                self.roots
                    .add_global(&self.ids, address, boot, RootType::SystemClass);
            }
        }

        let mut report = self.report.take();
        for thread in rt.threads() {
            self.progress(1)?;
            let thread = match thread {
                Ok(t) => t,
                Err(e) => {
                    self.warn_with("Corrupt thread", &e);
                    continue;
                }
            };
            let mut thread_address = 0;
            match thread.object {
                Ok(Some(object)) => {
                    thread_address = object;
                    match thread.state {
                        Ok(state) if state & THREAD_STATE_ALIVE == 0 => continue,
                        Ok(_) => {}
                        Err(ref e) => {
                            let msg = format!(
                                "Unable to find the state of thread {}",
                                format_address(thread_address)
                            );
                            self.message(Severity::Info, &msg, Some(e));
                        }
                    }
                    self.roots
                        .add_global(&self.ids, thread_address, boot, RootType::ThreadObj);
                    if let Some(id) = self.ids.reverse(thread_address) {
                        self.roots.threads.entry(id).or_default();
                    }
                }
                Ok(None) => {
                    let name = thread.name.clone().unwrap_or_default();
                    let jni_env = thread.jni_env.clone().unwrap_or(0);
                    self.limited(MessageKind::ThreadWithoutObject, Severity::Info, || {
                        format!(
                            "Thread {} with JNI environment {} has no thread object, so it is ignored",
                            name,
                            format_address(jni_env)
                        )
                    });
                }
                Err(ref e) => {
                    self.warn_with("Problem reading thread information", e);
                    continue;
                }
            }

            self.scan_java_thread(&thread, thread_address, scan_up, &mut report)?;
            match thread.native_thread {
                Some(native) => self.scan_image_thread(native, thread_address)?,
                None => self.warning(&format!(
                    "Native thread not found for thread {}",
                    format_address(thread_address)
                )),
            }
        }
        if let Some(r) = report {
            self.finish_report(r);
        }

        for monitor in rt.monitors() {
            let monitor = match monitor {
                Ok(m) => m,
                Err(e) => {
                    self.warn_with("Corrupt monitor", &e);
                    continue;
                }
            };
            // unowned monitors keep nothing alive
            let Some(object) = monitor.object else {
                continue;
            };
            match &monitor.owner {
                Ok(Some(owner)) => self.add_root_for_thread(object, Some(owner)),
                Ok(None) => {}
                Err(e) => {
                    let msg = format!(
                        "Unable to find the thread owning monitor {} for object {}",
                        format_address(monitor.address),
                        format_address(object)
                    );
                    self.warn_with(&msg, e);
                    self.add_root_for_thread(object, None);
                }
            }
            for waiter in monitor.enter_waiters.iter().chain(&monitor.notify_waiters) {
                match waiter {
                    Ok(t) => self.add_root_for_thread(object, Some(t)),
                    Err(e) => self.warn_with("Corrupt monitor waiter", e),
                }
            }
        }
        Ok(())
    }

    fn add_root_for_thread(&mut self, object: u64, thread: Option<&ThreadRecord>) {
        if let Some(thread) = thread {
            match &thread.object {
                Ok(Some(thread_address)) => match self.ids.reverse(*thread_address) {
                    Some(thread_id) if self.roots.has_thread(thread_id) => {
                        self.roots.add_thread(
                            &self.ids,
                            thread_id,
                            object,
                            *thread_address,
                            RootType::BusyMonitor,
                        );
                        if self.policy.use_thread_refs_not_roots {
                            return;
                        }
                    }
                    Some(_) => self.warning(&format!(
                        "Problem finding root information for thread {} holding monitor object {}",
                        format_address(*thread_address),
                        format_address(object)
                    )),
                    None => self.warning(&format!(
                        "Problem finding thread {} holding monitor object {}",
                        format_address(*thread_address),
                        format_address(object)
                    )),
                },
                Ok(None) => {}
                Err(e) => self.warn_with("Problem getting thread information", e),
            }
        }
        self.roots
            .add_global(&self.ids, object, object, RootType::BusyMonitor);
    }

    /// Roots `object` for the thread if it has root information, otherwise
    /// globally
    fn add_stack_root(
        &mut self,
        thread_id: Option<usize>,
        object: u64,
        context: u64,
        root_type: RootType,
    ) {
        match thread_id.filter(|&t| self.roots.has_thread(t)) {
            Some(t) => {
                self.roots.add_thread(&self.ids, t, object, context, root_type);
                if !self.policy.use_thread_refs_not_roots {
                    self.roots.add_global(&self.ids, object, context, root_type);
                }
            }
            None => {
                self.roots.add_global(&self.ids, object, context, root_type);
            }
        }
    }

    fn scan_java_thread(
        &mut self,
        thread: &ThreadRecord,
        thread_address: u64,
        scan_up: bool,
        report: &mut Option<ThreadReport>,
    ) -> Result<()> {
        let rt = self.rt;
        if let Some(r) = report.as_mut() {
            r.write_thread(rt, thread);
        }
        let thread_id = self.ids.reverse(thread_address);
        let sections: Vec<Section> = rt.stack_sections(thread).filter_map(|s| s.ok()).collect();
        // frame sizes come from the neighbouring frame, so look at all of them
        let frames: Vec<_> = rt.stack_frames(thread).collect();
        let mut searched = HashSet::new();
        let mut prev = 0u64;
        for (i, frame) in frames.iter().enumerate() {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    self.warn_with("Corrupt Java stack frame", e);
                    continue;
                }
            };
            self.check_cancel()?;
            let mut in_frame = vec![];
            match frame.base_pointer {
                Ok(bp) => {
                    let address = align_down(bp, self.pointer_size);
                    let mut size = JAVA_STACK_FRAME_SIZE;
                    if scan_up {
                        if let Some(Ok(FrameRecord {
                            base_pointer: Ok(next),
                            ..
                        })) = frames.get(i + 1)
                        {
                            let s2 = align_down(*next, self.pointer_size).wrapping_sub(address) as i64;
                            if s2 > 0 && s2 < size {
                                size = s2;
                            }
                        }
                    } else {
                        if prev == 0 {
                            prev = stack_base(&sections, address);
                        }
                        let s2 = address.wrapping_sub(prev) as i64;
                        prev = address;
                        if s2 > 0 && s2 < size {
                            size = s2;
                        }
                        // known good addresses first
                        size = -size;
                    }
                    if let Err(e) = self.search_frame(
                        thread_id,
                        thread_address,
                        address,
                        size,
                        RootType::JavaLocal,
                        &mut in_frame,
                        None,
                    ) {
                        let msg = format!(
                            "Possible problem reading Java stack frame {} at {} size {} of thread {}",
                            frame.index,
                            format_address(address),
                            size,
                            format_address(thread_address)
                        );
                        self.message(Severity::Info, &msg, Some(&e));
                    }
                }
                Err(ref e) => {
                    let msg = format!(
                        "Problem reading Java stack frame {} of thread {}",
                        frame.index,
                        format_address(thread_address)
                    );
                    self.warn_with(&msg, e);
                }
            }
            if let Some(r) = report.as_mut() {
                for &location in &in_frame {
                    if let Ok(target) = rt.read_pointer(location, self.pointer_size) {
                        r.write_local(target, frame.index);
                    }
                }
            }
            searched.extend(in_frame);

            // the running method keeps its class alive
            if let Ok(Location {
                method: Ok(method), ..
            }) = &frame.location
            {
                let class_address = self.class_address(method.declaring);
                if self.ids.contains(class_address) {
                    self.add_stack_root(thread_id, class_address, thread_address, RootType::JavaLocal);
                }
            }
        }
        if let Some(r) = report.as_mut() {
            r.end_thread();
        }

        for section in rt.stack_sections(thread) {
            let section = match section {
                Ok(s) => s,
                Err(e) => {
                    self.warn_with("Corrupt Java stack section", &e);
                    continue;
                }
            };
            self.check_cancel()?;
            self.search_section(
                thread_id,
                thread_address,
                section,
                JAVA_STACK_SECTION_MAX_SIZE,
                RootType::JavaLocal,
                Some(&searched),
            );
        }
        Ok(())
    }

    fn scan_image_thread(&mut self, native: usize, thread_address: u64) -> Result<()> {
        let rt = self.rt;
        let thread_id = self.ids.reverse(thread_address);
        match rt.native_frames(native) {
            Ok(frames) => {
                let frames: Vec<_> = frames.collect();
                for (i, frame) in frames.iter().enumerate() {
                    let bp = match frame {
                        Ok(bp) => *bp,
                        Err(e) => {
                            self.warn_with("Corrupt native stack frame", e);
                            continue;
                        }
                    };
                    self.check_cancel()?;
                    let mut size = NATIVE_STACK_FRAME_SIZE;
                    if let Some(Ok(next)) = frames.get(i + 1) {
                        let s2 = next.wrapping_sub(bp) as i64;
                        if s2 > 0 && s2 < size {
                            size = s2;
                        }
                    }
                    let mut found = vec![];
                    if let Err(e) = self.search_frame(
                        thread_id,
                        thread_address,
                        bp,
                        size,
                        RootType::NativeStack,
                        &mut found,
                        None,
                    ) {
                        let msg = format!(
                            "Possible problem reading native stack frame {} at {} size {} of thread {}",
                            i,
                            format_address(bp),
                            size,
                            format_address(thread_address)
                        );
                        self.message(Severity::Info, &msg, Some(&e));
                    }
                }
            }
            Err(e) => {
                let msg = format!(
                    "Native stack frames not found for thread {}",
                    format_address(thread_address)
                );
                self.warn_with(&msg, &e);
            }
        }
        for section in rt.native_sections(native) {
            let section = match section {
                Ok(s) => s,
                Err(e) => {
                    self.warn_with("Corrupt native stack section", &e);
                    continue;
                }
            };
            self.check_cancel()?;
            self.search_section(
                thread_id,
                thread_address,
                section,
                NATIVE_STACK_SECTION_MAX_SIZE,
                RootType::NativeStack,
                None,
            );
        }
        Ok(())
    }

    /// Searches a whole stack section, or only both ends of one larger than
    /// `max_size`
    fn search_section(
        &mut self,
        thread_id: Option<usize>,
        thread_address: u64,
        section: Section,
        max_size: i64,
        root_type: RootType,
        exclude: Option<&HashSet<u64>>,
    ) {
        if section.size < 0 {
            self.warning(&format!(
                "Skipping stack section at {} with negative size {} for thread {}",
                format_address(section.base),
                section.size,
                format_address(thread_address)
            ));
            return;
        }
        let mut found = vec![];
        let result = if section.size <= max_size {
            self.search_frame(
                thread_id,
                thread_address,
                section.base,
                section.size,
                root_type,
                &mut found,
                exclude,
            )
        } else {
            let half = max_size / 2;
            self.info(&format!(
                "Huge stack section at {} of {} bytes for thread {}, only searching {} bytes at each end",
                format_address(section.base),
                section.size,
                format_address(thread_address),
                half
            ));
            let head = self.search_frame(
                thread_id,
                thread_address,
                section.base,
                half,
                root_type,
                &mut found,
                exclude,
            );
            match head {
                Ok(()) => self.search_frame(
                    thread_id,
                    thread_address,
                    section.base.wrapping_add((section.size - half) as u64),
                    half,
                    root_type,
                    &mut found,
                    exclude,
                ),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            let msg = format!(
                "Problem reading stack section at {} size {} for thread {}",
                format_address(section.base),
                section.size,
                format_address(thread_address)
            );
            self.warn_with(&msg, &e);
        }
    }

    /// Reads pointer sized slots from `base` for `size` bytes, downwards when
    /// `size` is negative, rooting every slot which holds a known id. Slots
    /// in `exclude` are skipped; the locations of the others are appended to
    /// `searched`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn search_frame(
        &mut self,
        thread_id: Option<usize>,
        thread_address: u64,
        base: u64,
        size: i64,
        root_type: RootType,
        searched: &mut Vec<u64>,
        exclude: Option<&HashSet<u64>>,
    ) -> Result<(), MemoryAccessError> {
        let pointer = self.pointer_size as i64;
        let step = if size >= 0 { pointer } else { -pointer };
        let mut offset = 0i64;
        while offset.unsigned_abs() < size.unsigned_abs() {
            let location = base.wrapping_add(offset as u64);
            offset += step;
            let value = self.rt.read_pointer(location, self.pointer_size)?;
            if value == 0 || !self.ids.contains(value) {
                continue;
            }
            if exclude.map_or(false, |e| e.contains(&location)) {
                continue;
            }
            searched.push(location);
            self.add_stack_root(thread_id, value, thread_address, root_type);
        }
        Ok(())
    }

    fn add_missed_roots(&mut self) {
        let maps = std::iter::once(&self.roots.global).chain(self.roots.threads.values());
        for map in maps {
            for (&id, list) in map {
                let types = type_set_string(list);
                self.missed_roots
                    .entry(id)
                    .and_modify(|prev| {
                        prev.push(',');
                        prev.push_str(&types);
                    })
                    .or_insert_with(|| types.clone());
            }
        }
    }

    /// Logs the differences between the dump's roots and the scanned ones
    fn compare_roots(&self, provider_rooted: &BTreeSet<usize>) {
        let scanned = self.roots.rooted_ids();
        for &id in scanned.difference(provider_rooted) {
            debug!(
                "Dump roots missed object id {} {} {}",
                id,
                format_address(self.ids.get(id)),
                self.missed_roots.get(&id).map_or("", String::as_str)
            );
        }
        for &id in provider_rooted.difference(&scanned) {
            debug!(
                "Dump roots have extra object id {} {} {}",
                id,
                format_address(self.ids.get(id)),
                self.missed_roots.get(&id).map_or("", String::as_str)
            );
        }
    }

    /// Non-class objects held by a stack or native local of some thread
    pub(super) fn thread_root_objects(&self) -> usize {
        let mut objects = HashSet::new();
        for map in self.roots.threads.values() {
            for (&id, list) in map {
                if self.classes.contains_key(&id) {
                    continue;
                }
                let local = list.iter().any(|r| {
                    matches!(
                        r.root_type,
                        RootType::JavaLocal | RootType::NativeStack | RootType::NativeLocal
                    )
                });
                if local {
                    objects.insert(id);
                }
            }
        }
        objects.len()
    }

    /// Adds the roots the dump could not provide: guessed finalizable
    /// objects and, when the roots found look incomplete, every object
    /// nothing refers to
    pub(super) fn synthesize_roots(&mut self) -> Result<()> {
        let boot = self.boot_loader_address;
        if self.policy.guess_finalizables
            && !(self.good_provider_roots && self.found_finalizable_roots)
        {
            let mut finalizables = 0;
            for id in 0..self.ids.len() {
                if id % WORK_OBJECTS_STEP == 0 {
                    self.check_cancel()?;
                }
                if self.refd.contains(id) || self.roots.global.contains_key(&id) {
                    continue;
                }
                let Some(class_id) = self.object_to_class.get(id).copied().flatten() else {
                    continue;
                };
                if !self.finalizable_classes.contains(&class_id) {
                    continue;
                }
                let address = self.ids.get(id);
                self.roots
                    .add_global(&self.ids, address, boot, RootType::Finalizable);
                self.refd.insert(id);
                finalizables += 1;
                let class_name = self
                    .classes
                    .get(&class_id)
                    .map_or_else(String::new, |c| c.name.clone());
                self.limited(MessageKind::FinalizableGuess, Severity::Info, || {
                    format!(
                        "Unreferenced object {} of type {} has a finalize method, marking it as a finalizable root",
                        format_address(address),
                        class_name
                    )
                });
            }
            self.info(&format!(
                "{} unreferenced finalizable objects marked as roots",
                finalizables
            ));
        }

        if self.roots.global.is_empty()
            || self.roots.threads.is_empty()
            || self.thread_root_objects() == 0
            || self.policy.presume_roots
        {
            let mut extras = 0;
            for id in 0..self.ids.len() {
                if id % WORK_OBJECTS_STEP == 0 {
                    self.check_cancel()?;
                }
                if self.refd.contains(id) || self.roots.global.contains_key(&id) {
                    continue;
                }
                let address = self.ids.get(id);
                self.roots.add_global(&self.ids, address, boot, RootType::Unknown);
                self.refd.insert(id);
                extras += 1;
            }
            if self.policy.mark_all_loaders {
                // a loader may only be reachable from a cycle with its classes
                let loaders: Vec<u64> = self.loader_objects.keys().copied().collect();
                for address in loaders {
                    let Some(id) = self.ids.reverse(address) else {
                        continue;
                    };
                    if self.roots.global.contains_key(&id) {
                        continue;
                    }
                    self.roots.add_global(&self.ids, address, boot, RootType::Unknown);
                    self.refd.insert(id);
                    extras += 1;
                }
            }
            self.info(&format!(
                "{} unreferenced objects marked as roots",
                extras
            ));
        }

        let count = self.roots.global.len();
        if self.good_provider_roots {
            self.info(&format!("Using {} roots from the dump", count));
        } else {
            self.warning(&format!(
                "Using {} roots found by scanning threads and monitors",
                count
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{CollectingSink, IndexPolicy};
    use super::*;
    use crate::heapdump::{Method, Monitor, Root, Source, SourceKind, Target};
    use crate::listener::RecordingListener;

    fn prepare(pass: &mut Pass<'_>) {
        pass.discover_identifiers().unwrap();
        pass.build_classes().unwrap();
        pass.process_class_refs().unwrap();
    }

    fn roots_of(map: &RootMap, id: usize) -> Vec<RootType> {
        map.get(&id)
            .map(|l| l.iter().map(|r| r.root_type).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_type_set_string() {
        let root = |root_type| GcRootInfo {
            object_address: 0x10,
            object_id: 1,
            context_address: 0,
            context_id: None,
            root_type,
        };
        let roots = [
            root(RootType::JavaLocal),
            root(RootType::SystemClass),
            root(RootType::JavaLocal),
        ];
        assert_eq!(type_set_string(&roots), "System Class,Java Local");
        assert_eq!(RootType::ThreadObj.bits(), 256);
    }

    #[test]
    fn test_stack_local_from_dump_is_a_thread_root() {
        let mut listener = RecordingListener::default();
        let policy = IndexPolicy::default();
        with_pass(DumpBuilder::one_thread(true), &policy, &mut listener, |pass| {
            prepare(pass);
            // no global roots at all, so the dump's roots are not trusted
            assert!(!pass.process_provider_roots().unwrap());
            let thread = pass.ids.reverse(THREAD_OBJECT).unwrap();
            let local = pass.ids.reverse(LOCAL_ONLY).unwrap();
            assert_eq!(
                roots_of(&pass.roots.threads[&thread], local),
                vec![RootType::JavaLocal]
            );
            assert!(!pass.roots.global.contains_key(&local));
            assert!(pass.missed_roots.contains_key(&local));
        });
        assert!(listener.contains("No heap roots found"));
    }

    #[test]
    fn test_global_roots_from_dump() {
        let mut dump = DumpBuilder::small_heap();
        let rt = dump.runtime();
        rt.roots_unsupported = false;
        let root = |kind: HeapRootKind, reach: Reachability, address| Root {
            root_type: kind as i32,
            reachability: reach as i32,
            target: Some(Target {
                object: Some(address),
                ..Default::default()
            }),
            description: "global".to_string(),
            ..Default::default()
        };
        rt.roots = vec![
            root(HeapRootKind::JniGlobal, Reachability::Strong, HOLDER),
            root(HeapRootKind::JniGlobal, Reachability::Weak, ARRAY),
        ];
        let mut listener = RecordingListener::default();
        let policy = IndexPolicy::default();
        with_pass(dump, &policy, &mut listener, |pass| {
            prepare(pass);
            assert!(pass.process_provider_roots().unwrap());
            let holder = pass.ids.reverse(HOLDER).unwrap();
            let array = pass.ids.reverse(ARRAY).unwrap();
            assert_eq!(
                roots_of(&pass.roots.global, holder),
                vec![RootType::NativeStatic]
            );
            // weak roots are skipped by default
            assert!(!pass.roots.global.contains_key(&array));
        });
    }

    #[test]
    fn test_conservative_scan_finds_stack_local() {
        let mut listener = RecordingListener::default();
        let index = build_index(
            DumpBuilder::one_thread(false),
            IndexPolicy::default(),
            &mut listener,
        );
        let ids = &index.identifiers;
        let thread = ids.reverse(THREAD_OBJECT).unwrap();
        let local = ids.reverse(LOCAL_ONLY).unwrap();
        let main = ids.reverse(class_address(MAIN_CLASS)).unwrap();
        let thread_roots = &index.thread_roots[&thread];
        assert_eq!(roots_of(thread_roots, local), vec![RootType::JavaLocal]);
        assert!(roots_of(thread_roots, main).contains(&RootType::JavaLocal));
        assert_eq!(
            roots_of(&index.gc_roots, thread),
            vec![RootType::ThreadObj]
        );
        // stack locals are references of the thread, not global roots
        assert!(!index.gc_roots.contains_key(&local));
        assert!(index.outbound[thread].contains(&local));
        // the roots look complete, so unreferenced objects stay unrooted
        let holder = ids.reverse(HOLDER).unwrap();
        assert!(!index.gc_roots.contains_key(&holder));
        assert_eq!(
            listener.count(Severity::Warning, "roots found by scanning threads and monitors"),
            1
        );
    }

    #[test]
    fn test_thread_locals_as_global_roots() {
        let policy = IndexPolicy {
            use_thread_refs_not_roots: false,
            ..Default::default()
        };
        let index = build_index(
            DumpBuilder::one_thread(false),
            policy,
            &mut RecordingListener::default(),
        );
        let local = index.identifiers.reverse(LOCAL_ONLY).unwrap();
        let thread = index.identifiers.reverse(THREAD_OBJECT).unwrap();
        assert_eq!(
            roots_of(&index.gc_roots, local),
            vec![RootType::JavaLocal]
        );
        assert!(!index.outbound[thread].contains(&local));
    }

    #[test]
    fn test_search_frame_downwards() {
        let mut listener = RecordingListener::default();
        let policy = IndexPolicy::default();
        with_pass(DumpBuilder::one_thread(false), &policy, &mut listener, |pass| {
            pass.discover_identifiers().unwrap();
            let mut searched = vec![];
            pass.search_frame(
                None,
                0,
                STACK_BASE + 0x50,
                -0x10,
                RootType::NativeStack,
                &mut searched,
                None,
            )
            .unwrap();
            assert_eq!(searched, vec![STACK_BASE + LOCAL_SLOT]);
            let local = pass.ids.reverse(LOCAL_ONLY).unwrap();
            assert_eq!(
                roots_of(&pass.roots.global, local),
                vec![RootType::NativeStack]
            );

            // excluded slots are not rooted again
            let exclude: HashSet<u64> = searched.iter().copied().collect();
            let mut again = vec![];
            pass.search_frame(None, 0, STACK_BASE, 0x100, RootType::JavaLocal, &mut again, Some(&exclude))
                .unwrap();
            assert!(again.is_empty());

            // running off the captured memory is an error
            assert!(pass
                .search_frame(None, 0, STACK_BASE + 0xf8, 0x10, RootType::JavaLocal, &mut again, None)
                .is_err());
        });
    }

    #[test]
    fn test_backstop_roots_unreferenced_objects() {
        let index = build_index(
            DumpBuilder::small_heap(),
            IndexPolicy::default(),
            &mut RecordingListener::default(),
        );
        let ids = &index.identifiers;
        let holder = ids.reverse(HOLDER).unwrap();
        let array = ids.reverse(ARRAY).unwrap();
        let target = ids.reverse(TARGET).unwrap();
        assert_eq!(roots_of(&index.gc_roots, holder), vec![RootType::Unknown]);
        assert_eq!(roots_of(&index.gc_roots, array), vec![RootType::Unknown]);
        assert!(!index.gc_roots.contains_key(&target));
        // everything is either rooted or referenced
        let mut reached = vec![false; ids.len()];
        for targets in &index.outbound {
            for &t in targets {
                reached[t] = true;
            }
        }
        for id in 0..ids.len() {
            assert!(reached[id] || index.gc_roots.contains_key(&id), "id {}", id);
        }
    }

    #[test]
    fn test_presume_roots() {
        let policy = IndexPolicy {
            presume_roots: true,
            ..Default::default()
        };
        let index = build_index(
            DumpBuilder::one_thread(false),
            policy,
            &mut RecordingListener::default(),
        );
        let holder = index.identifiers.reverse(HOLDER).unwrap();
        assert_eq!(roots_of(&index.gc_roots, holder), vec![RootType::Unknown]);
    }

    #[test]
    fn test_finalizable_guess() {
        const FINAL: u64 = 0x2500;
        let mut dump = DumpBuilder::one_thread(false);
        let class = dump.add_class("demo/Resource", Some(OBJECT_CLASS));
        dump.class(class).methods.push(Method {
            name: "finalize".to_string(),
            signature: Some("()V".to_string()),
            ..Default::default()
        });
        dump.add_object(FINAL, class, 16);
        let mut listener = RecordingListener::default();
        let index = build_index(dump, IndexPolicy::default(), &mut listener);
        let id = index.identifiers.reverse(FINAL).unwrap();
        assert_eq!(roots_of(&index.gc_roots, id), vec![RootType::Finalizable]);
        assert!(listener.contains("1 unreferenced finalizable objects marked as roots"));
    }

    #[test]
    fn test_busy_monitor_roots() {
        let mut dump = DumpBuilder::one_thread(false);
        dump.runtime().monitors = vec![
            Monitor {
                address: 0x9100,
                object: Some(TARGET),
                owner: Some(0),
                ..Default::default()
            },
            Monitor {
                address: 0x9200,
                object: Some(ARRAY),
                corrupt_owner: true,
                ..Default::default()
            },
        ];
        let mut listener = RecordingListener::default();
        let index = build_index(dump, IndexPolicy::default(), &mut listener);
        let ids = &index.identifiers;
        let thread = ids.reverse(THREAD_OBJECT).unwrap();
        let target = ids.reverse(TARGET).unwrap();
        let array = ids.reverse(ARRAY).unwrap();
        assert_eq!(
            roots_of(&index.thread_roots[&thread], target),
            vec![RootType::BusyMonitor]
        );
        assert!(!index.gc_roots.contains_key(&target));
        // an unknown owner makes a global root held by the object itself
        let roots = &index.gc_roots[&array];
        assert_eq!(roots[0].root_type, RootType::BusyMonitor);
        assert_eq!(roots[0].context_address, ARRAY);
        assert!(listener.contains("Unable to find the thread owning monitor"));
    }

    #[test]
    fn test_dead_thread_is_not_a_root() {
        let mut dump = DumpBuilder::one_thread(false);
        dump.runtime().threads[0].state = 0;
        let mut sink = CollectingSink::default();
        build(dump, IndexPolicy::default(), &mut sink, &mut RecordingListener::default()).unwrap();
        let index = sink.index.unwrap();
        let thread = index.identifiers.reverse(THREAD_OBJECT).unwrap();
        assert!(!index.thread_roots.contains_key(&thread));
        // nothing was found on stacks, so the unreferenced thread object is
        // rooted by the backstop
        assert_eq!(roots_of(&index.gc_roots, thread), vec![RootType::Unknown]);
    }

    #[test]
    fn test_system_class_roots_follow_policy() {
        let policy = IndexPolicy {
            use_system_class_roots: false,
            ..Default::default()
        };
        let index = build_index(
            DumpBuilder::one_thread(false),
            policy,
            &mut RecordingListener::default(),
        );
        let string = index
            .identifiers
            .reverse(class_address(STRING_CLASS))
            .unwrap();
        assert!(!roots_of(&index.gc_roots, string).contains(&RootType::SystemClass));
        let index = build_index(
            DumpBuilder::one_thread(false),
            IndexPolicy::default(),
            &mut RecordingListener::default(),
        );
        assert!(roots_of(&index.gc_roots, string).contains(&RootType::SystemClass));
    }

    #[test]
    fn test_thread_report_lists_known_locals() {
        let mut dump = one_thread_with_global_root();
        dump.runtime().threads[0].frames[0].roots.push(Root {
            root_type: HeapRootKind::StackLocal as i32,
            reachability: Reachability::Strong as i32,
            target: Some(Target {
                object: Some(0xdead0000),
                ..Default::default()
            }),
            source: Some(Source {
                kind: SourceKind::StackFrame as i32,
                ..Default::default()
            }),
            description: "stale local".to_string(),
            corrupt: None,
        });
        let prefix = std::env::temp_dir()
            .join(format!("heap_indexer_report_{}_", std::process::id()))
            .to_string_lossy()
            .into_owned();
        let mut builder = builder_for(dump, IndexPolicy::default(), &prefix);
        let mut sink = CollectingSink::default();
        builder
            .fill(&mut sink, &mut RecordingListener::default())
            .unwrap();
        let path = format!("{}threads", prefix);
        let report = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(report.starts_with("Thread 0x2300\n"));
        assert!(report.contains("objecId=0x2400, line=0"));
        assert!(!report.contains("0xdead0000"));
    }

    #[test]
    fn test_verbose_scan_keeps_dump_roots() {
        let policy = IndexPolicy {
            verbose: true,
            ..Default::default()
        };
        let mut listener = RecordingListener::default();
        with_pass(one_thread_with_global_root(), &policy, &mut listener, |pass| {
            prepare(pass);
            pass.resolve_roots().unwrap();
            assert!(pass.good_provider_roots);
            let holder = pass.ids.reverse(HOLDER).unwrap();
            let thread = pass.ids.reverse(THREAD_OBJECT).unwrap();
            let local = pass.ids.reverse(LOCAL_ONLY).unwrap();
            // the dump's roots are the ones kept
            assert_eq!(
                roots_of(&pass.roots.global, holder),
                vec![RootType::NativeStatic]
            );
            assert!(!pass.roots.global.contains_key(&thread));
            assert_eq!(
                roots_of(&pass.roots.threads[&thread], local),
                vec![RootType::JavaLocal]
            );
            // the scanned ones only end up in the missed root descriptions
            assert!(pass.missed_roots[&thread].contains("Thread"));
            assert!(pass.missed_roots.contains_key(&local));
        });
    }

    #[test]
    fn test_negative_stack_section_is_skipped() {
        let mut dump = DumpBuilder::one_thread(false);
        dump.runtime().threads[0].stack_sections[0].size = -(STACK_SIZE as i64);
        let mut listener = RecordingListener::default();
        let index = build_index(dump, IndexPolicy::default(), &mut listener);
        assert_eq!(
            listener.count(Severity::Warning, "Skipping stack section at 0x8000 with negative size"),
            1
        );
        assert!(index.identifiers.reverse(LOCAL_ONLY).is_some());
    }

    #[test]
    fn test_search_frame_with_extreme_size() {
        let mut listener = RecordingListener::default();
        let policy = IndexPolicy::default();
        with_pass(DumpBuilder::one_thread(false), &policy, &mut listener, |pass| {
            pass.discover_identifiers().unwrap();
            let mut searched = vec![];
            // runs off the bottom of the captured stack instead of overflowing
            assert!(pass
                .search_frame(None, 0, STACK_BASE, i64::MIN, RootType::JavaLocal, &mut searched, None)
                .is_err());
            assert!(searched.is_empty());
        });
    }
}
