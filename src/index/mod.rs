//! Builds the preliminary index of a dump: identifiers, class metadata,
//! object to class map, outbound references and GC roots.

mod class_info;
mod classes;
mod identifier;
mod objects;
mod refs;
mod roots;
mod size_table;
mod validate;

pub use class_info::{display_name, ClassInfo, FieldDescriptor, FieldType, StaticField};
pub use identifier::IdentifierTable;
pub use objects::array_chunks;
pub use roots::{GcRootInfo, RootList, RootMap, RootType};
pub use size_table::SizeTable;
pub use validate::validate;

use crate::cache::SharedCache;
use crate::constants::*;
use crate::error::Cancelled;
use crate::listener::{MessageKind, ProgressListener, RateLimiter, Severity};
use crate::provider::*;
use crate::thread_report::ThreadReport;
use anyhow::{anyhow, Result};
use fixedbitset::FixedBitSet;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Switches controlling how roots and references are derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPolicy {
    /// Prefer the provider's root API over scanning stacks
    pub use_provider_roots: bool,
    /// Keep stack roots per thread and replay them as references of the
    /// thread object instead of making them global roots
    pub use_thread_refs_not_roots: bool,
    /// Root every unreferenced object, whatever else was found
    pub presume_roots: bool,
    /// Root every class loader object along with the unreferenced objects
    pub mark_all_loaders: bool,
    /// Root the bootstrap loader and the classes it defined
    pub use_system_class_roots: bool,
    /// Ignore weak, soft and phantom roots
    pub skip_weak_roots: bool,
    /// Root unreferenced instances of classes with a finalize method
    pub guess_finalizables: bool,
    /// Raise internal diagnostics to errors and show more of them
    pub debug_info: bool,
    /// Compare root strategies and log per object details
    pub verbose: bool,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        IndexPolicy {
            use_provider_roots: true,
            use_thread_refs_not_roots: true,
            presume_roots: false,
            mark_all_loaders: false,
            use_system_class_roots: true,
            skip_weak_roots: true,
            guess_finalizables: true,
            debug_info: false,
            verbose: false,
        }
    }
}

impl IndexPolicy {
    pub fn error_count(&self) -> i32 {
        if self.debug_info {
            DEBUG_ERROR_COUNT
        } else {
            DEFAULT_ERROR_COUNT
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub prefix: String,
    pub creation_time: Option<u64>,
    pub identifier_size: usize,
    pub jvm_info: Option<String>,
}

/// Everything the consumer receives once a build succeeds.
#[derive(Clone, Debug, Default)]
pub struct PreliminaryIndex {
    pub info: SnapshotInfo,
    pub identifiers: IdentifierTable,
    pub classes: BTreeMap<usize, ClassInfo>,
    pub object_to_class: Vec<Option<usize>>,
    pub array_to_size: HashMap<usize, i64>,
    /// Ids referenced by each id
    pub outbound: Vec<Vec<usize>>,
    pub gc_roots: RootMap,
    /// Roots found on a thread's stack, keyed by the thread object id
    pub thread_roots: BTreeMap<usize, RootMap>,
}

impl PreliminaryIndex {
    pub fn object_count(&self) -> usize {
        self.identifiers.len() - self.classes.len()
    }

    pub fn is_class(&self, id: usize) -> bool {
        self.classes.contains_key(&id)
    }
}

/// Consumer side of a build; receives the index exactly once.
pub trait IndexSink {
    fn commit(&mut self, index: PreliminaryIndex) -> Result<()>;
}

/// Sink that just keeps the index.
#[derive(Default)]
pub struct CollectingSink {
    pub index: Option<PreliminaryIndex>,
}

impl IndexSink for CollectingSink {
    fn commit(&mut self, index: PreliminaryIndex) -> Result<()> {
        self.index = Some(index);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub purged: usize,
    pub freed_bytes: i64,
}

/// Drives one build against one dump file.
pub struct IndexBuilder {
    cache: SharedCache,
    policy: IndexPolicy,
    dump: Option<PathBuf>,
    prefix: String,
    object_to_size: Option<SizeTable>,
    missed_roots: Option<HashMap<usize, String>>,
}

impl IndexBuilder {
    pub fn new(cache: SharedCache, policy: IndexPolicy) -> Self {
        IndexBuilder {
            cache,
            policy,
            dump: None,
            prefix: String::new(),
            object_to_size: None,
            missed_roots: None,
        }
    }

    pub fn policy(&self) -> &IndexPolicy {
        &self.policy
    }

    pub fn init(&mut self, dump: impl AsRef<Path>, prefix: &str) {
        self.dump = Some(dump.as_ref().to_path_buf());
        self.prefix = prefix.to_string();
    }

    pub fn fill(
        &mut self,
        sink: &mut dyn IndexSink,
        listener: &mut dyn ProgressListener,
    ) -> Result<()> {
        let dump = self
            .dump
            .clone()
            .ok_or_else(|| anyhow!("init must be called before fill"))?;
        listener.begin_task(
            &format!("Processing image from {}", dump.display()),
            WORK_COUNT,
        );
        let start = Instant::now();
        let image = {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| anyhow!("image cache lock poisoned"))?;
            cache.clear(&dump);
            cache.get(&dump)?
        };
        listener.send_user_message(
            Severity::Info,
            &format!(
                "Took {} ms to get image {}",
                start.elapsed().as_millis(),
                dump.display()
            ),
            None,
        );

        let mut info = SnapshotInfo {
            path: dump.clone(),
            prefix: self.prefix.clone(),
            ..Default::default()
        };
        info.creation_time = image.creation_time();
        if info.creation_time.is_none() {
            listener.send_user_message(Severity::Warning, "No date in image", None);
        }

        let (runtime, pointer_size) = select_runtime(image.as_ref(), listener)?;
        info.identifier_size = pointer_size;
        info.jvm_info = match runtime.version() {
            Ok(v) => Some(v),
            Err(_) => match runtime.full_version() {
                Ok(v) => Some(v),
                Err(e) => {
                    listener.send_user_message(
                        Severity::Warning,
                        "Unable to read the runtime version",
                        Some(&e),
                    );
                    None
                }
            },
        };

        let report = if self.prefix.is_empty() {
            None
        } else {
            let path = format!("{}threads", self.prefix);
            match File::create(&path) {
                Ok(f) => Some(ThreadReport::new(BufWriter::new(f))),
                Err(e) => {
                    listener.send_user_message(
                        Severity::Warning,
                        &format!("Unable to create thread report {}", path),
                        Some(&e),
                    );
                    None
                }
            }
        };

        let mut pass = Pass::new(runtime, &mut *listener, &self.policy, pointer_size, report);
        pass.run()?;
        let (index, sizes, missed_roots) = pass.finish(info);
        self.object_to_size = Some(sizes);
        self.missed_roots = Some(missed_roots);
        listener.send_user_message(
            Severity::Info,
            &format!(
                "Indexed {} identifiers in {} ms",
                index.identifiers.len(),
                start.elapsed().as_millis()
            ),
            None,
        );
        sink.commit(index)?;
        listener.done();
        Ok(())
    }

    /// Reports what the consumer's purge freed. `purge_mapping` holds the
    /// new id of every old id, or -1 for a purged object.
    pub fn clean(
        &mut self,
        purge_mapping: Option<&[i32]>,
        listener: &mut dyn ProgressListener,
    ) -> Result<PurgeStats> {
        let mut stats = PurgeStats::default();
        let Some(mapping) = purge_mapping else {
            listener.send_user_message(Severity::Error, "Purge mapping is missing", None);
            return Ok(stats);
        };
        listener.begin_task("Purging unreachable objects", mapping.len() / WORK_OBJECTS_STEP + 1);
        for (i, &new_id) in mapping.iter().enumerate() {
            if i % WORK_OBJECTS_STEP == 0 {
                if listener.is_canceled() {
                    return Err(Cancelled.into());
                }
                listener.worked(1);
            }
            if new_id != -1 {
                continue;
            }
            stats.purged += 1;
            let size = self.object_to_size.as_ref().map_or(0, |s| s.get(i));
            stats.freed_bytes += size;
            if self.policy.verbose {
                debug!("Purging id {} size {}", i, size);
                if let Some(why) = self.missed_roots.as_ref().and_then(|m| m.get(&i)) {
                    debug!("Purged id {} was a conservative root: {}", i, why);
                }
            }
        }
        listener.send_user_message(
            Severity::Info,
            &format!(
                "Purged {} identifiers, freed {} bytes",
                stats.purged, stats.freed_bytes
            ),
            None,
        );
        self.object_to_size = None;
        self.missed_roots = None;
        listener.done();
        Ok(stats)
    }

    /// Drops everything the builder still holds
    pub fn cancel(&mut self) {
        if let Some(dump) = &self.dump {
            if let Ok(mut cache) = self.cache.lock() {
                cache.clear(dump);
            }
        }
        self.object_to_size = None;
        self.missed_roots = None;
    }

    #[cfg(test)]
    pub(crate) fn set_object_sizes(&mut self, sizes: SizeTable) {
        self.object_to_size = Some(sizes);
    }
}

/// Picks the first Java runtime in the image, returning it with the
/// pointer size of its process.
fn select_runtime<'a>(
    image: &'a dyn DumpImage,
    listener: &mut dyn ProgressListener,
) -> Result<(&'a dyn JavaRuntime, usize)> {
    let mut spaces = 0;
    let mut processes = 0;
    let mut selected = None;
    for space in image.address_spaces() {
        let space = match space {
            Ok(s) => s,
            Err(e) => {
                listener.send_user_message(Severity::Warning, "Corrupt address space", Some(&e));
                continue;
            }
        };
        spaces += 1;
        for process in image.processes(&space) {
            let process = match process {
                Ok(p) => p,
                Err(e) => {
                    listener.send_user_message(Severity::Warning, "Corrupt process", Some(&e));
                    continue;
                }
            };
            processes += 1;
            if let Err(e) = &process.id {
                listener.send_user_message(
                    Severity::Info,
                    &format!("Process {} in {} has no id", process.index, space.name),
                    Some(e),
                );
            }
            for runtime in image.runtimes(&process) {
                let runtime = match runtime {
                    Ok(r) => r,
                    Err(e) => {
                        listener.send_user_message(Severity::Warning, "Corrupt runtime", Some(&e));
                        continue;
                    }
                };
                let version = runtime.version.as_deref().unwrap_or("?");
                match image.java_runtime(&runtime) {
                    Some(java) if selected.is_none() => {
                        selected = Some((java, pointer_size(&process, listener)));
                    }
                    Some(_) => listener.send_user_message(
                        Severity::Info,
                        &format!(
                            "Ignoring additional Java runtime {} in process {}",
                            version, process.index
                        ),
                        None,
                    ),
                    None => listener.send_user_message(
                        Severity::Info,
                        &format!("Ignoring {:?} runtime {}", runtime.kind, version),
                        None,
                    ),
                }
            }
        }
    }
    selected.ok_or_else(|| {
        anyhow!(
            "Unable to find Java runtime in {} address spaces and {} processes",
            spaces,
            processes
        )
    })
}

fn pointer_size(process: &ProcessRecord, listener: &mut dyn ProgressListener) -> usize {
    match &process.pointer_bits {
        Ok(bits) => match (*bits as usize + 1) / 8 {
            size @ (4 | 8) => size,
            _ => {
                listener.send_user_message(
                    Severity::Warning,
                    &format!("Invalid pointer size of {} bits, using 4", bits),
                    None,
                );
                4
            }
        },
        Err(e) => {
            listener.send_user_message(
                Severity::Warning,
                "Unable to read the pointer size, using 4",
                Some(e),
            );
            4
        }
    }
}

/// What a class or object refers to, as seen by the reference check.
#[derive(Clone, Copy)]
pub(crate) enum RefSubject<'r> {
    Class(ClassKey),
    Object(&'r ObjectRecord),
}

/// State of a single build. Lives from `fill` until the index is committed.
pub(crate) struct Pass<'a> {
    rt: &'a dyn JavaRuntime,
    listener: &'a mut dyn ProgressListener,
    policy: &'a IndexPolicy,
    limiter: RateLimiter,
    pointer_size: usize,
    work: usize,

    ids: IdentifierTable,
    classes: BTreeMap<usize, ClassInfo>,
    object_to_class: Vec<Option<usize>>,
    sizes: SizeTable,
    array_to_size: HashMap<usize, i64>,
    outbound: Vec<Option<Vec<usize>>>,
    refd: FixedBitSet,
    roots: roots::RootSet,

    all_classes: BTreeMap<u64, ClassKey>,
    class_addresses: HashMap<ClassKey, u64>,
    next_class_address: u64,
    defined_by: HashMap<ClassKey, LoaderKey>,
    loaders: BTreeMap<LoaderKey, LoaderRecord>,
    loader_objects: HashMap<u64, LoaderKey>,
    loader_types: HashSet<ClassKey>,
    missing_objects: BTreeMap<u64, ObjectRecord>,

    boot_loader: Option<LoaderKey>,
    boot_loader_address: u64,
    boot_loader_has_object: bool,
    jlc: Option<ClassKey>,
    jlc_id: Option<usize>,
    jlcl: Option<ClassKey>,
    jlcl_id: Option<usize>,
    boot_loader_type: Option<usize>,

    have_provider_refs: bool,
    use_provider_refs: bool,
    found_fields: bool,
    good_provider_roots: bool,
    found_finalizable_roots: bool,
    finalizable_classes: HashSet<usize>,
    missed_roots: HashMap<usize, String>,
    report: Option<ThreadReport>,
}

impl<'a> Pass<'a> {
    pub(crate) fn new(
        rt: &'a dyn JavaRuntime,
        listener: &'a mut dyn ProgressListener,
        policy: &'a IndexPolicy,
        pointer_size: usize,
        report: Option<ThreadReport>,
    ) -> Self {
        Pass {
            rt,
            listener,
            policy,
            limiter: RateLimiter::new(policy.error_count()),
            pointer_size,
            work: 0,
            ids: IdentifierTable::new(),
            classes: BTreeMap::new(),
            object_to_class: vec![],
            sizes: SizeTable::default(),
            array_to_size: HashMap::new(),
            outbound: vec![],
            refd: FixedBitSet::default(),
            roots: roots::RootSet::default(),
            all_classes: BTreeMap::new(),
            class_addresses: HashMap::new(),
            next_class_address: DUMMY_CLASS_ADDRESS_BASE,
            defined_by: HashMap::new(),
            loaders: BTreeMap::new(),
            loader_objects: HashMap::new(),
            loader_types: HashSet::new(),
            missing_objects: BTreeMap::new(),
            boot_loader: None,
            boot_loader_address: BOOT_LOADER_ADDRESS,
            boot_loader_has_object: false,
            jlc: None,
            jlc_id: None,
            jlcl: None,
            jlcl_id: None,
            boot_loader_type: None,
            have_provider_refs: true,
            use_provider_refs: false,
            found_fields: false,
            good_provider_roots: false,
            found_finalizable_roots: false,
            finalizable_classes: HashSet::new(),
            missed_roots: HashMap::new(),
            report,
        }
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        self.listener.sub_task("Finding identifiers");
        self.discover_identifiers()?;
        self.progress(1)?;

        self.listener.sub_task("Building classes");
        self.build_classes()?;
        self.process_class_refs()?;
        self.progress(1)?;

        self.listener.sub_task("Finding roots");
        self.resolve_roots()?;
        self.progress(1)?;

        self.listener.sub_task("Finding outbound references for objects");
        self.process_objects()?;

        self.listener.sub_task("Synthesizing roots");
        self.synthesize_roots()?;

        let suppressed = self.limiter.suppressed();
        if suppressed > 0 {
            self.warning(&format!("{} repeated messages suppressed", suppressed));
        }
        if let Some(report) = self.report.take() {
            self.finish_report(report);
        }
        Ok(())
    }

    /// Hands back the index, the size table and the missed roots
    pub(crate) fn finish(
        self,
        info: SnapshotInfo,
    ) -> (PreliminaryIndex, SizeTable, HashMap<usize, String>) {
        let Pass {
            listener,
            ids,
            classes,
            object_to_class,
            sizes,
            array_to_size,
            outbound,
            roots,
            missed_roots,
            ..
        } = self;
        let index = PreliminaryIndex {
            info,
            identifiers: ids,
            classes,
            object_to_class,
            array_to_size,
            outbound: outbound.into_iter().map(Option::unwrap_or_default).collect(),
            gc_roots: roots.global,
            thread_roots: roots.threads,
        };
        let problems = validate(&index, |msg| {
            listener.send_user_message(Severity::Error, &msg, None)
        });
        if problems > 0 {
            listener.send_user_message(
                Severity::Warning,
                &format!("Index validation found {} problems", problems),
                None,
            );
        }
        (index, sizes, missed_roots)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.listener.is_canceled() {
            Err(Cancelled.into())
        } else {
            Ok(())
        }
    }

    fn progress(&mut self, work: usize) -> Result<()> {
        self.work += work;
        self.listener.worked(work);
        self.check_cancel()
    }

    fn message(&mut self, severity: Severity, msg: &str, cause: Option<&dyn Error>) {
        self.listener.send_user_message(severity, msg, cause);
    }

    fn info(&mut self, msg: &str) {
        let severity = if self.policy.debug_info {
            Severity::Error
        } else {
            Severity::Info
        };
        self.message(severity, msg, None);
    }

    fn warning(&mut self, msg: &str) {
        self.message(Severity::Warning, msg, None);
    }

    fn warn_with(&mut self, msg: &str, cause: &dyn Error) {
        self.message(Severity::Warning, msg, Some(cause));
    }

    fn error(&mut self, msg: &str) {
        self.message(Severity::Error, msg, None);
    }

    /// Sends a message unless `kind` has used up its budget; `msg` is only
    /// formatted for messages which go out
    fn limited(&mut self, kind: MessageKind, severity: Severity, msg: impl FnOnce() -> String) {
        if self.limiter.allow(kind) {
            let severity = match severity {
                Severity::Info if self.policy.debug_info => Severity::Error,
                s => s,
            };
            let msg = msg();
            self.listener.send_user_message(severity, &msg, None);
        }
    }

    fn finish_report(&mut self, report: ThreadReport) {
        if let Err(e) = report.finish() {
            self.message(Severity::Warning, "Problem writing the thread report", Some(&e));
        }
    }

    fn is_loader_object(&self, address: u64) -> bool {
        self.loader_objects.contains_key(&address)
    }

    /// Records the ids `refs` point at as outbound references of `id`
    fn log_refs(&mut self, id: usize, refs: &[u64]) {
        let targets = refs.iter().filter_map(|&a| self.ids.reverse(a)).collect();
        match self.outbound.get_mut(id) {
            Some(slot) if slot.is_none() => *slot = Some(targets),
            Some(_) => {
                let msg = format!(
                    "Outbound references of {} logged twice",
                    format_address(self.ids.get(id))
                );
                self.error(&msg);
            }
            None => {}
        }
    }
}

pub(crate) fn format_address(address: u64) -> String {
    format!("0x{:x}", address)
}

#[cfg(test)]
pub(crate) mod fixtures;
