//! Cross-checks the references found by walking fields against the ones the
//! dump reports, and records the outcome.

use super::{format_address, Pass, RefSubject};
use crate::listener::{MessageKind, Severity};
use crate::provider::*;
use std::collections::{HashMap, HashSet};

/// References reported by the dump, in the order they were reported
#[derive(Default)]
struct ProviderRefs {
    order: Vec<u64>,
    descriptions: HashMap<u64, String>,
    /// Whether the dump reported anything at all, even unusable entries
    any: bool,
}

impl ProviderRefs {
    fn insert(&mut self, address: u64, description: impl Into<String>) {
        if !self.descriptions.contains_key(&address) {
            self.order.push(address);
            self.descriptions.insert(address, description.into());
        }
    }

    fn contains(&self, address: u64) -> bool {
        self.descriptions.contains_key(&address)
    }

    fn remove(&mut self, address: u64) {
        if self.descriptions.remove(&address).is_some() {
            self.order.retain(|&a| a != address);
        }
    }
}

impl<'a> Pass<'a> {
    /// Compares `refs` with the references the dump gives for `subject`,
    /// reporting differences. Returns the references to record, which are
    /// the dump's own when field walking found nothing to go on.
    pub(super) fn check_refs(&mut self, subject: RefSubject<'_>, refs: Vec<u64>) -> Vec<u64> {
        if !self.have_provider_refs {
            return refs;
        }
        let rt = self.rt;
        let mut found = ProviderRefs::default();
        let (address, name, what) = match subject {
            RefSubject::Class(key) => {
                let address = self.class_address(key);
                let name = self.class_name(key);
                let class = match rt.class(key) {
                    Ok(c) => c,
                    Err(_) => return refs,
                };
                match class.object.clone().ok().flatten().map(|a| rt.object(a)) {
                    Some(Ok(object)) => match rt.object_references(&object) {
                        Ok(entries) => self.collect_refs(entries, &mut found, address),
                        Err(e) => return self.references_failed(e, "class", &name, address, refs),
                    },
                    _ => {
                        if let Some(jlc) = self.jlc {
                            let jlc_address = self.class_address(jlc);
                            found.insert(jlc_address, "added java.lang.Class address");
                        }
                    }
                }
                match rt.class_references(&class) {
                    Ok(entries) => self.collect_refs(entries, &mut found, address),
                    Err(e) => return self.references_failed(e, "class", &name, address, refs),
                }
                let loader = self.class_loader(key).ok().flatten();
                let has_object = loader
                    .and_then(|k| self.loaders.get(&k))
                    .map_or(false, |l| matches!(l.object, Ok(Some(_))));
                if !has_object {
                    found.insert(self.loader_address(loader), "added boot loader");
                }
                (address, name, "class")
            }
            RefSubject::Object(object) => {
                let address = object.address;
                let name = match object.class {
                    Ok(key) => {
                        let name = self.class_name(key);
                        if matches!(rt.class(key), Ok(ref c) if c.is_array) {
                            found.insert(self.class_address(key), "added array class address");
                        }
                        name
                    }
                    Err(_) => {
                        let class = self
                            .ids
                            .reverse(address)
                            .and_then(|id| self.object_to_class[id])
                            .and_then(|c| self.classes.get(&c));
                        match class {
                            Some(c) => {
                                found.insert(c.address, "added dummy class address");
                                c.name.clone()
                            }
                            None => String::new(),
                        }
                    }
                };
                match rt.object_references(object) {
                    Ok(entries) => self.collect_refs(entries, &mut found, address),
                    Err(e) => return self.references_failed(e, "object", &name, address, refs),
                }
                (address, name, "object")
            }
        };
        self.compare_refs(what, &name, address, refs, found)
    }

    fn references_failed(
        &mut self,
        e: ProviderError,
        what: &str,
        name: &str,
        address: u64,
        refs: Vec<u64>,
    ) -> Vec<u64> {
        match e {
            ProviderError::Unsupported => {
                self.have_provider_refs = false;
                self.info("The dump does not report outbound references, using fields only");
            }
            e => self.limited(MessageKind::ReferenceTarget, Severity::Warning, || {
                format!(
                    "Problem getting outbound references of {} {} at {}: {}",
                    what,
                    name,
                    format_address(address),
                    e
                )
            }),
        }
        refs
    }

    fn collect_refs(
        &mut self,
        entries: Entries<'_, ReferenceRecord>,
        found: &mut ProviderRefs,
        source: u64,
    ) {
        for entry in entries {
            found.any = true;
            let reference = match entry {
                Ok(r) => r,
                Err(e) => {
                    self.limited(MessageKind::ReferenceTarget, Severity::Warning, || {
                        format!(
                            "Corrupt reference from {}: {}",
                            format_address(source),
                            e
                        )
                    });
                    continue;
                }
            };
            let target = match reference.target {
                Ok(RefTarget::Object(a)) => a,
                Ok(RefTarget::Class(k)) => self.class_address(k),
                Ok(RefTarget::Null) => {
                    let description = reference.description;
                    self.limited(MessageKind::ReferenceTarget, Severity::Warning, || {
                        format!(
                            "Null target of reference {} from {}",
                            description,
                            format_address(source)
                        )
                    });
                    continue;
                }
                Err(e) => {
                    let description = reference.description;
                    self.limited(MessageKind::ReferenceTarget, Severity::Warning, || {
                        format!(
                            "Unable to read the target of reference {} from {}: {}",
                            description,
                            format_address(source),
                            e
                        )
                    });
                    continue;
                }
            };
            // the class object and the class point at each other
            if target == source
                && matches!(
                    reference.kind,
                    ReferenceKind::ClassObject | ReferenceKind::AssociatedClass
                )
            {
                continue;
            }
            found.insert(target, reference.description);
        }
    }

    fn compare_refs(
        &mut self,
        what: &str,
        name: &str,
        address: u64,
        refs: Vec<u64>,
        mut found: ProviderRefs,
    ) -> Vec<u64> {
        let id = self.ids.reverse(address);
        let ours: HashSet<u64> = refs.iter().copied().collect();
        for &target in &refs {
            if found.contains(target) {
                continue;
            }
            let target_id = self.ids.reverse(target);
            let target_desc = self.obj_desc(target);
            self.limited(MessageKind::MissingReference, Severity::Warning, || {
                format!(
                    "References from the dump of {} {} {:?} at {} miss {:?} at {} {}",
                    what,
                    name,
                    id,
                    format_address(address),
                    target_id,
                    format_address(target),
                    target_desc
                )
            });
        }
        let extras: Vec<u64> = found
            .order
            .iter()
            .copied()
            .filter(|t| !ours.contains(t))
            .collect();
        for target in extras {
            let target_id = self.ids.reverse(target);
            let target_desc = self.obj_desc(target);
            let description = found.descriptions[&target].clone();
            self.limited(MessageKind::ExtraReference, Severity::Warning, || {
                format!(
                    "References from the dump of {} {} {:?} at {} have extra {:?} at {} ({}) {}",
                    what,
                    name,
                    id,
                    format_address(address),
                    target_id,
                    format_address(target),
                    description,
                    target_desc
                )
            });
            if target_id.is_none() {
                found.remove(target);
            }
        }

        if !self.use_provider_refs {
            return refs;
        }
        if found.order.is_empty() || !found.any {
            if !refs.is_empty() {
                self.limited(MessageKind::AllReferencesMissing, Severity::Warning, || {
                    format!(
                        "The dump has no references for {} {:?} at {}, using the ones found",
                        name,
                        id,
                        format_address(address)
                    )
                });
            }
            refs
        } else {
            found.order
        }
    }

    /// Marks every known target of `refs` as referenced
    pub(super) fn add_refs(&mut self, refs: &[u64]) {
        for &address in refs {
            if let Some(id) = self.ids.reverse(address) {
                self.refd.insert(id);
            }
        }
    }

    /// Stack roots of the thread object `id` become its references when
    /// they are kept per thread
    pub(super) fn add_thread_refs(&self, id: usize, refs: &mut Vec<u64>) {
        if !self.policy.use_thread_refs_not_roots {
            return;
        }
        if let Some(roots) = self.roots.threads.get(&id) {
            refs.extend(roots.keys().map(|&root| self.ids.get(root)));
        }
    }

    /// A short description of what lives at `address`, for messages
    fn obj_desc(&self, address: u64) -> String {
        let Some(id) = self.ids.reverse(address) else {
            return String::new();
        };
        if let Some(class) = self.classes.get(&id) {
            return format!("class {}", class.name);
        }
        match self
            .object_to_class
            .get(id)
            .copied()
            .flatten()
            .and_then(|c| self.classes.get(&c))
        {
            Some(class) => format!("of type {} at {}", class.name, format_address(address)),
            None => String::new(),
        }
    }
}
