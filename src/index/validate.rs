use super::{format_address, PreliminaryIndex, RootMap};

/// Counts problems and passes each one on as a message
struct Problems<F: FnMut(String)> {
    count: usize,
    report: F,
}

impl<F: FnMut(String)> Problems<F> {
    fn add(&mut self, msg: String) {
        self.count += 1;
        (self.report)(msg);
    }
}

/// Checks the internal consistency of a finished index. Returns the number
/// of problems found, each of which has been handed to `report`.
pub fn validate(index: &PreliminaryIndex, report: impl FnMut(String)) -> usize {
    let mut problems = Problems { count: 0, report };
    let ids = &index.identifiers;
    let len = ids.len();

    for id in 1..len {
        if ids.get(id - 1) >= ids.get(id) {
            problems.add(format!(
                "Identifier {} at {} is not above {}",
                id,
                format_address(ids.get(id)),
                format_address(ids.get(id - 1))
            ));
        }
    }
    for id in 0..len {
        if ids.reverse(ids.get(id)) != Some(id) {
            problems.add(format!(
                "Address {} of identifier {} does not map back to it",
                format_address(ids.get(id)),
                id
            ));
        }
    }

    if index.object_to_class.len() != len {
        problems.add(format!(
            "Object to class map has {} entries for {} identifiers",
            index.object_to_class.len(),
            len
        ));
    }
    for (id, class) in index.object_to_class.iter().enumerate() {
        match class {
            Some(c) if index.classes.contains_key(c) => {}
            Some(c) => problems.add(format!("Identifier {} has unknown class {}", id, c)),
            None => problems.add(format!("Identifier {} has no class", id)),
        }
    }

    for (&id, &size) in &index.array_to_size {
        if id >= len {
            problems.add(format!("Array size recorded for unknown identifier {}", id));
        }
        if size < 0 {
            problems.add(format!("Array {} has negative size {}", id, size));
        }
    }

    for (&id, class) in &index.classes {
        if class.id != id {
            problems.add(format!("Class {} is stored under identifier {}", class.name, id));
        }
        if id >= len || ids.get(id) != class.address {
            problems.add(format!(
                "Class {} at {} does not match identifier {}",
                class.name,
                format_address(class.address),
                id
            ));
        }
        match class.loader_id {
            Some(l) if l < len && ids.get(l) == class.loader_address => {}
            _ => problems.add(format!(
                "Class {} has loader {:?} which is not at {}",
                class.name,
                class.loader_id,
                format_address(class.loader_address)
            )),
        }
        match class.super_id {
            Some(s) if s < len && ids.get(s) == class.super_address => {}
            None if class.super_address == 0 => {}
            _ => problems.add(format!(
                "Class {} has superclass {:?} which is not at {}",
                class.name,
                class.super_id,
                format_address(class.super_address)
            )),
        }
        match class.class_id {
            Some(c) if index.classes.contains_key(&c) => {}
            _ => problems.add(format!("Class {} has no class of its own", class.name)),
        }
    }

    let mut check_roots = |what: &str, roots: &RootMap| {
        for (&id, list) in roots {
            for root in list {
                if root.object_id != id || id >= len || ids.get(id) != root.object_address {
                    problems.add(format!(
                        "{} root of {} at {} is filed under {}",
                        what,
                        root.object_id,
                        format_address(root.object_address),
                        id
                    ));
                }
            }
        }
    };
    check_roots("Global", &index.gc_roots);
    for roots in index.thread_roots.values() {
        check_roots("Thread", roots);
    }

    if index.outbound.len() != len {
        problems.add(format!(
            "Outbound references have {} entries for {} identifiers",
            index.outbound.len(),
            len
        ));
    }

    let instances: usize = index.classes.values().map(|c| c.instance_count).sum();
    if instances != len {
        problems.add(format!(
            "Classes count {} instances for {} identifiers",
            instances, len
        ));
    }
    problems.count
}
