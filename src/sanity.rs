use crate::index::PreliminaryIndex;
use fixedbitset::FixedBitSet;

/// Marks every id reachable from the global roots of `index` through its
/// outbound references. Thread roots are reached through their thread.
pub fn sanity_trace(index: &PreliminaryIndex) -> FixedBitSet {
    let len = index.identifiers.len();
    let mut reachable = FixedBitSet::with_capacity(len);
    let mut mark_stack: Vec<usize> = index.gc_roots.keys().copied().collect();
    while let Some(id) = mark_stack.pop() {
        if id >= len || reachable.put(id) {
            continue;
        }
        if let Some(targets) = index.outbound.get(id) {
            mark_stack.extend(targets.iter().copied().filter(|&t| !reachable.contains(t)));
        }
    }
    reachable
}

/// New id of every old id once unreachable ones are dropped, -1 for those
pub fn purge_mapping(reachable: &FixedBitSet) -> Vec<i32> {
    let mut next = 0;
    (0..reachable.len())
        .map(|id| {
            if reachable.contains(id) {
                next += 1;
                next - 1
            } else {
                -1
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{GcRootInfo, IdentifierTable, RootType};
    use smallvec::smallvec;

    fn index(edges: &[(usize, usize)], roots: &[usize], len: usize) -> PreliminaryIndex {
        let mut identifiers = IdentifierTable::new();
        for id in 0..len {
            identifiers.add(0x1000 + id as u64 * 0x10);
        }
        identifiers.sort();
        let mut outbound = vec![vec![]; len];
        for &(from, to) in edges {
            outbound[from].push(to);
        }
        let mut index = PreliminaryIndex {
            identifiers,
            outbound,
            ..Default::default()
        };
        for &id in roots {
            let address = index.identifiers.get(id);
            index.gc_roots.insert(
                id,
                smallvec![GcRootInfo {
                    object_address: address,
                    object_id: id,
                    context_address: address,
                    context_id: Some(id),
                    root_type: RootType::Unknown,
                }],
            );
        }
        index
    }

    #[test]
    fn test_sanity_trace_follows_cycles() {
        let index = index(&[(0, 1), (1, 2), (2, 1), (3, 4)], &[0], 5);
        let reachable = sanity_trace(&index);
        assert_eq!(reachable.ones().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(purge_mapping(&reachable), vec![0, 1, 2, -1, -1]);
    }

    #[test]
    fn test_everything_rooted() {
        let index = index(&[(1, 0)], &[1, 2], 3);
        let reachable = sanity_trace(&index);
        assert_eq!(purge_mapping(&reachable), vec![0, 1, 2]);
    }
}
