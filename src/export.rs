use crate::index::PreliminaryIndex;
use anyhow::Result;
use std::io::Write;

/// Writes the outbound reference graph as `source,target` addresses, one
/// line per edge
pub fn export(index: &PreliminaryIndex, mut out: impl Write) -> Result<usize> {
    let ids = &index.identifiers;
    let mut edges = 0;
    writeln!(out, "source,target")?;
    for (id, targets) in index.outbound.iter().enumerate() {
        for &target in targets {
            writeln!(out, "{},{}", ids.get(id), ids.get(target))?;
            edges += 1;
        }
    }
    out.flush()?;
    Ok(edges)
}
