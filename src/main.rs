#[macro_use]
extern crate log;

use std::fs::File;
use std::io::BufWriter;
use std::time::Instant;

use anyhow::{anyhow, ensure, Result};
use clap::Parser;

use heap_indexer::*;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

struct DumpStats {
    objects: usize,
    classes: usize,
    roots: usize,
    thread_roots: usize,
    purged: usize,
    freed_bytes: i64,
    ms: u128,
}

fn build(
    path: &str,
    cache: &SharedCache,
    args: &Args,
    listener: &mut LogListener,
) -> Result<(IndexBuilder, PreliminaryIndex)> {
    let mut builder = IndexBuilder::new(cache.clone(), args.policy());
    builder.init(path, &args.prefix);
    let mut sink = CollectingSink::default();
    builder.fill(&mut sink, listener)?;
    let index = sink
        .index
        .ok_or_else(|| anyhow!("No index committed for {}", path))?;
    Ok((builder, index))
}

fn index_main(args: &Args, cache: &SharedCache) -> Result<()> {
    let mut listener = LogListener::new();
    let mut stats = vec![];
    for path in &args.paths {
        let start = Instant::now();
        let (mut builder, index) = build(path, cache, args, &mut listener)?;
        let reachable = sanity_trace(&index);
        info!(
            "Sanity trace reporting {} of {} identifiers reachable",
            reachable.count_ones(..),
            index.identifiers.len()
        );
        let mapping = purge_mapping(&reachable);
        let purged = builder.clean(Some(mapping.as_slice()), &mut listener)?;
        let elapsed = start.elapsed();
        info!("Finished {} in {} ms", path, elapsed.as_millis());
        stats.push(DumpStats {
            objects: index.object_count(),
            classes: index.classes.len(),
            roots: index.gc_roots.len(),
            thread_roots: index.thread_roots.values().map(|m| m.len()).sum(),
            purged: purged.purged,
            freed_bytes: purged.freed_bytes,
            ms: elapsed.as_millis(),
        });
    }

    println!("============================ Tabulate Statistics ============================");
    println!("objects\tclasses\troots\tthread_roots\tpurged\tfreed_bytes\ttime");
    for s in &stats {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            s.objects, s.classes, s.roots, s.thread_roots, s.purged, s.freed_bytes, s.ms
        );
    }
    println!("-------------------------- End Tabulate Statistics --------------------------");
    Ok(())
}

fn export_main(args: &Args, export_args: &ExportArgs, cache: &SharedCache) -> Result<()> {
    ensure!(
        args.paths.len() == 1,
        "Can only export one heap dump at a time"
    );
    let mut listener = LogListener::new();
    let (_, index) = build(&args.paths[0], cache, args, &mut listener)?;
    let out = BufWriter::new(File::create(&export_args.output_path)?);
    let edges = export(&index, out)?;
    info!("Wrote {} edges to {}", edges, export_args.output_path);
    Ok(())
}

fn get_git_info() -> String {
    match (built_info::GIT_COMMIT_HASH, built_info::GIT_DIRTY) {
        (Some(hash), Some(dirty)) => format!(
            "{}{}",
            hash.split_at(7).0,
            if dirty { "-dirty" } else { "" }
        ),
        (Some(hash), None) => format!("{}{}", hash.split_at(7).0, "-?"),
        _ => "unknown-git-version".to_string(),
    }
}

pub fn main() -> Result<()> {
    env_logger::init();
    println!("heap_indexer {}", get_git_info());
    let args = Args::parse();
    let cache = ImageCache::new(args.cache_capacity).shared();
    match &args.command {
        Some(Commands::Export(export_args)) => export_main(&args, export_args, &cache),
        Some(Commands::Index) | None => index_main(&args, &cache),
    }
}
