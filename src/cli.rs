use crate::index::IndexPolicy;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
#[clap(rename_all = "verbatim")]
pub enum RootsChoice {
    /// Roots reported by the dump, when it reports any
    Provider,
    /// Roots found by scanning thread stacks
    Conservative,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(subcommand_precedence_over_arg = true)]
pub struct Args {
    #[arg(required = true)]
    pub paths: Vec<String>,

    #[arg(short, long, value_enum, default_value_t = RootsChoice::Provider)]
    pub roots: RootsChoice,

    /// Report stack roots as global roots instead of thread references
    #[arg(long, default_value_t = false)]
    pub thread_roots_global: bool,
    #[arg(long, default_value_t = false)]
    pub presume_roots: bool,
    #[arg(long, default_value_t = false)]
    pub mark_all_loaders: bool,
    #[arg(long, default_value_t = false)]
    pub no_system_class_roots: bool,
    #[arg(long, default_value_t = false)]
    pub keep_weak_roots: bool,
    #[arg(long, default_value_t = false)]
    pub no_guess_finalizables: bool,
    #[arg(long, default_value_t = false)]
    pub debug_info: bool,
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Parsed dumps kept in memory
    #[arg(short, long, default_value_t = 4)]
    pub cache_capacity: usize,

    /// Files written next to the index start with this, e.g. `<prefix>threads`
    #[arg(short, long, default_value = "")]
    pub prefix: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Args {
    pub fn policy(&self) -> IndexPolicy {
        IndexPolicy {
            use_provider_roots: self.roots == RootsChoice::Provider,
            use_thread_refs_not_roots: !self.thread_roots_global,
            presume_roots: self.presume_roots,
            mark_all_loaders: self.mark_all_loaders,
            use_system_class_roots: !self.no_system_class_roots,
            skip_weak_roots: !self.keep_weak_roots,
            guess_finalizables: !self.no_guess_finalizables,
            debug_info: self.debug_info,
            verbose: self.verbose,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ExportArgs {
    #[arg(short, long)]
    pub output_path: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build, trace and purge the index of each dump
    Index,
    /// Write the reference graph of one dump as CSV
    Export(ExportArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let args = Args::parse_from(["heap_indexer", "a.binpb.zst"]);
        assert_eq!(args.policy(), IndexPolicy::default());
        assert!(args.command.is_none());
    }

    #[test]
    fn test_policy_switches() {
        let args = Args::parse_from([
            "heap_indexer",
            "--roots",
            "Conservative",
            "--thread-roots-global",
            "--presume-roots",
            "--debug-info",
            "a.binpb.zst",
            "export",
            "-o",
            "edges.csv",
        ]);
        let policy = args.policy();
        assert!(!policy.use_provider_roots);
        assert!(!policy.use_thread_refs_not_roots);
        assert!(policy.presume_roots);
        assert!(policy.debug_info);
        assert!(matches!(args.command, Some(Commands::Export(ref e)) if e.output_path == "edges.csv"));
    }
}
