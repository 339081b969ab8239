use std::io::Result;

fn main() -> Result<()> {
    prost_build::compile_protos(&["./src/heapdump.proto"], &["./src"])?;
    // exposes GIT_COMMIT_HASH / GIT_DIRTY to main.rs through built_info
    built::write_built_file().expect("Failed to acquire build-time information");
    Ok(())
}
