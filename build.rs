use vergen_gitcl::{Emitter, Gitcl};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only the commit is embedded; tarball builds report the bare package version.
    let git = Gitcl::builder().sha(true).dirty(true).build();
    Emitter::default().add_instructions(&git)?.emit()?;
    Ok(())
}
