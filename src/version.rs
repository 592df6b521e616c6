//! Build identity: package version plus the git commit it was built from.

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

const GIT_SHA: Option<&str> = option_env!("VERGEN_GIT_SHA");
const GIT_DIRTY: Option<&str> = option_env!("VERGEN_GIT_DIRTY");

/// Short commit hash, if the crate was built from a git checkout.
pub fn commit() -> Option<&'static str> {
    GIT_SHA.map(|sha| &sha[..7.min(sha.len())])
}

/// `{version}` or `{version}+g{sha}[.dirty]`.
///
/// Reported by `GET /health` and logged when `mealsyncd` starts.
pub fn version_string() -> String {
    match commit() {
        Some(sha) => {
            let dirty = if GIT_DIRTY == Some("true") { ".dirty" } else { "" };
            format!("{PKG_VERSION}+g{sha}{dirty}")
        }
        None => PKG_VERSION.to_string(),
    }
}

/// `User-Agent` sent to the analysis server and to providers.
pub fn user_agent() -> String {
    format!("mealsync/{}", version_string())
}
