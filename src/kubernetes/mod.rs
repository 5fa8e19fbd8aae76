//! Cluster-facing helpers: resource identity, pluralisation, and the
//! dynamic watch scheduler.

mod meta;
mod scheduler;

pub use meta::{MetaKey, ParseMetaError};
pub use scheduler::{EventHandler, WatchScheduler};

/// Maps a resource kind to the plural used in API paths and RBAC rules.
///
/// Deterministic rules only; the handful of kinds that inflect
/// irregularly (already-plural `Endpoints`) are special-cased.
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("endpoints") {
        return lower;
    }
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{lower}es");
    }
    if let Some(stem) = lower.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{stem}ies");
        }
    }
    format!("{lower}s")
}
