//! Runtime configuration.
//!
//! The runtime has exactly one tunable that is not a constructor parameter:
//! the default coroutine stack size. It resolves in this order (highest
//! priority first):
//!
//! 1. **Programmatic**: an explicit size passed to
//!    [`Coroutine::with_stack_size`](crate::Coroutine::with_stack_size)
//! 2. **Environment**: the [`ENV_STACK_SIZE`] variable, in bytes
//! 3. **Default**: [`DEFAULT_STACK_SIZE`] (128 KiB)
//!
//! The environment variable is read once and cached for the lifetime of the
//! process. An unparseable value is logged and ignored. Resolved values are
//! normalized up to one page.

use std::sync::OnceLock;
use tracing::warn;

/// Default coroutine stack size: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Environment variable overriding the default coroutine stack size (bytes).
pub const ENV_STACK_SIZE: &str = "CORIO_STACK_SIZE";

static STACK_SIZE: OnceLock<usize> = OnceLock::new();

/// Returns the default coroutine stack size for this process.
#[must_use]
pub fn stack_size() -> usize {
    *STACK_SIZE.get_or_init(|| resolve(std::env::var(ENV_STACK_SIZE).ok().as_deref()))
}

/// Resolves a raw env value (if any) into a normalized stack size.
fn resolve(raw: Option<&str>) -> usize {
    let requested = match raw {
        None => DEFAULT_STACK_SIZE,
        Some(val) => match val.trim().parse::<usize>() {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    value = val,
                    error = %e,
                    "invalid {ENV_STACK_SIZE}: expected a byte count, using default"
                );
                DEFAULT_STACK_SIZE
            }
        },
    };
    normalize(requested)
}

/// Rounds a requested size up to at least one page.
fn normalize(size: usize) -> usize {
    size.max(crate::stack::page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_128k() {
        assert_eq!(resolve(None), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn env_value_parses() {
        assert_eq!(resolve(Some("262144")), 256 * 1024);
        assert_eq!(resolve(Some(" 262144 ")), 256 * 1024);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        assert_eq!(resolve(Some("lots")), DEFAULT_STACK_SIZE);
        assert_eq!(resolve(Some("")), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn tiny_sizes_normalize_to_a_page() {
        let page = crate::stack::page_size();
        assert_eq!(resolve(Some("1")), page);
        assert_eq!(normalize(0), page);
    }
}
