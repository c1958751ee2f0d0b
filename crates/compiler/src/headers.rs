//! Embedded stub system headers
//!
//! The bundled headers under `include/` are compiled into the binary so the
//! driver works with no installed support files. On-disk lookup (the include
//! search path) always wins; these are the fallback of last resort.

use std::path::PathBuf;

/// Embedded copies of the bundled headers, keyed by include name.
const EMBEDDED: &[(&str, &str)] = &[
    ("ctype.h", include_str!("../include/ctype.h")),
    ("errno.h", include_str!("../include/errno.h")),
    ("fcntl.h", include_str!("../include/fcntl.h")),
    ("stdarg.h", include_str!("../include/stdarg.h")),
    ("stdbool.h", include_str!("../include/stdbool.h")),
    ("stddef.h", include_str!("../include/stddef.h")),
    ("stdint.h", include_str!("../include/stdint.h")),
    ("stdio.h", include_str!("../include/stdio.h")),
    ("stdlib.h", include_str!("../include/stdlib.h")),
    ("string.h", include_str!("../include/string.h")),
    ("time.h", include_str!("../include/time.h")),
    ("unistd.h", include_str!("../include/unistd.h")),
    ("sys/stat.h", include_str!("../include/sys/stat.h")),
    ("sys/types.h", include_str!("../include/sys/types.h")),
];

/// Look up an embedded stub header by its include name (e.g. `sys/types.h`).
pub fn embedded_header(name: &str) -> Option<&'static str> {
    EMBEDDED
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, src)| *src)
}

/// Locate the on-disk bundled header directory, if any.
///
/// Search order: the `SLOTCC_INCLUDE` environment variable, then `include/`
/// next to the executable, then one level up (development builds), then the
/// current directory.
pub fn find_include_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SLOTCC_INCLUDE") {
        let path = PathBuf::from(path);
        if path.is_dir() {
            return Some(path);
        }
        eprintln!(
            "Warning: SLOTCC_INCLUDE is set to '{}' but that directory doesn't exist",
            path.display()
        );
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let inc = exe_dir.join("include");
            if inc.is_dir() {
                return Some(inc);
            }
            if let Some(parent) = exe_dir.parent() {
                let inc = parent.join("include");
                if inc.is_dir() {
                    return Some(inc);
                }
            }
        }
    }

    let local = PathBuf::from("include");
    if local.is_dir() {
        return Some(local.canonicalize().unwrap_or(local));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_lookup() {
        assert!(embedded_header("stdio.h").is_some());
        assert!(embedded_header("sys/types.h").is_some());
        assert!(embedded_header("nonexistent.h").is_none());
    }

    #[test]
    fn test_embedded_headers_have_guards() {
        for (name, src) in EMBEDDED {
            assert!(
                src.contains("#ifndef"),
                "header {} is missing its include guard",
                name
            );
        }
    }
}
