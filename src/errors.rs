//! Error taxonomy for the loader.
//!
//! Path resolution accumulates one [`LoadError`] per candidate path into a
//! [`Diagnostics`] buffer so that the final message enumerates every path
//! tried, the way dyld joins its per-candidate failures with commas.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: '{path}'")]
    FileNotFound { path: String },
    #[error("not a file: '{path}'")]
    NotAFile { path: String },
    #[error("file system sandbox blocked open() of '{path}'")]
    PermissionDenied { path: String },
    #[error("malformed mach-o at '{path}': {reason}")]
    MachOMalformed { path: String, reason: String },
    #[error("code signature in '{path}' not valid for use in process: {kernel_reason} (uuid {uuid})")]
    CodeSignatureInvalid {
        path: String,
        kernel_reason: String,
        uuid: String,
    },
    #[error("'{path}' has incompatible architecture, needed '{needed}' found '{found}'")]
    ArchitectureUnsupported {
        path: String,
        needed: &'static str,
        found: String,
    },
    #[error("'{path}' was built for a different platform, needed {needed} found {found}")]
    PlatformMismatch {
        path: String,
        needed: String,
        found: String,
    },
    #[error("symbol not found: '{name}', expected in '{expected_in}', referenced from '{referenced_from}'")]
    SymbolMissing {
        name: String,
        expected_in: String,
        referenced_from: String,
    },
    #[error("library not loaded: '{path}', referenced from '{referenced_from}'")]
    DylibMissing {
        path: String,
        referenced_from: String,
    },
    #[error("security policy refused load: {reason}")]
    SecurityPolicy { reason: String },
    // Internal only. Silently demotes a PrebuiltLoaderSet to a
    // just-in-time launch, never user visible.
    #[error("prebuilt loader invalid: {reason}")]
    PrebuiltLoaderInvalid { reason: String },
    #[error("{0}")]
    Other(String),
}

/// How a launch failure is reported to the crash reporter via
/// `all_image_infos.errorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    DylibMissing,
    SymbolMissing,
}

/// Structured launch-failure record surfaced by [`crate::state::RuntimeState`].
#[derive(Debug, Clone, Default)]
pub struct LaunchErrorInfo {
    pub kind: Option<LaunchErrorKind>,
    pub client_of_dylib_path: String,
    pub target_dylib_path: String,
    pub symbol: Option<String>,
}

/// Accumulates per-candidate failures during a single load request.
///
/// The buffer is cleared before returning when the request was allowed to
/// fail (weak import, `canBeMissing`, `RTLD_NOLOAD`).
#[derive(Debug, Default)]
pub struct Diagnostics {
    buffer: String,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, err: &LoadError) {
        self.note(&err.to_string());
    }

    pub fn note(&mut self, msg: &str) {
        if !self.buffer.is_empty() {
            self.buffer.push_str(", ");
        }
        self.buffer.push_str(msg);
    }

    pub fn has_error(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Soft-failure paths clear accumulated text before returning.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn message(&self) -> &str {
        &self.buffer
    }

    pub fn take_message(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accumulates_comma_separated() {
        let mut diag = Diagnostics::new();
        diag.error(&LoadError::FileNotFound {
            path: "/usr/lib/libfoo.dylib".into(),
        });
        diag.error(&LoadError::FileNotFound {
            path: "/opt/lib/libfoo.dylib".into(),
        });
        assert_eq!(
            diag.message(),
            "file not found: '/usr/lib/libfoo.dylib', file not found: '/opt/lib/libfoo.dylib'"
        );
        diag.clear();
        assert!(!diag.has_error());
    }
}
