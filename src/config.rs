//! Process-lifetime configuration, fixed at bootstrap and read-only after.
//!
//! Collects everything the loader needs to know about the process it is
//! linking: the main executable, the argument vectors handed to
//! initializers, the active platform, the security posture, and the
//! `DYLD_*` environment overrides.

use std::sync::Arc;

use crate::cache::DyldCache;
use crate::mach::Arch;

pub const PLATFORM_MACOS: u32 = 1;
pub const PLATFORM_IOS: u32 = 2;
pub const PLATFORM_TVOS: u32 = 3;
pub const PLATFORM_WATCHOS: u32 = 4;
pub const PLATFORM_BRIDGEOS: u32 = 5;
pub const PLATFORM_MACCATALYST: u32 = 6;
pub const PLATFORM_IOS_SIMULATOR: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform(pub u32);

impl Platform {
    pub fn is_simulator(self) -> bool {
        matches!(self.0, PLATFORM_IOS_SIMULATOR | 8 | 9)
    }

    pub fn is_catalyst(self) -> bool {
        self.0 == PLATFORM_MACCATALYST
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            PLATFORM_MACOS => "macOS",
            PLATFORM_IOS => "iOS",
            PLATFORM_TVOS => "tvOS",
            PLATFORM_WATCHOS => "watchOS",
            PLATFORM_BRIDGEOS => "bridgeOS",
            PLATFORM_MACCATALYST => "Mac Catalyst",
            PLATFORM_IOS_SIMULATOR => "iOS simulator",
            _ => "unknown",
        }
    }
}

bitflags::bitflags! {
    /// `DYLD_PRINT_*` gates. Emission goes through the `log` facade; the
    /// flags keep the hot paths silent unless the user asked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LogFlags: u32 {
        const LIBRARIES = 1 << 0;
        const SEGMENTS = 1 << 1;
        const FIXUPS = 1 << 2;
        const BINDINGS = 1 << 3;
        const APIS = 1 << 4;
        const INITIALIZERS = 1 << 5;
        const SEARCHING = 1 << 6;
        const INTERPOSING = 1 << 7;
    }
}

/// Security posture derived from entitlements and AMFI flags. Restricted
/// processes refuse `@`-path expansion and environment path overrides.
#[derive(Debug, Clone, Copy)]
pub struct Security {
    pub allow_at_paths: bool,
    pub allow_env_vars_path: bool,
    pub allow_insert_failures: bool,
    pub allow_interposing: bool,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            allow_at_paths: true,
            allow_env_vars_path: true,
            allow_insert_failures: false,
            allow_interposing: true,
        }
    }
}

/// Search-path override policy from the `DYLD_*` environment.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub library_paths: Vec<String>,     // DYLD_LIBRARY_PATH
    pub framework_paths: Vec<String>,   // DYLD_FRAMEWORK_PATH
    pub fallback_paths: Vec<String>,    // DYLD_FALLBACK_LIBRARY_PATH
    pub root_paths: Vec<String>,        // DYLD_ROOT_PATH (simulator)
    pub insert_paths: Vec<String>,      // DYLD_INSERT_LIBRARIES
    /// true when any DYLD_* variable was set; disables prebuilt saving
    pub env_vars_used: bool,
}

/// Which variant of a load path a candidate came from, reported to the
/// path callback so diagnostics can say how the path was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathVariant {
    PathDirOverride,
    RawPath,
    RpathExpansion,
    LoaderPathExpansion,
    ExecutablePathExpansion,
    Fallback,
}

impl PathOverrides {
    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(':')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Build from an environment vector of `KEY=VALUE` strings.
    pub fn from_environ<S: AsRef<str>>(environ: &[S]) -> Self {
        let mut po = Self::default();
        for entry in environ {
            let entry = entry.as_ref();
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                "DYLD_LIBRARY_PATH" => po.library_paths = Self::parse_list(value),
                "DYLD_FRAMEWORK_PATH" => po.framework_paths = Self::parse_list(value),
                "DYLD_FALLBACK_LIBRARY_PATH" => po.fallback_paths = Self::parse_list(value),
                "DYLD_ROOT_PATH" => po.root_paths = Self::parse_list(value),
                "DYLD_INSERT_LIBRARIES" => po.insert_paths = Self::parse_list(value),
                _ => {
                    if !key.starts_with("DYLD_") {
                        continue;
                    }
                }
            }
            po.env_vars_used = true;
        }
        po
    }

    /// Default fallback directories when DYLD_FALLBACK_LIBRARY_PATH is
    /// unset. Only consulted for leaf-name lookups.
    pub fn standard_fallbacks(&self, platform: Platform) -> &'static [&'static str] {
        if platform.0 == PLATFORM_MACOS || platform.is_catalyst() {
            &["/usr/local/lib", "/usr/lib"]
        } else {
            &["/usr/lib"]
        }
    }

    pub fn has_insert_paths(&self) -> bool {
        !self.insert_paths.is_empty()
    }
}

fn parse_log_flags<S: AsRef<str>>(environ: &[S]) -> LogFlags {
    let mut flags = LogFlags::empty();
    for entry in environ {
        let key = entry.as_ref().split_once('=').map_or(entry.as_ref(), |p| p.0);
        flags |= match key {
            "DYLD_PRINT_LIBRARIES" => LogFlags::LIBRARIES,
            "DYLD_PRINT_SEGMENTS" => LogFlags::SEGMENTS,
            "DYLD_PRINT_FIXUPS" => LogFlags::FIXUPS,
            "DYLD_PRINT_BINDINGS" => LogFlags::BINDINGS,
            "DYLD_PRINT_APIS" => LogFlags::APIS,
            "DYLD_PRINT_INITIALIZERS" => LogFlags::INITIALIZERS,
            "DYLD_PRINT_SEARCHING" => LogFlags::SEARCHING,
            "DYLD_PRINT_INTERPOSING" => LogFlags::INTERPOSING,
            _ => LogFlags::empty(),
        };
    }
    flags
}

/// Raw vectors handed to every initializer. The addresses are whatever
/// the kernel pushed on the stack; an embedding host may leave them zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramVars {
    pub mh: usize,
    pub argc: i32,
    pub argv: usize,
    pub envp: usize,
    pub apple: usize,
}

pub struct ProcessConfig {
    pub main_executable_path: String,
    /// where the kernel mapped the main executable
    pub main_executable_addr: usize,
    pub argv: Vec<String>,
    pub environ: Vec<String>,
    pub apple: Vec<String>,
    pub program_vars: ProgramVars,
    pub platform: Platform,
    pub arch: Arch,
    pub security: Security,
    pub path_overrides: PathOverrides,
    pub log: LogFlags,
    pub shared_cache: Option<Arc<DyldCache>>,
    pub dyld_uuid: [u8; 16],
    /// where this process persists its PrebuiltLoaderSet, when allowed
    pub prebuilt_loader_set_path: Option<String>,
    /// OS programs never save updated sets; policy switch, off by default
    pub allow_prebuilt_saving: bool,
}

impl ProcessConfig {
    pub fn new(main_executable_path: &str, platform: Platform, arch: Arch) -> Self {
        Self {
            main_executable_path: main_executable_path.to_owned(),
            main_executable_addr: 0,
            argv: vec![main_executable_path.to_owned()],
            environ: Vec::new(),
            apple: Vec::new(),
            program_vars: ProgramVars::default(),
            platform,
            arch,
            security: Security::default(),
            path_overrides: PathOverrides::default(),
            log: LogFlags::empty(),
            shared_cache: None,
            dyld_uuid: [0; 16],
            prebuilt_loader_set_path: None,
            allow_prebuilt_saving: false,
        }
    }

    /// Build from the kernel-provided vectors, applying the security
    /// policy to the environment: a restricted process has its `DYLD_*`
    /// variables ignored entirely.
    pub fn from_vectors(
        main_executable_path: &str,
        platform: Platform,
        arch: Arch,
        argv: Vec<String>,
        environ: Vec<String>,
        apple: Vec<String>,
        security: Security,
    ) -> Self {
        let (path_overrides, log) = if security.allow_env_vars_path {
            (PathOverrides::from_environ(&environ), parse_log_flags(&environ))
        } else {
            (PathOverrides::default(), LogFlags::empty())
        };
        Self {
            path_overrides,
            log,
            argv,
            environ,
            apple,
            security,
            ..Self::new(main_executable_path, platform, arch)
        }
    }

    pub fn main_executable_dir(&self) -> &str {
        parent_dir(&self.main_executable_path)
    }

    /// Dylibs that ship inside the shared cache are only stat'ed when the
    /// cache is a development one; customer caches trust their contents.
    pub fn is_customer_cache(&self) -> bool {
        self.shared_cache
            .as_ref()
            .is_some_and(|c| !c.development)
    }

    pub fn log_enabled(&self, flag: LogFlags) -> bool {
        self.log.contains(flag)
    }
}

/// Directory portion of a path, without the trailing slash.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Final component of a path.
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn environ_parsing_splits_colon_lists() {
        let po = PathOverrides::from_environ(&[
            "HOME=/Users/me",
            "DYLD_LIBRARY_PATH=/opt/lib:/usr/local/lib",
            "DYLD_INSERT_LIBRARIES=/tmp/tracer.dylib",
        ]);
        assert_eq!(po.library_paths, ["/opt/lib", "/usr/local/lib"]);
        assert_eq!(po.insert_paths, ["/tmp/tracer.dylib"]);
        assert!(po.env_vars_used);

        let none = PathOverrides::from_environ(&["HOME=/Users/me"]);
        assert!(!none.env_vars_used);
    }

    #[test]
    fn restricted_process_drops_env_overrides() {
        let config = ProcessConfig::from_vectors(
            "/bin/ls",
            Platform(PLATFORM_MACOS),
            Arch::Arm64,
            vec!["/bin/ls".into()],
            vec!["DYLD_LIBRARY_PATH=/evil".into()],
            vec![],
            Security {
                allow_env_vars_path: false,
                ..Security::default()
            },
        );
        assert!(config.path_overrides.library_paths.is_empty());
        assert!(!config.path_overrides.env_vars_used);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(parent_dir("/usr/lib/libz.dylib"), "/usr/lib");
        assert_eq!(parent_dir("/libz.dylib"), "/");
        assert_eq!(parent_dir("libz.dylib"), ".");
        assert_eq!(leaf_name("/usr/lib/libz.dylib"), "libz.dylib");
        assert_eq!(leaf_name("libz.dylib"), "libz.dylib");
    }
}
