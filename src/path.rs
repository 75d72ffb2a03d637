//! Load-path expansion.
//!
//! Turns the textual path in a load command (or dlopen call) into the
//! sequence of candidate filesystem paths to probe: `DYLD_*` overrides
//! first, then the `@loader_path`/`@executable_path`/`@rpath` expansions
//! against the rpath stack, then fallback directories. The callback gets
//! each candidate with a stop flag; security policy gates individual
//! branches and leaves a note in the diagnostics buffer when it refuses
//! one.

use crate::config::{PathVariant, leaf_name, parent_dir};
use crate::errors::{Diagnostics, LoadError};
use crate::loader::{LoadChain, LoadOptions};
use crate::state::RuntimeState;

pub type PathHandler<'h> = dyn FnMut(&mut Diagnostics, &str, PathVariant, &mut bool) + 'h;

/// Expands `requested_path` and invokes `handler` per candidate.
/// Returns true when the handler stopped the walk (accepted a path).
pub fn for_each_path(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    requested_path: &str,
    options: &LoadOptions<'_>,
    handler: &mut PathHandler<'_>,
) -> bool {
    let mut stop = false;

    // 1. DYLD_LIBRARY_PATH / DYLD_FRAMEWORK_PATH claim every load of a
    // matching leaf name, whatever directory was asked for
    let overrides = &state.config.path_overrides;
    let leaf = leaf_name(requested_path);
    let override_dirs = if is_framework_path(requested_path) {
        &overrides.framework_paths
    } else {
        &overrides.library_paths
    };
    for dir in override_dirs {
        let candidate = format!("{dir}/{leaf}");
        handler(diag, &candidate, PathVariant::PathDirOverride, &mut stop);
        if stop {
            return true;
        }
    }

    // 2. the requested path itself, with @-prefix expansion
    if requested_path.starts_with("@loader_path/") {
        expand_loader_path(diag, state, requested_path, options, false, handler, &mut stop);
    } else if requested_path.starts_with("@executable_path/") {
        expand_executable_path(diag, state, requested_path, false, handler, &mut stop);
    } else if requested_path.starts_with("@rpath/") {
        expand_rpath(diag, state, requested_path, options, handler, &mut stop);
    } else {
        // simulator-style roots first, then the raw path
        for root in &overrides.root_paths {
            let candidate = format!("{root}{requested_path}");
            handler(diag, &candidate, PathVariant::RawPath, &mut stop);
            if stop {
                return true;
            }
        }
        handler(diag, requested_path, PathVariant::RawPath, &mut stop);
    }
    if stop {
        return true;
    }

    // 3. fallback directories, leaf name only
    if options.use_fallback_paths {
        let fallbacks: Vec<String> = if overrides.fallback_paths.is_empty() {
            overrides
                .standard_fallbacks(state.config.platform)
                .iter()
                .map(|s| (*s).to_owned())
                .collect()
        } else {
            overrides.fallback_paths.clone()
        };
        for dir in fallbacks {
            let candidate = format!("{dir}/{leaf}");
            if candidate == requested_path {
                continue;
            }
            handler(diag, &candidate, PathVariant::Fallback, &mut stop);
            if stop {
                return true;
            }
        }
    }

    false
}

fn is_framework_path(path: &str) -> bool {
    path.contains(".framework/")
}

/// The image issuing the load: top of the rpath stack.
fn loading_image_dir(state: &RuntimeState, options: &LoadOptions<'_>) -> Option<String> {
    match options.rpath_stack {
        Some(chain) => Some(parent_dir(chain.image.path()).to_owned()),
        None => Some(state.config.main_executable_dir().to_owned()),
    }
}

fn expand_loader_path(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    path: &str,
    options: &LoadOptions<'_>,
    from_lc_rpath_of_main: bool,
    handler: &mut PathHandler<'_>,
    stop: &mut bool,
) {
    if !state.config.security.allow_at_paths && from_lc_rpath_of_main {
        diag.error(&LoadError::SecurityPolicy {
            reason: format!("@loader_path in LC_RPATH of main executable not allowed ('{path}')"),
        });
        return;
    }
    if let Some(dir) = loading_image_dir(state, options) {
        let tail = &path["@loader_path".len()..];
        let candidate = format!("{dir}{tail}");
        handler(diag, &candidate, PathVariant::LoaderPathExpansion, stop);
    }
}

fn expand_executable_path(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    path: &str,
    from_lc_rpath: bool,
    handler: &mut PathHandler<'_>,
    stop: &mut bool,
) {
    if !state.config.security.allow_at_paths && from_lc_rpath {
        diag.error(&LoadError::SecurityPolicy {
            reason: format!("@executable_path in LC_RPATH not allowed ('{path}')"),
        });
        return;
    }
    let tail = &path["@executable_path".len()..];
    let candidate = format!("{}{tail}", state.config.main_executable_dir());
    handler(diag, &candidate, PathVariant::ExecutablePathExpansion, stop);
}

/// Walks every `LC_RPATH` of every image on the load chain, innermost
/// first, expanding each entry and appending the `@rpath/` tail.
fn expand_rpath(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    path: &str,
    options: &LoadOptions<'_>,
    handler: &mut PathHandler<'_>,
    stop: &mut bool,
) {
    let tail = &path["@rpath".len()..];
    let main_loader = state.main_loader();

    let mut chain = options.rpath_stack;
    while let Some(link) = chain {
        let is_main = main_loader
            .as_ref()
            .is_some_and(|m| std::sync::Arc::ptr_eq(m, &link.image));
        for rpath in link.image.rpaths() {
            expand_one_rpath_entry(
                diag, state, &rpath, tail, options, link, is_main, handler, stop,
            );
            if *stop {
                return;
            }
        }
        chain = link.previous;
    }

    // dlopen with no chain still honors the main executable's rpaths
    if options.rpath_stack.is_none() {
        if let Some(main) = &main_loader {
            let link = LoadChain {
                previous: None,
                image: std::sync::Arc::clone(main),
            };
            for rpath in main.rpaths() {
                expand_one_rpath_entry(
                    diag, state, &rpath, tail, options, &link, true, handler, stop,
                );
                if *stop {
                    return;
                }
            }
        }
    }
}

fn expand_one_rpath_entry(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    rpath: &str,
    tail: &str,
    options: &LoadOptions<'_>,
    link: &LoadChain<'_>,
    from_main: bool,
    handler: &mut PathHandler<'_>,
    stop: &mut bool,
) {
    if let Some(rest) = rpath.strip_prefix("@loader_path") {
        if !state.config.security.allow_at_paths && from_main {
            diag.error(&LoadError::SecurityPolicy {
                reason: format!("@loader_path in LC_RPATH of main executable not allowed ('{rpath}')"),
            });
            return;
        }
        let dir = parent_dir(link.image.path());
        let candidate = format!("{dir}{rest}{tail}");
        handler(diag, &candidate, PathVariant::RpathExpansion, stop);
    } else if let Some(rest) = rpath.strip_prefix("@executable_path") {
        if !state.config.security.allow_at_paths {
            diag.error(&LoadError::SecurityPolicy {
                reason: format!("@executable_path in LC_RPATH not allowed ('{rpath}')"),
            });
            return;
        }
        let candidate = format!("{}{rest}{tail}", state.config.main_executable_dir());
        handler(diag, &candidate, PathVariant::RpathExpansion, stop);
    } else {
        let candidate = format!("{rpath}{tail}");
        handler(diag, &candidate, PathVariant::RpathExpansion, stop);
        if *stop {
            return;
        }
        // Catalyst processes also look under the iOSSupport prefix for
        // absolute rpath entries
        if state.config.platform.is_catalyst() && rpath.starts_with('/') {
            let candidate = format!("/System/iOSSupport{rpath}{tail}");
            handler(diag, &candidate, PathVariant::RpathExpansion, stop);
        }
    }
    let _ = options;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PLATFORM_MACCATALYST, PLATFORM_MACOS, Platform, ProcessConfig, Security};
    use crate::loader::jit::make_test_loader;
    use crate::mach::Arch;
    use crate::syscall::test_shim::AnonShim;
    use std::sync::Arc;

    fn test_state(mutate: impl FnOnce(&mut ProcessConfig)) -> RuntimeState {
        let mut config = ProcessConfig::new("/app/MyApp", Platform(PLATFORM_MACOS), Arch::Arm64);
        mutate(&mut config);
        RuntimeState::new(Arc::new(config), Arc::new(AnonShim))
    }

    fn collect_paths(state: &RuntimeState, path: &str, options: &LoadOptions<'_>) -> Vec<String> {
        let mut diag = Diagnostics::new();
        let mut out = Vec::new();
        for_each_path(&mut diag, state, path, options, &mut |_, candidate, _, _| {
            out.push(candidate.to_owned());
        });
        out
    }

    #[test]
    fn library_path_override_comes_first() {
        let state = test_state(|c| {
            c.path_overrides.library_paths = vec!["/override".into()];
        });
        let paths = collect_paths(
            &state,
            "/usr/lib/libfoo.dylib",
            &LoadOptions::default(),
        );
        assert_eq!(paths[0], "/override/libfoo.dylib");
        assert_eq!(paths[1], "/usr/lib/libfoo.dylib");
    }

    #[test]
    fn executable_path_expansion() {
        let state = test_state(|_| {});
        let paths = collect_paths(
            &state,
            "@executable_path/../Frameworks/libbar.dylib",
            &LoadOptions::default(),
        );
        assert_eq!(paths[0], "/app/../Frameworks/libbar.dylib");
    }

    #[test]
    fn loader_path_uses_requesting_image_dir() {
        let state = test_state(|_| {});
        let loader = make_test_loader("/pkg/lib/libdep.dylib", vec![]);
        let chain = LoadChain {
            previous: None,
            image: loader,
        };
        let options = LoadOptions {
            rpath_stack: Some(&chain),
            ..Default::default()
        };
        let paths = collect_paths(&state, "@loader_path/libsib.dylib", &options);
        assert_eq!(paths[0], "/pkg/lib/libsib.dylib");
    }

    #[test]
    fn rpath_walks_stack_and_expands_entries() {
        let state = test_state(|_| {});
        let loader = make_test_loader(
            "/pkg/lib/libdep.dylib",
            vec!["@loader_path/../Frameworks".into(), "/opt/rpath".into()],
        );
        let chain = LoadChain {
            previous: None,
            image: loader,
        };
        let options = LoadOptions {
            rpath_stack: Some(&chain),
            ..Default::default()
        };
        let paths = collect_paths(&state, "@rpath/libz.dylib", &options);
        assert_eq!(paths[0], "/pkg/lib/../Frameworks/libz.dylib");
        assert_eq!(paths[1], "/opt/rpath/libz.dylib");
    }

    #[test]
    fn catalyst_adds_ios_support_prefix() {
        let state = test_state(|c| {
            c.platform = Platform(PLATFORM_MACCATALYST);
        });
        let loader = make_test_loader("/pkg/libdep.dylib", vec!["/usr/lib/swift".into()]);
        let chain = LoadChain {
            previous: None,
            image: loader,
        };
        let options = LoadOptions {
            rpath_stack: Some(&chain),
            ..Default::default()
        };
        let paths = collect_paths(&state, "@rpath/libswiftCore.dylib", &options);
        assert!(paths.contains(&"/usr/lib/swift/libswiftCore.dylib".to_owned()));
        assert!(paths.contains(&"/System/iOSSupport/usr/lib/swift/libswiftCore.dylib".to_owned()));
    }

    #[test]
    fn restricted_process_refuses_at_paths_from_main_rpath() {
        let state = test_state(|c| {
            c.security = Security {
                allow_at_paths: false,
                ..Security::default()
            };
        });
        let main = make_test_loader("/app/MyApp", vec!["@loader_path/Frameworks".into()]);
        state.set_main_loader(Arc::clone(&main));
        let chain = LoadChain {
            previous: None,
            image: main,
        };
        let options = LoadOptions {
            rpath_stack: Some(&chain),
            ..Default::default()
        };
        let mut diag = Diagnostics::new();
        let mut candidates = Vec::new();
        for_each_path(
            &mut diag,
            &state,
            "@rpath/libz.dylib",
            &options,
            &mut |_, candidate, _, _| candidates.push(candidate.to_owned()),
        );
        assert!(candidates.is_empty());
        assert!(diag.message().contains("not allowed"));
    }

    #[test]
    fn fallback_paths_use_leaf_name() {
        let state = test_state(|_| {});
        let options = LoadOptions {
            use_fallback_paths: true,
            ..Default::default()
        };
        let paths = collect_paths(&state, "/weird/place/libuv.dylib", &options);
        assert!(paths.contains(&"/usr/local/lib/libuv.dylib".to_owned()));
        assert!(paths.contains(&"/usr/lib/libuv.dylib".to_owned()));
    }
}
