//! End-to-end loader scenarios driven hermetically through the in-memory
//! syscall shim: launch, weak-def coalescing, interposition, the
//! dlopen/dlclose lifecycle, upward-dependency cycles, and
//! PrebuiltLoaderSet save/replay/invalidation.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use dyld_runtime::api::{DlsymHandle, DyldApis, RtldMode};
use dyld_runtime::config::{PLATFORM_MACOS, Platform, ProcessConfig};
use dyld_runtime::launch;
use dyld_runtime::mach::Arch;
use dyld_runtime::state::RuntimeState;

const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

struct TestProcess {
    fs: Arc<MockFs>,
    state: Arc<RuntimeState>,
    apis: DyldApis,
    main_base: usize,
}

fn boot(
    fs: Arc<MockFs>,
    main_path: &str,
    configure: impl FnOnce(&mut ProcessConfig),
) -> TestProcess {
    let main_bytes = fs.file_bytes(main_path).expect("main executable on disk");
    let main_base = kernel_map(fs.as_ref(), &main_bytes);

    let mut config = ProcessConfig::new(main_path, Platform(PLATFORM_MACOS), Arch::Arm64);
    config.main_executable_addr = main_base;
    configure(&mut config);

    let shim: Arc<dyn dyld_runtime::syscall::SyscallShim> = fs.clone();
    let state = Arc::new(RuntimeState::new(Arc::new(config), shim));
    state.set_helpers(MockHelpers::new());
    let apis = DyldApis::new(Arc::clone(&state));
    TestProcess {
        fs,
        state,
        apis,
        main_base,
    }
}

fn simple_libsystem() -> Vec<u8> {
    ImageBuilder::dylib(LIBSYSTEM)
        .export("_malloc", 0x500)
        .export("_free", 0x540)
        .build()
}

// ---- S1: trivial launch ----

#[test]
fn trivial_launch_binds_main_against_libsystem() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file(
        "/app/main",
        ImageBuilder::executable()
            .dep(LIBSYSTEM)
            .bind(0, 1, "_malloc")
            .build(),
    );

    let p = boot(fs, "/app/main", |_| {});
    let result = launch::launch(&p.state).expect("launch");

    // load order: main first, then its dependents depth-first
    assert_eq!(p.apis.image_count(), 2);
    assert_eq!(p.apis.image_name(0).as_deref(), Some("/app/main"));
    assert_eq!(p.apis.image_name(1).as_deref(), Some(LIBSYSTEM));

    let libsystem_base = p.apis.image_header(1).unwrap();
    assert_eq!(
        read_slot(p.main_base, bind_slot_vm_offset(0)),
        (libsystem_base + 0x500) as u64
    );
    assert_eq!(result.entry_addr, p.main_base + 0x800);

    // invariants: paths are non-empty, dependents carry valid magic, and
    // every non-weak dependent is in the loaded list
    p.state.with_loaded(|loaded| {
        for loader in loaded {
            assert!(loader.has_magic());
            assert!(!loader.path().is_empty());
            for i in 0..loader.dependent_count() {
                if let Some(dep) = loader.dependent(&p.state, i) {
                    assert!(dep.has_magic());
                    assert!(loaded.iter().any(|l| Arc::ptr_eq(l, &dep)));
                }
            }
        }
    });
}

#[test]
fn launch_fails_with_missing_dylib_diagnostic() {
    let fs = MockFs::new();
    fs.add_file(
        "/app/main",
        ImageBuilder::executable().dep("/usr/lib/libGone.dylib").build(),
    );
    let p = boot(fs, "/app/main", |_| {});
    let err = launch::launch(&p.state).err().expect("launch must fail");
    let msg = err.to_string();
    assert!(msg.contains("libGone"), "unexpected diagnostic: {msg}");

    let info = p.state.launch_error();
    assert_eq!(
        info.kind,
        Some(dyld_runtime::errors::LaunchErrorKind::DylibMissing)
    );
    assert_eq!(info.target_dylib_path, "/usr/lib/libGone.dylib");
    assert_eq!(info.client_of_dylib_path, "/app/main");
}

// ---- S2: weak-def coalescing ----

#[test]
fn weak_defs_coalesce_to_first_image_in_link_order() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    for lib in ["A", "B", "C"] {
        fs.add_file(
            &format!("/opt/lib{lib}.dylib"),
            ImageBuilder::dylib(&format!("/opt/lib{lib}.dylib"))
                .dep(LIBSYSTEM)
                .weak_export("__Z3foov", 0x500)
                .build(),
        );
    }
    fs.add_file(
        "/app/main",
        ImageBuilder::executable()
            .dep("/opt/libA.dylib")
            .dep("/opt/libB.dylib")
            .dep("/opt/libC.dylib")
            .bind(0, -3, "__Z3foov") // weak coalesced lookup
            .build(),
    );

    let p = boot(fs, "/app/main", |_| {});
    p.state.enable_weak_def_map();
    launch::launch(&p.state).expect("launch");

    let a_base = p.apis.image_header(1).unwrap();
    assert_eq!(p.apis.image_name(1).as_deref(), Some("/opt/libA.dylib"));
    assert_eq!(
        read_slot(p.main_base, bind_slot_vm_offset(0)),
        (a_base + 0x500) as u64
    );

    // the side map recorded the coalesced choice
    let map_entry = p.state.weak_def_map_lookup("__Z3foov").expect("map entry");
    assert_eq!(map_entry.target_loader.path(), "/opt/libA.dylib");
}

#[test]
fn non_weak_def_overrides_earlier_weak_ones() {
    let fs = MockFs::new();
    fs.add_file(
        "/opt/libA.dylib",
        ImageBuilder::dylib("/opt/libA.dylib")
            .weak_export("__Z3foov", 0x500)
            .build(),
    );
    fs.add_file(
        "/opt/libC.dylib",
        ImageBuilder::dylib("/opt/libC.dylib")
            .export("__Z3foov", 0x700)
            .build(),
    );
    fs.add_file(
        "/app/main",
        ImageBuilder::executable()
            .dep("/opt/libA.dylib")
            .dep("/opt/libC.dylib")
            .bind(0, -3, "__Z3foov")
            .build(),
    );

    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    let c_base = p.apis.image_header(2).unwrap();
    assert_eq!(p.apis.image_name(2).as_deref(), Some("/opt/libC.dylib"));
    assert_eq!(
        read_slot(p.main_base, bind_slot_vm_offset(0)),
        (c_base + 0x700) as u64
    );
}

// ---- S3: interposition ----

#[test]
fn interpose_rewrites_all_binds_except_interposer_itself() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file(
        "/opt/libI.dylib",
        ImageBuilder::dylib("/opt/libI.dylib")
            .dep(LIBSYSTEM)
            .export("_my_malloc", 0x600)
            .bind(0, 1, "_malloc")
            .interpose(0x600, "_malloc", 1)
            .build(),
    );
    fs.add_file(
        "/app/main",
        ImageBuilder::executable()
            .dep(LIBSYSTEM)
            .dep("/opt/libI.dylib")
            .bind(0, 1, "_malloc")
            .build(),
    );

    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    let libsystem_base = p.apis.image_header(1).unwrap();
    let i_base = p.apis.image_header(2).unwrap();
    assert_eq!(p.apis.image_name(2).as_deref(), Some("/opt/libI.dylib"));

    // main's malloc bind is rewritten to the interposer
    assert_eq!(
        read_slot(p.main_base, bind_slot_vm_offset(0)),
        (i_base + 0x600) as u64
    );
    // the interposer's own bind still reaches the real malloc
    assert_eq!(
        read_slot(i_base, bind_slot_vm_offset(0)),
        (libsystem_base + 0x500) as u64
    );
}

// ---- S4: dlopen / dlclose lifecycle ----

#[test]
fn dlopen_refcounts_and_reaper_sweep() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file(
        "/opt/libBar.dylib",
        ImageBuilder::dylib("/opt/libBar.dylib").export("_bar", 0x500).build(),
    );
    fs.add_file(
        "/opt/libFoo.dylib",
        ImageBuilder::dylib("/opt/libFoo.dylib")
            .dep("/opt/libBar.dylib")
            .bind(0, 1, "_bar")
            .build(),
    );
    fs.add_file(
        "/app/main",
        ImageBuilder::executable().dep(LIBSYSTEM).build(),
    );

    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");
    assert_eq!(p.apis.image_count(), 2);

    let removed = Arc::new(Mutex::new(Vec::new()));
    let removed_clone = Arc::clone(&removed);
    p.apis
        .register_func_for_remove_image(Box::new(move |mh, _slide| {
            removed_clone.lock().unwrap().push(mh);
        }));

    let h1 = p.apis.dlopen(Some("/opt/libFoo.dylib"), RtldMode::LAZY).expect("dlopen");
    assert_eq!(p.apis.image_count(), 4); // + libFoo + libBar

    let foo_base = h1.loader().load_address(&p.state);
    let bar = p
        .state
        .with_loaded(|l| l.iter().find(|x| x.path() == "/opt/libBar.dylib").cloned())
        .unwrap();
    let bar_base = bar.load_address(&p.state);
    assert_eq!(
        read_slot(foo_base, bind_slot_vm_offset(0)),
        (bar_base + 0x500) as u64
    );

    let h2 = p.apis.dlopen(Some("/opt/libFoo.dylib"), RtldMode::LAZY).expect("dlopen again");
    assert!(Arc::ptr_eq(h1.loader(), h2.loader()));
    assert_eq!(p.state.dl_ref_count(h1.loader()), 2);

    assert_eq!(p.apis.dlclose(&h1), 0);
    assert_eq!(p.state.dl_ref_count(h2.loader()), 1);
    assert_eq!(p.apis.image_count(), 4); // no unload yet

    assert_eq!(p.apis.dlclose(&h2), 0);
    assert_eq!(p.apis.image_count(), 2);
    assert!(!h2.loader().has_magic()); // poisoned
    assert_eq!(removed.lock().unwrap().len(), 2);
    assert!(!bar.has_magic());

    // the debugger breadcrumbs saw both unmaps (code 2)
    let unmaps = p
        .fs
        .kdebug_events
        .lock()
        .unwrap()
        .iter()
        .filter(|(code, _)| *code == 2)
        .count();
    assert_eq!(unmaps, 2);
}

#[test]
fn rtld_noload_never_instantiates() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file(
        "/opt/libFoo.dylib",
        ImageBuilder::dylib("/opt/libFoo.dylib").build(),
    );
    fs.add_file("/app/main", ImageBuilder::executable().dep(LIBSYSTEM).build());

    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    assert!(p
        .apis
        .dlopen(Some("/opt/libFoo.dylib"), RtldMode::LAZY | RtldMode::NOLOAD)
        .is_none());
    // a NOLOAD miss is soft: no dlerror
    assert!(p.apis.dlerror().is_none());
    assert_eq!(p.apis.image_count(), 2);

    let h = p.apis.dlopen(Some("/opt/libFoo.dylib"), RtldMode::LAZY).unwrap();
    let h2 = p
        .apis
        .dlopen(Some("/opt/libFoo.dylib"), RtldMode::LAZY | RtldMode::NOLOAD)
        .expect("NOLOAD finds the loaded image");
    assert!(Arc::ptr_eq(h.loader(), h2.loader()));
}

#[test]
fn dlsym_and_dladdr_resolve_through_handles() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file("/app/main", ImageBuilder::executable().dep(LIBSYSTEM).build());

    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    let h = p.apis.dlopen(Some(LIBSYSTEM), RtldMode::LAZY).expect("dlopen libSystem");
    let libsystem_base = h.loader().load_address(&p.state);

    let addr = p
        .apis
        .dlsym(&DlsymHandle::Handle(h.clone()), "malloc", 0)
        .expect("dlsym");
    assert_eq!(addr, libsystem_base + 0x500);

    let addr2 = p.apis.dlsym(&DlsymHandle::Default, "malloc", 0).unwrap();
    assert_eq!(addr2, addr);

    assert!(p.apis.dlsym(&DlsymHandle::Default, "no_such_symbol", 0).is_none());
    assert!(p.apis.dlerror().unwrap().contains("no_such_symbol"));

    let info = p.apis.dladdr(addr).expect("dladdr");
    assert_eq!(info.fname, LIBSYSTEM);
    assert_eq!(info.fbase, libsystem_base);
}

// ---- S5: cycle with upward dependency ----

#[test]
fn upward_cycle_initializes_bottom_up_without_deadlock() {
    let fs = MockFs::new();
    fs.add_file(
        "/opt/libB.dylib",
        ImageBuilder::dylib("/opt/libB.dylib")
            .upward_dep("/opt/libA.dylib")
            .objc()
            .build(),
    );
    fs.add_file(
        "/opt/libA.dylib",
        ImageBuilder::dylib("/opt/libA.dylib")
            .dep("/opt/libB.dylib")
            .objc()
            .build(),
    );
    fs.add_file(
        "/app/main",
        ImageBuilder::executable().dep("/opt/libA.dylib").build(),
    );

    let p = boot(fs, "/app/main", |_| {});

    let init_order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = Arc::clone(&init_order);
    p.apis.objc_notify_register(
        Box::new(|_mhs, _paths| {}),
        Box::new(move |_mh, path| order_clone.lock().unwrap().push(path.to_owned())),
        Box::new(|_mh, _path| {}),
    );

    launch::launch(&p.state).expect("launch");

    let order = init_order.lock().unwrap().clone();
    assert_eq!(order, ["/opt/libB.dylib", "/opt/libA.dylib"]);
}

// ---- TLV round trip ----

#[test]
fn tlv_blocks_are_per_thread_copies_of_the_template() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file(
        "/opt/libTls.dylib",
        ImageBuilder::dylib("/opt/libTls.dylib")
            .tlv(&[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4])
            .build(),
    );
    fs.add_file("/app/main", ImageBuilder::executable().dep(LIBSYSTEM).build());

    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    let h = p.apis.dlopen(Some("/opt/libTls.dylib"), RtldMode::LAZY).expect("dlopen");
    let info = p.state.tlv_info_for(h.loader()).expect("tlv registered");
    assert_ne!(info.key, 0);
    assert_eq!(info.initial_content_size, 8);

    let a1 = p.apis.tlv_get_addr(info.key, 0);
    let a2 = p.apis.tlv_get_addr(info.key, 4);
    assert_ne!(a1, 0);
    assert_eq!(a2, a1 + 4);
    // same thread: same block
    assert_eq!(p.apis.tlv_get_addr(info.key, 0), a1);
    // template copied
    assert_eq!(read_slot(a1, 0), u64::from_le_bytes([0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4]));

    // another thread gets a distinct block with the same content
    let state = Arc::clone(&p.state);
    let key = info.key;
    let other = std::thread::spawn(move || {
        let apis = DyldApis::new(state);
        apis.tlv_get_addr(key, 0)
    })
    .join()
    .unwrap();
    assert_ne!(other, 0);
    assert_ne!(other, a1);
    assert_eq!(read_slot(other, 0), read_slot(a1, 0));
}

#[test]
fn tlv_atexit_runs_in_reverse_order() {
    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    fn term(obj: usize) {
        ORDER.lock().unwrap().push(obj);
    }

    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file("/app/main", ImageBuilder::executable().dep(LIBSYSTEM).build());
    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    for i in 1..=9 {
        p.apis.tlv_atexit(term, i);
    }
    p.apis.tlv_exit();
    let order = ORDER.lock().unwrap().clone();
    assert_eq!(order, [9, 8, 7, 6, 5, 4, 3, 2, 1]);
}

// ---- S6: PrebuiltLoaderSet lifecycle ----

const SET_PATH: &str = "/var/db/dyld/app.loaderset";

fn s6_files(fs: &MockFs) {
    fs.add_file(
        "/usr/lib/libBaz.dylib",
        ImageBuilder::dylib("/usr/lib/libBaz.dylib").export("_baz", 0x500).build(),
    );
    fs.add_file(
        "/app/main",
        ImageBuilder::executable()
            .dep("/usr/lib/libBaz.dylib")
            .bind(0, 1, "_baz")
            .build(),
    );
}

fn s6_boot(fs: Arc<MockFs>) -> TestProcess {
    boot(fs, "/app/main", |c| {
        c.prebuilt_loader_set_path = Some(SET_PATH.to_owned());
        c.allow_prebuilt_saving = true;
    })
}

#[test]
fn prebuilt_set_saves_replays_and_invalidates() {
    let fs = MockFs::new();
    s6_files(&fs);

    // first launch: just-in-time, saves a set
    let p1 = s6_boot(Arc::clone(&fs));
    launch::launch(&p1.state).expect("first launch");
    assert!(p1.state.did_save_prebuilt_loader_set());
    assert!(fs.has_file(SET_PATH));
    assert!(!p1.state.loaded_at(0).unwrap().is_prebuilt());

    // second launch replays the set: every loader is prebuilt and the
    // binds land in the same places
    let p2 = s6_boot(Arc::clone(&fs));
    launch::launch(&p2.state).expect("second launch");
    let main2 = p2.state.loaded_at(0).unwrap();
    assert!(main2.is_prebuilt(), "second launch should use the saved set");
    assert_eq!(p2.apis.image_count(), 2);
    let baz2 = p2.state.loaded_at(1).unwrap();
    assert!(baz2.is_prebuilt());
    assert_eq!(
        read_slot(p2.main_base, bind_slot_vm_offset(0)),
        (baz2.load_address(&p2.state) + 0x500) as u64
    );

    // replace libBaz: new inode invalidates the recorded validation info
    fs.touch("/usr/lib/libBaz.dylib");
    let p3 = s6_boot(Arc::clone(&fs));
    launch::launch(&p3.state).expect("third launch falls back to jit");
    assert!(!p3.state.loaded_at(0).unwrap().is_prebuilt());
    let baz3 = p3.state.loaded_at(1).unwrap();
    assert_eq!(
        read_slot(p3.main_base, bind_slot_vm_offset(0)),
        (baz3.load_address(&p3.state) + 0x500) as u64
    );
    // and a refreshed set was written for the next launch
    assert!(p3.state.did_save_prebuilt_loader_set());

    let p4 = s6_boot(Arc::clone(&fs));
    launch::launch(&p4.state).expect("fourth launch uses refreshed set");
    assert!(p4.state.loaded_at(0).unwrap().is_prebuilt());
}

#[test]
fn stale_boot_token_ignores_set() {
    let fs = MockFs::new();
    s6_files(&fs);

    let p1 = s6_boot(Arc::clone(&fs));
    launch::launch(&p1.state).expect("first launch");
    assert!(fs.has_file(SET_PATH));

    // replace the main executable: its cdhash, and so the boot token,
    // changes
    fs.add_file(
        "/app/main",
        ImageBuilder::executable()
            .dep("/usr/lib/libBaz.dylib")
            .bind(0, 1, "_baz")
            .bind(1, 1, "_baz")
            .build(),
    );
    let p2 = s6_boot(Arc::clone(&fs));
    launch::launch(&p2.state).expect("second launch");
    assert!(!p2.state.loaded_at(0).unwrap().is_prebuilt());
}

// ---- permanent ranges ----

#[test]
fn launch_images_are_memory_immutable() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file("/app/main", ImageBuilder::executable().dep(LIBSYSTEM).build());
    let p = boot(fs, "/app/main", |_| {});
    launch::launch(&p.state).expect("launch");

    // __TEXT of the launch closure is permanent and read-only
    let libsystem_base = p.apis.image_header(1).unwrap();
    assert!(p.state.is_memory_immutable(libsystem_base, 16));
    // writable __DATA is permanent but not immutable
    assert!(!p.state.is_memory_immutable(libsystem_base + 0x1000, 16));
    // the heap is neither
    let heap = vec![0u8; 16];
    assert!(!p.state.is_memory_immutable(heap.as_ptr() as usize, 16));
}

// ---- inserted dylibs ----

#[test]
fn inserted_dylibs_precede_main_in_flat_order() {
    let fs = MockFs::new();
    fs.add_file(LIBSYSTEM, simple_libsystem());
    fs.add_file(
        "/opt/libInject.dylib",
        ImageBuilder::dylib("/opt/libInject.dylib").build(),
    );
    fs.add_file("/app/main", ImageBuilder::executable().dep(LIBSYSTEM).build());

    let p = boot(fs, "/app/main", |c| {
        c.path_overrides.insert_paths = vec!["/opt/libInject.dylib".to_owned()];
    });
    launch::launch(&p.state).expect("launch");

    assert_eq!(p.apis.image_name(0).as_deref(), Some("/opt/libInject.dylib"));
    assert_eq!(p.apis.image_name(1).as_deref(), Some("/app/main"));
}
