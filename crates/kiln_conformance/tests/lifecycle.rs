//! Integration tests for the application lifecycle: top-level units, the
//! recompilation ceiling, request validation and configuration loading.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_build::error::codes;
use kiln_build::{BuildError, BuildOrchestrator, ErrorKind, Toolchain};
use kiln_common::MemoryFileSystem;
use kiln_config::{KilnConfig, CONFIG_FILE_NAME};
use kiln_conformance::{vp, CountingCompiler, EchoGenerator, Fixture, LineParser};
use kiln_lock::LockState;
use parking_lot::Mutex;

fn config() -> KilnConfig {
    KilnConfig::default_for("conformance")
}

// ---------------------------------------------------------------------------
// Recompilation ceiling
// ---------------------------------------------------------------------------

#[test]
fn restart_is_signalled_once_past_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.compilation.num_recompiles_before_restart = 2;
    let fx = Fixture::with_config(dir.path(), [("~/default.aspx", "v0")], config);
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);
    fx.orchestrator.on_restart(move |reason| {
        assert_eq!(reason.path, vp("~/default.aspx"));
        assert_eq!(reason.recompilations, 3);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    fx.build("~/default.aspx").unwrap();
    for version in 1..=2 {
        fx.write("~/default.aspx", &format!("v{version}"));
        fx.build("~/default.aspx").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
    assert!(!fx.orchestrator.restart_required());

    fx.write("~/default.aspx", "v3");
    let err = fx.build("~/default.aspx").unwrap_err();
    assert!(matches!(err, BuildError::RestartRequired { count: 3, .. }));
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
    assert_eq!(err.code(), codes::RESTART_REQUIRED);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(fx.orchestrator.restart_required());
    assert_eq!(fx.orchestrator.lock().state(), LockState::Closed);

    // the new result is on disk for the next process, not served from this one
    let key = vp("~/default.aspx").cache_key();
    assert_eq!(fx.orchestrator.cache().memory_len(), 0);
    let persisted = fx.orchestrator.cache().get(&key).unwrap().unwrap();
    assert!(String::from_utf8_lossy(persisted.assembly().unwrap().image()).contains("v3"));

    fx.write("~/default.aspx", "v4");
    assert!(matches!(
        fx.build("~/default.aspx"),
        Err(BuildError::LockDrained { .. })
    ));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn first_builds_do_not_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.compilation.num_recompiles_before_restart = 0;
    let fx = Fixture::with_config(
        dir.path(),
        [("~/a.aspx", "a"), ("~/b.aspx", "b"), ("~/c.aspx", "separate")],
        config,
    );

    fx.build("~/a.aspx").unwrap();
    fx.build("~/b.aspx").unwrap();
    fx.build("~/c.aspx").unwrap();

    assert!(!fx.orchestrator.restart_required());
    assert_eq!(fx.orchestrator.recompilations(&vp("~/a.aspx")), 0);
}

#[test]
fn batch_siblings_do_not_count() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(dir.path(), [("~/a.aspx", "a"), ("~/b.aspx", "b")]);
    fx.build("~/a.aspx").unwrap();

    fx.write("~/a.aspx", "a2");
    fx.write("~/b.aspx", "b2");
    fx.build("~/a.aspx").unwrap();

    assert_eq!(fx.compiler.batches()[1].len(), 2);
    assert_eq!(fx.orchestrator.recompilations(&vp("~/a.aspx")), 1);
    assert_eq!(fx.orchestrator.recompilations(&vp("~/b.aspx")), 0);
}

// ---------------------------------------------------------------------------
// Top-level units
// ---------------------------------------------------------------------------

fn top_level_files() -> [(&'static str, &'static str); 4] {
    [
        ("~/App_Code/util.cs", "util"),
        ("~/App_Code/Shared/helpers.cs", "helpers"),
        ("~/global.asax", "global"),
        ("~/default.aspx", "hello"),
    ]
}

fn shared_subdirectory() -> KilnConfig {
    let mut config = config();
    config.directories.code_subdirectories = vec!["Shared".to_string()];
    config
}

#[test]
fn top_level_units_build_first_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::with_config(dir.path(), top_level_files(), shared_subdirectory());
    let started = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&started);
    fx.orchestrator.on_application_start(move |results| {
        seen.lock()
            .extend(results.iter().map(|r| r.virtual_path().clone()));
    });

    fx.build("~/default.aspx").unwrap();
    fx.build("~/default.aspx").unwrap();

    let names = fx.compiler.assembly_names();
    assert_eq!(names[..3], ["App_SubCode_Shared", "App_Code", "App_global.asax"]);
    assert_eq!(names.len(), 4);
    let references = fx.compiler.last_references();
    for name in ["App_SubCode_Shared", "App_Code", "App_global.asax"] {
        assert!(references.contains(&name.to_string()), "missing {name}");
    }
    assert_eq!(
        *started.lock(),
        vec![vp("~/App_Code/Shared/"), vp("~/App_Code/"), vp("~/global.asax")]
    );
}

#[test]
fn code_directory_change_rebuilds_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::with_config(dir.path(), top_level_files(), shared_subdirectory());
    fx.build("~/default.aspx").unwrap();
    assert_eq!(fx.compiler.invocations(), 4);

    fx.write("~/App_Code/util.cs", "util v2");
    fx.build("~/default.aspx").unwrap();

    // everything except the untouched subdirectory
    assert_eq!(fx.compiler.invocations(), 7);
    assert_eq!(
        fx.compiler.assembly_names()[4..6],
        ["App_Code", "App_global.asax"]
    );
}

#[test]
fn top_level_units_are_requestable() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(
        dir.path(),
        [("~/App_Code/util.cs", "util"), ("~/global.asax", "global")],
    );

    let code = fx.build("~/App_Code/").unwrap();
    let global = fx.build("~/global.asax").unwrap();

    assert!(code.is_top_level());
    assert!(global.is_top_level());
    assert_eq!(code.assembly().unwrap().name(), "App_Code");
    assert!(Arc::ptr_eq(&code, &fx.build("~/app_code/").unwrap()));
    assert_eq!(fx.compiler.invocations(), 2);
}

#[test]
fn top_level_results_can_live_on_disk_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.cache.keep_top_level_in_memory = false;
    let fx = Fixture::with_config(dir.path(), [("~/App_Code/util.cs", "util")], config);

    let first = fx.build("~/App_Code/").unwrap();
    let second = fx.build("~/App_Code/").unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(fx.compiler.invocations(), 1);
    assert_eq!(fx.orchestrator.cache().memory_len(), 0);
}

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

#[test]
fn protected_directories_are_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(
        dir.path(),
        [
            ("~/App_Code/util.cs", "util"),
            ("~/bin/page.aspx", "hidden"),
            ("~/admin/App_LocalResources/page.aspx", "hidden"),
        ],
    );

    for path in [
        "~/App_Code/util.cs",
        "~/App_Code/absent.cs",
        "~/bin/page.aspx",
        "~/admin/App_LocalResources/page.aspx",
    ] {
        let err = fx.build(path).unwrap_err();
        assert!(matches!(err, BuildError::ForbiddenPath(_)), "{path}: {err}");
        assert_eq!(err.code(), codes::FORBIDDEN_PATH);
    }
    assert_eq!(fx.compiler.invocations(), 0);
}

#[test]
fn missing_and_unbuildable_paths_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(
        dir.path(),
        [("~/readme.txt", "notes"), ("~/styles.inc", "styles")],
    );

    let missing = fx.build("~/missing.aspx").unwrap_err();
    assert!(matches!(missing, BuildError::NotFound(_)));
    assert_eq!(missing.kind(), ErrorKind::User);

    for path in ["~/readme.txt", "~/styles.inc"] {
        let err = fx.build(path).unwrap_err();
        assert_eq!(err.code(), codes::NO_BUILD_PROVIDER, "{path}");
    }
    assert_eq!(
        fx.orchestrator.lock().state(),
        LockState::Open { in_use: 0 }
    );
}

#[test]
fn circular_templates_are_detected() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::new(
        dir.path(),
        [
            ("~/a.ascx", "template b.ascx"),
            ("~/b.ascx", "template a.ascx"),
            ("~/self.aspx", "template self.aspx"),
            ("~/plain.aspx", "plain"),
        ],
    );

    let err = fx.build("~/a.ascx").unwrap_err();
    assert!(matches!(err, BuildError::CircularReference(ref p) if *p == vp("~/a.ascx")));
    assert_eq!(err.code(), codes::CIRCULAR_REFERENCE);
    assert!(matches!(
        fx.build("~/self.aspx"),
        Err(BuildError::CircularReference(_))
    ));

    // nothing is left marked as in progress
    fx.build("~/plain.aspx").unwrap();
    assert!(matches!(
        fx.build("~/b.ascx"),
        Err(BuildError::CircularReference(ref p)) if *p == vp("~/b.ascx")
    ));
}

// ---------------------------------------------------------------------------
// Configuration loading
// ---------------------------------------------------------------------------

fn toolchain() -> Toolchain {
    Toolchain::new(
        Arc::new(LineParser),
        Arc::new(EchoGenerator::default()),
        CountingCompiler::new(),
    )
}

#[test]
fn open_reads_config_from_app_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        "[application]\nname = \"storefront\"\n\n[compilation]\ncompiler = \"csharp\"\nnum_recompiles_before_restart = 4\n\n[cache]\ndir = \"build-cache\"\n",
    )
    .unwrap();
    let vfs = MemoryFileSystem::with_files([("~/default.aspx", "hello")]).unwrap();

    let orchestrator = BuildOrchestrator::open(dir.path(), Arc::new(vfs), toolchain()).unwrap();
    orchestrator.ensure_built(&vp("~/default.aspx")).unwrap();

    assert_eq!(orchestrator.config().application.name, "storefront");
    assert_eq!(orchestrator.config().compilation.num_recompiles_before_restart, 4);
    assert!(orchestrator.cache().dir().starts_with(dir.path().join("build-cache")));
    assert!(dir.path().join("build-cache").is_dir());
}

#[test]
fn invalid_config_is_an_infrastructure_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.batch.max_units = 0;

    let err = BuildOrchestrator::new(
        dir.path(),
        config,
        Arc::new(MemoryFileSystem::new()),
        toolchain(),
    )
    .unwrap_err();

    assert!(matches!(err, BuildError::Config(_)));
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(err.code(), codes::CONFIG_INVALID);
}
