//! A child process acquires the control mutex and crashes while still
//! holding it. The next operation in this process must observe the dead
//! holder, recover, and complete successfully.

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use shm_object_pool::Pool;

fn unique_link_path(label: &str) -> std::path::PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "shm-object-pool-itest-{label}-{}-{}.link",
        std::process::id(),
        n
    ))
}

#[test]
fn recovers_after_child_dies_holding_the_lock() {
    let link_path = unique_link_path("crash-recovery");
    let _ = std::fs::remove_file(&link_path);

    let pool = Pool::create(&link_path, 1024 * 1024, 8).unwrap();

    let bin = env!("CARGO_BIN_EXE_shm-pool-child-harness");
    let status = Command::new(bin)
        .arg("hold-lock-forever")
        .arg(&link_path)
        .status()
        .expect("failed to spawn child harness");
    assert!(!status.success(), "child was expected to abort");

    // The mutex was left locked by a dead owner; the next operation must
    // recover rather than hang or error out.
    let view = pool
        .add_object(1, 64)
        .expect("add_object should recover from the dead holder and succeed");
    assert_eq!(view.len(), 64);

    // Dropping the view is what calls detach_object; it already releases
    // the refcount unit add_object took.
    drop(view);
    Pool::cleanup(&link_path).unwrap();
}
