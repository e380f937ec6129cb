//! Cross-process round-trip: a producer in this process registers an
//! object, a sibling process (the child harness binary) attaches to it by
//! id and reads the bytes back.

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

/// Producer creates the pool, writes a run of i32s, a child process attaches
/// and reads the first and last values back bit-identical.
#[test]
fn child_process_reads_back_bit_identical_bytes() {
    let link_path = unique_link_path("cross-process-roundtrip");
    let _ = std::fs::remove_file(&link_path);

    let pool = Pool::create(&link_path, 16 * 1024 * 1024, 16).unwrap();

    let id = 7u64;
    let mut view = pool.add_object(id, 4000).unwrap();
    for (i, chunk) in view.chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as i32).to_le_bytes());
    }

    // Keep the producer's view (and thus its refcount unit) alive across
    // the child's attach; otherwise dropping it here would free the slot
    // before the child ever gets to it.
    let bin = env!("CARGO_BIN_EXE_shm-pool-child-harness");
    let output = Command::new(bin)
        .arg("attach-read-i32")
        .arg(&link_path)
        .arg(id.to_string())
        .output()
        .expect("failed to spawn child harness");

    assert!(
        output.status.success(),
        "child harness failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut parts = stdout.trim().split_whitespace();
    let first: i32 = parts.next().unwrap().parse().unwrap();
    let last: i32 = parts.next().unwrap().parse().unwrap();

    assert_eq!(first, 0);
    assert_eq!(last, 999);

    drop(view);
    Pool::cleanup(&link_path).unwrap();
}
