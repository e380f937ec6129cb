//! Child-process helper for cross-process pool tests.
//!
//! Acts as the sibling process in scenarios that need a second address
//! space: it opens a pool published by the test's parent process and runs
//! one of a few fixed commands against it.
//!
//! # Usage
//!
//! ```text
//! shm-pool-child-harness attach-read-i32 <link_path> <id>
//! shm-pool-child-harness hold-lock-forever <link_path>
//! ```

use std::path::Path;
use std::process::ExitCode;

use shm_object_pool::Pool;

fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    let Some(command) = args.first() else {
        eprintln!("[child-harness] missing command");
        return ExitCode::FAILURE;
    };

    match command.as_str() {
        "attach-read-i32" => attach_read_i32(&args[1..]),
        "hold-lock-forever" => hold_lock_forever(&args[1..]),
        other => {
            eprintln!("[child-harness] unknown command: {other}");
            ExitCode::FAILURE
        }
    }
}

/// Attach to `id`, print the first and last i32 of the lease to stdout
/// (space-separated), detach, and exit.
fn attach_read_i32(args: &[String]) -> ExitCode {
    let [link_path, id] = args else {
        eprintln!("[child-harness] usage: attach-read-i32 <link_path> <id>");
        return ExitCode::FAILURE;
    };
    let id: u64 = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("[child-harness] id must be a u64");
            return ExitCode::FAILURE;
        }
    };

    let pool = match Pool::open(Path::new(link_path)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[child-harness] open failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let view = match pool.attach_object(id) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[child-harness] attach_object failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let first = i32::from_le_bytes(view[0..4].try_into().unwrap());
    let last = i32::from_le_bytes(view[view.len() - 4..].try_into().unwrap());
    println!("{first} {last}");

    // Dropping the view releases the refcount unit attach_object took; it is
    // the RAII equivalent of an explicit detach_object(id) call, not a
    // separate step that needs one of its own.
    drop(view);

    ExitCode::SUCCESS
}

/// Acquire the control mutex and die without releasing it, simulating a
/// holder that crashes mid-critical-section.
fn hold_lock_forever(args: &[String]) -> ExitCode {
    let [link_path] = args else {
        eprintln!("[child-harness] usage: hold-lock-forever <link_path>");
        return ExitCode::FAILURE;
    };

    let pool = match Pool::open(Path::new(link_path)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[child-harness] open failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    pool.debug_crash_while_holding_lock();
}
