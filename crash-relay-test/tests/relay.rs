use crash_relay_test::*;
use std::time::Duration;

fn unique_dir(name: &str) -> std::path::PathBuf {
    temp_dump_dir(&format!("{name}-{}", uuid::Uuid::new_v4()))
}

/// The helper receives exactly the bytes relayed by the monitored process,
/// writes them to disk, and exits successfully
#[test]
fn relays_simulated_crash() {
    let dump_dir = unique_dir("simulated");

    let output = run_crasher(&dump_dir, &["--simulate"]);
    assert_eq!(output.status.code(), Some(0), "helper did not exit cleanly");

    let dump = read_dump(&dump_dir, Duration::from_secs(5));
    assert_eq!(dump, [0xa5; 64]);
    assert_eq!(dump_files(&dump_dir).len(), 1);

    std::fs::remove_dir_all(&dump_dir).unwrap();
}

/// A real segfault is caught by the crash handler and the full crash context
/// is relayed, the process still terminates via the signal
#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn relays_segfault() {
    let dump_dir = unique_dir("segfault");

    let output = run_crasher(&dump_dir, &[]);
    // Ensure it was interrupted and did not exit properly
    assert!(output.status.code().is_none(), "{:?}", output.status);

    let dump = read_dump(&dump_dir, Duration::from_secs(5));
    assert_eq!(dump.len(), std::mem::size_of::<crash_handler::CrashContext>());

    std::fs::remove_dir_all(&dump_dir).unwrap();
}

/// Failing to find the helper disables crash reporting, but the workload
/// keeps running
#[test]
fn continues_without_helper() {
    let dump_dir = unique_dir("missing");

    let output = run_crasher(&dump_dir, &["--simulate", "--helper-name", "not-a-handler"]);
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("relay unavailable"), "{stdout}");
    assert!(stdout.contains("workload finished"), "{stdout}");
    assert!(dump_files(&dump_dir).is_empty());
}

/// The helper exits with 1 if it cannot make sense of its arguments or
/// adopt its channel
#[test]
fn handler_rejects_bad_channels() {
    let run = |args: &[&str]| {
        std::process::Command::new(bin_path("handler"))
            .args(args)
            .env(crash_relay::DUMP_DIR_ENV, std::env::temp_dir())
            .output()
            .expect("failed to run handler")
    };

    // Not a descriptor
    assert_eq!(run(&["not-a-fd"]).status.code(), Some(1));
    // No arguments at all
    assert_eq!(run(&[]).status.code(), Some(1));
    // A descriptor number that isn't open in the helper
    assert_eq!(run(&["1000", "1001"]).status.code(), Some(1));
}
