use crash_relay::{CompletionSync, ServerHandler};
use std::{
    env,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    sync::Arc,
};

/// The dump writer used by the `handler` binary, which writes the crash
/// context verbatim to `<dump_dir>/<pid>.dmp`
pub struct RawContextWriter {
    pub dump_dir: PathBuf,
    pub completion: Arc<CompletionSync>,
}

#[inline]
pub fn make_dump_path(dump_dir: &Path, pid: u32) -> PathBuf {
    dump_dir.join(format!("{pid}.dmp"))
}

impl ServerHandler for RawContextWriter {
    fn create_dump_file(&self, pid: u32) -> Result<(File, PathBuf), std::io::Error> {
        if !self.dump_dir.exists() {
            std::fs::create_dir_all(&self.dump_dir)?;
        }

        let path = make_dump_path(&self.dump_dir, pid);
        let file = File::create(&path)?;

        Ok((file, path))
    }

    fn on_dump_request(&self, pid: u32, path: &Path) -> bool {
        log::info!("dump for process {pid} written to {}", path.display());
        self.completion.mark_dump_complete();
        true
    }

    fn on_dump_error(&self, pid: u32, error: crash_relay::Error) -> bool {
        log::error!("failed to write dump for process {pid}: {error}");
        // Nothing else is coming, so don't leave the helper waiting forever
        self.completion.mark_dump_complete();
        true
    }
}

/// Locates one of this crate's binaries
pub fn bin_path(name: &str) -> PathBuf {
    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push(name);
    if !env::consts::EXE_EXTENSION.is_empty() {
        cmd_path.set_extension(env::consts::EXE_EXTENSION);
    }

    cmd_path
}

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().init();
    });
}

/// Creates a fresh dump directory for a single test
pub fn temp_dump_dir(id: &str) -> PathBuf {
    let dir = env::temp_dir().join("crash-relay-dumps").join(id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir).expect("failed to clear dump directory");
    }
    dir
}

/// Runs the `crasher` binary to completion
pub fn run_crasher(dump_dir: &Path, args: &[&str]) -> Output {
    capture_output();

    let mut cmd = Command::new(bin_path("crasher"));
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.arg("--dump-dir").arg(dump_dir).args(args);

    let child = cmd.spawn().expect("failed to run crasher");
    let output = child.wait_with_output().expect("failed to wait for output");

    println!("{}", String::from_utf8_lossy(&output.stdout));
    eprintln!("{}", String::from_utf8_lossy(&output.stderr));

    output
}

/// Waits for the single dump in `dump_dir` and reads it. The helper outlives
/// a crashed monitored process, so the dump may still be in flight when the
/// crasher exits.
pub fn read_dump(dump_dir: &Path, timeout: std::time::Duration) -> Vec<u8> {
    let start = std::time::Instant::now();

    loop {
        if let Some(path) = dump_files(dump_dir).into_iter().next() {
            // The file is created before it's written, so wait for the helper
            // to finish with it
            let len = std::fs::metadata(&path).map(|md| md.len()).unwrap_or(0);
            if len > 0 {
                std::thread::sleep(std::time::Duration::from_millis(50));
                return std::fs::read(&path).expect("failed to read dump");
            }
        }

        assert!(
            start.elapsed() < timeout,
            "no dump was written to {} within {timeout:?}",
            dump_dir.display()
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

/// All of the dump files in `dump_dir`
pub fn dump_files(dump_dir: &Path) -> Vec<PathBuf> {
    let Ok(rd) = std::fs::read_dir(dump_dir) else {
        return Vec::new();
    };

    rd.filter_map(|entry| {
        let path = entry.ok()?.path();
        (path.extension()? == "dmp").then_some(path)
    })
    .collect()
}
