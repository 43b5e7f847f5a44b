use clap::Parser;
use crash_relay::{HELPER_NAME, RelayConfig, Session};
use std::path::PathBuf;

/// The filler crash context relayed in `--simulate` mode
const SIMULATED_CONTEXT: [u8; 64] = [0xa5; 64];

#[derive(Parser)]
struct Command {
    /// The directory the helper writes dumps to
    #[clap(short, long)]
    dump_dir: PathBuf,
    /// Rather than crashing, relays a 64 byte filler context directly and
    /// exits with the helper's exit code
    #[clap(long)]
    simulate: bool,
    /// The file name of the helper executable next to this one
    #[clap(long, default_value = HELPER_NAME)]
    helper_name: String,
}

#[allow(unsafe_code)]
fn real_main() -> anyhow::Result<i32> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    let mut config = RelayConfig::new(cmd.dump_dir);
    config.helper_name = cmd.helper_name;

    // Failing to start crash reporting must not stop the actual workload
    let session = match Session::start(&config) {
        Ok(session) => {
            println!("helper: {}", session.helper().pid());
            Some(session)
        }
        Err(err) => {
            println!("relay unavailable: {err}");
            None
        }
    };

    let Some(session) = session else {
        println!("workload finished");
        return Ok(0);
    };

    let (mut helper, bridge) = session.into_parts();

    if cmd.simulate {
        if !bridge.on_crash(&SIMULATED_CONTEXT) {
            anyhow::bail!("failed to relay simulated crash context");
        }

        let status = helper.wait()?;
        println!("helper exited with {status}");
        return Ok(status.code().unwrap_or(-1));
    }

    let _handler = crash_handler::CrashHandler::attach(unsafe {
        crash_handler::make_crash_event(move |cc: &crash_handler::CrashContext| {
            let mut buf = [0u8; 32];
            crash_handler::CrashEventResult::Handled(bridge.on_crash(context_bytes(cc, &mut buf)))
        })
    })?;

    #[inline(never)]
    unsafe fn indirect() {
        unsafe {
            sadness_generator::SadnessFlavor::Segfault.make_sad();
        }
    }

    // SAFETY: we're about to intentionally crash ourselves, none of this is safe
    unsafe {
        indirect();
    }

    anyhow::bail!("we should have raised a signal and exited");
}

/// The crash context exactly as the crash handler captured it
#[cfg(any(target_os = "linux", target_os = "android"))]
fn context_bytes<'cc>(cc: &'cc crash_handler::CrashContext, _buf: &'cc mut [u8; 32]) -> &'cc [u8] {
    cc.as_bytes()
}

/// The mac context has no byte representation of its own, so the ports and
/// exception info are packed into the provided buffer
#[cfg(target_os = "macos")]
fn context_bytes<'cc>(cc: &crash_handler::CrashContext, buf: &'cc mut [u8; 32]) -> &'cc [u8] {
    buf[0..4].copy_from_slice(&cc.task.to_ne_bytes());
    buf[4..8].copy_from_slice(&cc.thread.to_ne_bytes());
    buf[8..12].copy_from_slice(&cc.handler_thread.to_ne_bytes());

    if let Some(exc) = cc.exception {
        buf[12..16].copy_from_slice(&exc.kind.to_ne_bytes());
        buf[16..24].copy_from_slice(&exc.code.to_ne_bytes());
        buf[24..32].copy_from_slice(&exc.subcode.unwrap_or_default().to_ne_bytes());
    }

    &buf[..]
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    // We want this program to crash and have a dump written, it _shouldn't_
    // have errors that prevent that from happening, so emit an error code if
    // we do encounter an error so that we can fail the test
    match real_main() {
        Ok(code) => {
            #[allow(clippy::exit)]
            std::process::exit(code);
        }
        Err(err) => {
            eprintln!("error: {err:#}");

            // When exiting due to a crash, the exit code will be 128 + the
            // integer signal number, at least on unixes
            #[allow(clippy::exit)]
            std::process::exit(222);
        }
    }
}
