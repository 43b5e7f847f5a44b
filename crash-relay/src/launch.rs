//! Spawning of the helper process from the monitored process.

use crate::{
    CrashBridge, DUMP_DIR_ENV, Error, RelayConfig, channel,
    handshake::{self, Readiness},
    helper::HelperChannelIds,
};
use std::{
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
};

/// The helper process spawned by the monitored process.
///
/// The relay never waits on the helper itself, the handle is only kept so
/// that the helper can be identified, and reaped if the owner wishes.
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    #[inline]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Waits for the helper to exit
    pub fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait()
    }
}

/// Resolves the path of the helper executable, which lives next to the
/// current executable
pub fn resolve_helper_path(name: &str) -> Result<PathBuf, Error> {
    let exe = std::env::current_exe()
        .map_err(|_err| Error::PathResolution("unable to determine the current executable"))?;
    sibling_path(&exe, name)
}

/// Replaces the file name of `exe` with `name`
pub fn sibling_path(exe: &Path, name: &str) -> Result<PathBuf, Error> {
    let mut path = exe
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or(Error::PathResolution(
            "the current executable has no parent directory",
        ))?
        .to_owned();

    path.push(name);
    if !std::env::consts::EXE_EXTENSION.is_empty() {
        path.set_extension(std::env::consts::EXE_EXTENSION);
    }

    Ok(path)
}

/// Spawns the helper, passing it the channel ids as positional arguments and
/// the dump directory in its environment.
///
/// Every descriptor this crate creates is close-on-exec, only the helper-side
/// channel ends are made inheritable, and only in the child.
pub fn spawn_helper(
    path: &Path,
    ids: HelperChannelIds,
    dump_dir: &Path,
) -> Result<ProcessHandle, Error> {
    let mut cmd = Command::new(path);
    cmd.args(ids.to_args()).env(DUMP_DIR_ENV, dump_dir);

    // SAFETY: the closure runs between fork and exec, and only performs fcntl
    // calls, which are async signal safe
    unsafe {
        cmd.pre_exec(move || {
            ids.control.set_inheritable()?;
            if let Some(blob) = ids.blob {
                blob.set_inheritable()?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(Error::Spawn)?;
    log::debug!("spawned helper {} as process {}", path.display(), child.id());

    Ok(ProcessHandle { child })
}

/// The monitored process' side of a crash reporting session
pub struct Session {
    helper: ProcessHandle,
    bridge: CrashBridge,
    readiness: Readiness,
}

impl Session {
    /// Spawns the helper named in `config` and waits for it to become ready.
    ///
    /// An error is returned if the helper could not be located or spawned, or
    /// the channel could not be created. A helper that fails to signal
    /// readiness is not an error, the session is returned with a disarmed
    /// [`CrashBridge`] and crashes are simply not relayed.
    pub fn start(config: &RelayConfig) -> Result<Self, Error> {
        let path = resolve_helper_path(&config.helper_name)?;
        Self::start_with_helper(&path, config)
    }

    /// Same as [`Self::start`], but with an explicit path to the helper
    pub fn start_with_helper(path: &Path, config: &RelayConfig) -> Result<Self, Error> {
        let (control_rx, control_tx) = channel::control_pair()?;
        let (blob_tx, helper_end) = channel::create_pair()?;

        let helper = helper_end.spawn_with(config.handshake_timeout, |blob| {
            spawn_helper(
                path,
                HelperChannelIds {
                    control: control_tx.channel_id(),
                    blob,
                },
                &config.dump_dir,
            )
        })?;

        // The helper has its own copy, closing ours means a helper that exits
        // early is observed as a hangup rather than a timeout
        drop(control_tx);

        let readiness = handshake::await_readiness(&control_rx, config.handshake_timeout);
        let bridge = CrashBridge::new(control_rx, blob_tx);

        match readiness.into_result(config.handshake_timeout) {
            Ok(()) => {
                log::info!("helper process {} is ready", helper.pid());
                bridge.arm();
            }
            Err(err) => {
                log::warn!("crash relay is disabled for this process: {err}");
            }
        }

        Ok(Self {
            helper,
            bridge,
            readiness,
        })
    }

    #[inline]
    pub fn bridge(&self) -> &CrashBridge {
        &self.bridge
    }

    #[inline]
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    #[inline]
    pub fn helper(&self) -> &ProcessHandle {
        &self.helper
    }

    /// Splits the session, typically so the bridge can be moved into a crash
    /// handler while the helper handle is kept elsewhere
    pub fn into_parts(self) -> (ProcessHandle, CrashBridge) {
        (self.helper, self.bridge)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("helper", &self.helper.pid())
            .field("readiness", &self.readiness)
            .field("armed", &self.bridge.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resolves_sibling() {
        let path = sibling_path(Path::new("/opt/app/bin/crasher"), "handler").unwrap();
        let expected = format!("/opt/app/bin/handler{}", std::env::consts::EXE_SUFFIX);
        assert_eq!(path, PathBuf::from(expected));

        assert!(matches!(
            sibling_path(Path::new("crasher"), "handler"),
            Err(Error::PathResolution(_))
        ));
        assert!(matches!(
            sibling_path(Path::new("/"), "handler"),
            Err(Error::PathResolution(_))
        ));
    }

    // The port backend swaps the task-wide bootstrap port while spawning, so
    // this is only run where spawning has no process-wide side effects
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn fails_to_spawn_missing_helper() {
        let dir = std::env::temp_dir().join("crash-relay-does-not-exist");
        let mut config = RelayConfig::new(&dir);
        config.handshake_timeout = Duration::from_millis(100);

        assert!(matches!(
            Session::start_with_helper(&dir.join("handler"), &config),
            Err(Error::Spawn(_))
        ));
    }

    /// A helper that exits without signaling is observed as a hangup well
    /// before the timeout, and leaves the bridge disarmed
    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn disarmed_when_helper_exits() {
        let mut config = RelayConfig::new(std::env::temp_dir());
        config.handshake_timeout = Duration::from_secs(5);

        let start = std::time::Instant::now();
        let mut session = Session::start_with_helper(Path::new("/bin/true"), &config).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(matches!(session.readiness(), Readiness::PeerError(_)));
        assert!(!session.bridge().is_armed());
        assert!(!session.bridge().on_crash(&[0u8; 64]));

        assert!(session.helper.wait().unwrap().success());
    }
}
