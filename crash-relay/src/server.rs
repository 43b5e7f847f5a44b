//! The receiving end of the relay, which runs in the helper process and turns
//! crash contexts into dumps.

use crate::{
    Error,
    channel::{BlobReceiver, ReceivedBlob},
};
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

/// How often the server loop checks whether it has been asked to shutdown
const TICK: Duration = Duration::from_millis(10);

/// Allows user code to hook into the server to decide where dumps are written
/// and how.
pub trait ServerHandler: Send + Sync {
    /// Called when a crash context has been received and a backing file needs
    /// to be created to store the dump.
    fn create_dump_file(&self, pid: u32) -> Result<(File, PathBuf), std::io::Error>;
    /// Writes the dump for the received crash context.
    ///
    /// The default implementation writes the crash context verbatim.
    fn write_dump(&self, blob: &ReceivedBlob, file: &mut File) -> Result<(), Error> {
        file.write_all(&blob.context)?;
        file.sync_all()?;
        Ok(())
    }
    /// Called once the dump for `pid` has been written to `path`.
    ///
    /// A return value of true indicates that the server loop should exit.
    fn on_dump_request(&self, pid: u32, path: &Path) -> bool;
    /// Called if the dump for `pid` could not be created or written.
    ///
    /// A return value of true indicates that the server loop should exit.
    fn on_dump_error(&self, pid: u32, error: Error) -> bool {
        log::error!("failed to write dump for process {pid}: {error}");
        false
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum LoopAction {
    Continue,
    Exit,
}

/// Receives crash contexts from the monitored process on a worker thread.
pub struct DumpServer {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<(), Error>>>,
}

impl DumpServer {
    /// Starts the server loop on a new thread. The receiver is already able
    /// to accept crash contexts when this returns, so it is safe to signal
    /// readiness to the monitored process immediately afterwards.
    pub fn start(receiver: BlobReceiver, handler: Box<dyn ServerHandler>) -> Result<Self, Error> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("dump-server".into())
                .spawn(move || run(receiver, handler, &shutdown))?
        };

        Ok(Self {
            shutdown,
            worker: Some(worker),
        })
    }

    /// Whether the server loop has exited
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Asks the server loop to exit and waits for it to do so
    pub fn stop(mut self) -> Result<(), Error> {
        self.join()
    }

    fn join(&mut self) -> Result<(), Error> {
        self.shutdown.store(true, Ordering::Relaxed);

        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        match worker.join() {
            Ok(res) => res,
            Err(_panic) => Err(std::io::Error::other("dump server thread panicked").into()),
        }
    }
}

impl Drop for DumpServer {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("dump server exited with an error: {err}");
        }
    }
}

/// Runs the server loop on the current thread until shutdown is requested,
/// the handler asks to exit, or the monitored process closes the channel.
pub fn run(
    mut receiver: BlobReceiver,
    handler: Box<dyn ServerHandler>,
    shutdown: &AtomicBool,
) -> Result<(), Error> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::debug!("dump server shutting down");
            return Ok(());
        }

        let blob = match receiver.receive_blob(Some(TICK)) {
            Ok(Some(blob)) => blob,
            Ok(None) => continue,
            Err(Error::Truncated) => {
                log::error!("discarding truncated crash context");
                continue;
            }
            Err(Error::Disconnected) => {
                log::info!("monitored process closed the crash context channel");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        log::info!(
            "received {} byte crash context from process {}",
            blob.context.len(),
            blob.pid
        );

        if handle_crash_context(&blob, handler.as_ref()) == LoopAction::Exit {
            return Ok(());
        }
    }
}

fn handle_crash_context(blob: &ReceivedBlob, handler: &dyn ServerHandler) -> LoopAction {
    let result = handler
        .create_dump_file(blob.pid)
        .map_err(Error::from)
        .and_then(|(mut file, path)| {
            handler.write_dump(blob, &mut file)?;
            Ok(path)
        });

    let exit = match result {
        Ok(path) => {
            log::info!("wrote dump to {}", path.display());
            handler.on_dump_request(blob.pid, &path)
        }
        Err(err) => handler.on_dump_error(blob.pid, err),
    };

    if exit {
        LoopAction::Exit
    } else {
        LoopAction::Continue
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod test {
    use super::*;
    use crate::{CompletionSync, channel};

    struct Recorder {
        dir: PathBuf,
        completion: Arc<CompletionSync>,
    }

    impl ServerHandler for Recorder {
        fn create_dump_file(&self, pid: u32) -> Result<(File, PathBuf), std::io::Error> {
            let path = self.dir.join(format!("{pid}.dmp"));
            Ok((File::create(&path)?, path))
        }

        fn on_dump_request(&self, pid: u32, path: &Path) -> bool {
            assert_eq!(pid, std::process::id());
            assert!(path.starts_with(&self.dir));
            self.completion.mark_dump_complete();
            true
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("crash-relay-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_dump(dir: &Path) -> Vec<u8> {
        std::fs::read(dir.join(format!("{}.dmp", std::process::id()))).unwrap()
    }

    #[test]
    fn writes_received_context() {
        let dir = temp_dir("server");
        let completion = Arc::new(CompletionSync::new());

        let (tx, helper_end) = channel::create_pair().unwrap();
        let server = DumpServer::start(
            helper_end.into_receiver().unwrap(),
            Box::new(Recorder {
                dir: dir.clone(),
                completion: completion.clone(),
            }),
        )
        .unwrap();

        let context: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        tx.send_blob(&context).unwrap();

        assert!(completion.await_completion_timeout(Duration::from_secs(5)));
        server.stop().unwrap();

        assert_eq!(read_dump(&dir), context);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn exits_on_disconnect() {
        let dir = temp_dir("disconnect");
        let completion = Arc::new(CompletionSync::new());

        let (tx, helper_end) = channel::create_pair().unwrap();
        let server = DumpServer::start(
            helper_end.into_receiver().unwrap(),
            Box::new(Recorder {
                dir: dir.clone(),
                completion: completion.clone(),
            }),
        )
        .unwrap();

        drop(tx);

        let start = std::time::Instant::now();
        while !server.is_finished() {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(TICK);
        }

        server.stop().unwrap();
        assert_eq!(
            completion.state(),
            crate::completion::CompletionState::AwaitingClient
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn stops_when_asked() {
        let dir = temp_dir("stop");

        let (_tx, helper_end) = channel::create_pair().unwrap();
        let server = DumpServer::start(
            helper_end.into_receiver().unwrap(),
            Box::new(Recorder {
                dir: dir.clone(),
                completion: Arc::new(CompletionSync::new()),
            }),
        )
        .unwrap();

        server.stop().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
