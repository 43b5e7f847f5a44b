//! The main flow of the helper process.

use crate::{
    CompletionSync, DumpServer, Error, ServerHandler,
    channel::{BlobReceiver, ChannelId, ControlWriter},
    handshake,
};
use std::time::Duration;

/// The channel ids the helper receives on its command line
#[derive(Copy, Clone, Debug)]
pub struct HelperChannelIds {
    /// The write end of the control channel
    pub control: ChannelId,
    /// The receiving end of the blob channel, not used on targets where the
    /// blob channel is handed over out of band
    pub blob: Option<ChannelId>,
}

impl HelperChannelIds {
    /// Parses the positional arguments passed to the helper, the control
    /// channel id followed by the optional blob channel id
    pub fn from_args<'a>(mut args: impl Iterator<Item = &'a str>) -> Result<Self, Error> {
        let control = args.next().ok_or(Error::MissingChannelId)?.parse()?;
        let blob = args.next().map(str::parse).transpose()?;

        Ok(Self { control, blob })
    }

    /// Formats the ids as arguments for the helper's command line
    pub fn to_args(&self) -> Vec<String> {
        std::iter::once(self.control)
            .chain(self.blob)
            .map(|id| id.to_string())
            .collect()
    }
}

/// Runs the helper until a dump has been written.
///
/// The channel ends are adopted from the monitored process, the dump server
/// is started, and only then is readiness signaled, so the monitored process
/// never sends a crash context before something is listening for it. This
/// function then blocks, with no timeout, until the `handler` reports via
/// `completion` that a dump has been written.
///
/// If the monitored process exits without crashing, the server loop exits
/// but this function keeps waiting, the helper is expected to be reaped by
/// its parent or the OS.
pub fn run(
    ids: HelperChannelIds,
    handler: Box<dyn ServerHandler>,
    completion: &CompletionSync,
    timeout: Duration,
) -> Result<(), Error> {
    let control = ControlWriter::from_channel_id(ids.control)?;
    let receiver = BlobReceiver::from_channel_id(ids.blob, timeout)?;

    let server = DumpServer::start(receiver, handler)?;

    if let Err(err) = handshake::signal_readiness(&control) {
        // The monitored process will time out waiting for us and run without
        // crash reporting
        log::error!("failed to signal readiness: {err}");
        drop(server);
        return Err(err);
    }

    log::info!("helper ready, waiting for crash context");
    completion.await_completion();

    if let Err(err) = server.stop() {
        log::error!("dump server exited with an error: {err}");
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_helper_args() {
        let ids = HelperChannelIds::from_args(["4", "9"].into_iter()).unwrap();
        assert_eq!(ids.control, ChannelId::from_raw(4));
        assert_eq!(ids.blob, Some(ChannelId::from_raw(9)));
        assert_eq!(ids.to_args(), ["4", "9"]);

        let ids = HelperChannelIds::from_args(["4"].into_iter()).unwrap();
        assert_eq!(ids.blob, None);
        assert_eq!(ids.to_args(), ["4"]);

        assert!(matches!(
            HelperChannelIds::from_args(std::iter::empty()),
            Err(Error::MissingChannelId)
        ));
        assert!(matches!(
            HelperChannelIds::from_args(["4", "x"].into_iter()),
            Err(Error::InvalidChannelId(s)) if s == "x"
        ));
    }

    #[test]
    fn rejects_unopened_control_channel() {
        let ids = HelperChannelIds {
            control: ChannelId::from_raw(i32::MAX),
            blob: None,
        };

        struct Unused;
        impl ServerHandler for Unused {
            fn create_dump_file(
                &self,
                _pid: u32,
            ) -> Result<(std::fs::File, std::path::PathBuf), std::io::Error> {
                unreachable!()
            }

            fn on_dump_request(&self, _pid: u32, _path: &std::path::Path) -> bool {
                unreachable!()
            }
        }

        assert!(matches!(
            run(
                ids,
                Box::new(Unused),
                &CompletionSync::new(),
                Duration::from_millis(10)
            ),
            Err(Error::InvalidChannelId(_))
        ));
    }
}
