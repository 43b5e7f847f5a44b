use clap::Parser;
use crash_relay::{
    CompletionSync, DUMP_DIR_ENV, HANDSHAKE_TIMEOUT, HelperChannelIds, channel::ChannelId,
};
use crash_relay_test::RawContextWriter;
use std::{path::PathBuf, sync::Arc};

#[derive(Parser)]
struct Command {
    /// The write end of the control channel
    control: ChannelId,
    /// The receiving end of the crash context channel, if the target passes
    /// it as a descriptor
    blob: Option<ChannelId>,
    /// The directory dumps are written to
    #[clap(long, env = DUMP_DIR_ENV)]
    dump_dir: PathBuf,
}

fn real_main(cmd: Command) -> anyhow::Result<()> {
    let completion = Arc::new(CompletionSync::new());

    let writer = RawContextWriter {
        dump_dir: cmd.dump_dir,
        completion: completion.clone(),
    };

    crash_relay::helper::run(
        HelperChannelIds {
            control: cmd.control,
            blob: cmd.blob,
        },
        Box::new(writer),
        &completion,
        HANDSHAKE_TIMEOUT,
    )?;

    Ok(())
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cmd = match Command::try_parse() {
        Ok(cmd) => cmd,
        Err(err) => {
            eprintln!("{err}");
            #[allow(clippy::exit)]
            std::process::exit(1);
        }
    };

    log::info!("handler started as process {}", std::process::id());

    if let Err(err) = real_main(cmd) {
        log::error!("handler failed: {err:#}");
        #[allow(clippy::exit)]
        std::process::exit(1);
    }

    log::info!("dump complete, exiting");
}
