use std::{path::PathBuf, time::Duration};

use clap::Args;
use gemflash::{
    Event, FlasherConfig, ImageCache, ImageRequest, ReqwestSource, RunOutcome,
    Sequencer, UsbTransport,
};
use indicatif::{ProgressBar, ProgressStyle};

use crate::{CliError, hex_u16, seconds};

#[derive(Args)]
pub(crate) struct FlashArgs {
    /// directory holding tiboot3.bin, tispl.bin and u-boot.img
    #[clap(short, long)]
    source: PathBuf,
    /// board (ex: "j7")
    #[clap(long)]
    board: Option<String>,
    /// image type, optionally with a variant (ex: "minimal", "kiosk/full")
    #[clap(long)]
    image_type: Option<String>,
    /// distribution (ex: "debian")
    #[clap(long)]
    distro: Option<String>,
    /// image variant (default: "minimal")
    #[clap(long)]
    variant: Option<String>,
    /// vendor ID (ex: "0451")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "6165")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
    /// image server
    #[clap(long)]
    base_url: Option<String>,
    /// download the image even if it is cached, and do not cache it
    #[clap(long)]
    no_cache: bool,
    /// seconds to wait for the device between bootloader stages
    #[clap(long, value_parser=seconds)]
    reconnect_wait: Option<Duration>,
    /// seconds to wait for the image transfer alt setting
    #[clap(long, value_parser=seconds)]
    image_mode_wait: Option<Duration>,
}

impl FlashArgs {
    fn config(&self) -> FlasherConfig {
        let mut config = FlasherConfig::new(&self.source);
        if let Some(vid) = self.vendor {
            config.vendor_id = vid;
        }
        if let Some(pid) = self.product {
            config.product_id = pid;
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(wait) = self.reconnect_wait {
            config.timing.reconnect_dwell = wait;
        }
        if let Some(wait) = self.image_mode_wait {
            config.timing.image_mode_dwell = wait;
        }
        config
    }

    fn request(&self) -> ImageRequest {
        ImageRequest {
            board: self.board.clone(),
            image_type: self.image_type.clone(),
            distro: self.distro.clone(),
            variant: self.variant.clone(),
        }
    }
}

pub(crate) fn flash(args: &FlashArgs) -> Result<(), CliError> {
    let config = args.config();
    let mut cache =
        ImageCache::open(&config.paths.cache_dir).map_err(CliError::Cache)?;
    if args.no_cache {
        cache.disable_for_run();
    }

    let transport = UsbTransport::new(config.discovery.clone());
    let http = ReqwestSource::new()?;
    let handle =
        Sequencer::new(config, args.request(), transport, http, cache)
            .spawn()?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(200));

    for event in handle.events() {
        match event {
            Event::PreparationStatus(status) => pb.println(status),
            Event::Progress {
                percentage,
                message,
            } => {
                pb.set_position(percentage as u64);
                pb.set_message(message);
            }
            Event::Success => pb.finish_with_message("Done"),
            Event::Error(_) => pb.abandon_with_message("Failed"),
        }
    }

    match handle.join() {
        RunOutcome::Success => Ok(()),
        RunOutcome::Failure(reason) => Err(CliError::Run(reason)),
    }
}
