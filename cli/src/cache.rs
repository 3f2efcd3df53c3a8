use clap::Subcommand;
use gemflash::{ImageCache, Paths};

use crate::CliError;

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// show the cached image and whether caching is on
    Status,
    /// delete the cached image
    Clear,
    /// keep downloaded images for later runs
    Enable,
    /// always download images afresh
    Disable,
}

pub(crate) fn cache_cmd(action: &CacheAction) -> Result<(), CliError> {
    let paths = Paths::platform();
    let mut cache =
        ImageCache::open(&paths.cache_dir).map_err(CliError::Cache)?;

    match action {
        CacheAction::Status => {
            println!("Cache file: {}", cache.payload_path().display());
            println!(
                "Caching: {}",
                if cache.is_enabled() { "enabled" } else { "disabled" }
            );
            match (cache.stored_fingerprint(), cache.payload_size()) {
                (Some(fingerprint), Some(size)) => println!(
                    "Cached image: {fingerprint} ({} MB)",
                    size / 1024 / 1024
                ),
                _ => println!("Cached image: none"),
            }
        }
        CacheAction::Clear => {
            cache.clear()?;
            println!("Cache cleared");
        }
        CacheAction::Enable => {
            cache.set_enabled(true)?;
            println!("Caching enabled");
        }
        CacheAction::Disable => {
            cache.set_enabled(false)?;
            println!("Caching disabled");
        }
    }
    Ok(())
}
