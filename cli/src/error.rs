use std::io;

use dfu::DfuError;
use gemflash::AcquireError;
use indicatif::style::TemplateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("DFU error: {0}")]
    Dfu(#[from] DfuError),
    #[error("Cannot open image cache: {0}")]
    Cache(#[source] io::Error),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("{0}")]
    Template(#[from] TemplateError),
    #[error("{0}")]
    Run(String),
}
