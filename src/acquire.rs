//! Image acquisition
//!
//! Resolve, fetch (or reuse from the cache), and decompress the OS image
//! that ends up on the raw storage alt setting.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use reqwest::blocking::Client;

use crate::cache::ImageCache;
use crate::decompress::{self, extract_xz};
use crate::error::AcquireError;
use crate::progress::{CancelToken, Reporter, scale};
use crate::request::ResolvedImage;

const USER_AGENT: &str = concat!("gemflash/", env!("CARGO_PKG_VERSION"));
const MB: u64 = 1024 * 1024;

/// Output size that maps to the top of the extraction band
const EXTRACT_PROGRESS_SPAN: u64 = 4 * 1024 * MB;

pub const DOWNLOAD_START: u8 = 5;
pub const DOWNLOAD_END: u8 = 40;
pub const EXTRACT_END: u8 = 50;

/// Body of a successful GET
pub struct HttpBody {
    /// `Content-Length`, when the server sent one
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

/// Where images come from. Implementations must turn any non-success
/// status into an error.
pub trait HttpSource {
    fn get(&self, url: &str) -> Result<HttpBody, AcquireError>;
}

pub struct ReqwestSource {
    client: Client,
}

impl ReqwestSource {
    pub fn new() -> Result<Self, AcquireError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            // images are large; only the connect phase is bounded
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| AcquireError::Http {
                url: String::new(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl HttpSource for ReqwestSource {
    fn get(&self, url: &str) -> Result<HttpBody, AcquireError> {
        let response =
            self.client
                .get(url)
                .send()
                .map_err(|e| AcquireError::Http {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        if !response.status().is_success() {
            return Err(AcquireError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(HttpBody {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }
}

/// Files a run creates and must delete again.
///
/// The archive is kept when it is the cache payload. Every discard is
/// idempotent, and whatever is left is discarded on drop.
#[derive(Debug, Default)]
pub struct TemporaryArtifacts {
    archive: Option<PathBuf>,
    image: Option<PathBuf>,
    retained: Option<PathBuf>,
}

impl TemporaryArtifacts {
    /// `retained` is the cache payload path, never deleted
    pub fn new(retained: Option<PathBuf>) -> Self {
        Self {
            archive: None,
            image: None,
            retained,
        }
    }

    pub fn set_archive(&mut self, path: PathBuf) {
        self.archive = Some(path);
    }

    pub fn set_image(&mut self, path: PathBuf) {
        self.image = Some(path);
    }

    pub fn discard_archive(&mut self) {
        if let Some(path) = self.archive.take() {
            if self.retained.as_deref() == Some(path.as_path()) {
                debug!("Keeping cached compressed file: {}", path.display());
            } else {
                remove_artifact(&path);
            }
        }
    }

    pub fn discard_image(&mut self) {
        if let Some(path) = self.image.take() {
            remove_artifact(&path);
        }
    }

    pub fn discard_all(&mut self) {
        self.discard_image();
        self.discard_archive();
    }
}

impl Drop for TemporaryArtifacts {
    fn drop(&mut self) {
        self.discard_all();
    }
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed temp file: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove {}: {e}", path.display()),
    }
}

/// One acquisition: cache lookup, download, extraction
pub struct Acquisition<'a, H: HttpSource> {
    pub http: &'a H,
    pub cache: &'a mut ImageCache,
    pub work_dir: &'a Path,
    pub reporter: &'a mut Reporter,
    pub cancel: &'a CancelToken,
}

impl<H: HttpSource> Acquisition<'_, H> {
    /// Produce the decompressed image for `image`, recording every file
    /// created along the way in `artifacts`.
    pub fn run(
        &mut self,
        image: &ResolvedImage,
        artifacts: &mut TemporaryArtifacts,
    ) -> Result<PathBuf, AcquireError> {
        info!("DFU image URL: {}", image.url);
        self.reporter
            .status(format!("Downloading system image: {}", image.filename));
        fs::create_dir_all(self.work_dir)
            .map_err(AcquireError::io("Failed to create", self.work_dir))?;

        let archive = match self.cache.lookup(&image.filename) {
            Some(entry) => {
                self.reporter.progress(DOWNLOAD_END, "Using cached image file");
                entry.payload_path
            }
            None => self.download(image, artifacts)?,
        };
        artifacts.set_archive(archive.clone());

        self.reporter
            .progress(DOWNLOAD_END, "Extracting image from archive...");
        self.reporter.status("Extracting image from archive...");

        let output = self.work_dir.join(image.extracted_filename());
        artifacts.set_image(output.clone());
        let cancel = self.cancel;
        let reporter = &mut *self.reporter;
        let extracted = extract_xz(&archive, &output, cancel, |written| {
            let clamped = written.min(EXTRACT_PROGRESS_SPAN);
            reporter.advance(
                scale(DOWNLOAD_END, EXTRACT_END, clamped, EXTRACT_PROGRESS_SPAN),
                || format!("Extracted: {} MB", written / MB),
            );
        });
        if let Err(e) = extracted {
            if matches!(e, AcquireError::Decompress(_))
                && archive == self.cache.payload_path()
            {
                warn!("Cached image is unusable, dropping it: {e}");
                self.cache.invalidate_entry();
            }
            artifacts.discard_all();
            return Err(e);
        }

        artifacts.discard_archive();
        self.reporter.progress(EXTRACT_END, "Image extracted successfully");
        Ok(output)
    }

    /// Stream the image to a scratch file, teeing it into the cache slot
    /// when caching is on. Returns the archive to extract from.
    fn download(
        &mut self,
        image: &ResolvedImage,
        artifacts: &mut TemporaryArtifacts,
    ) -> Result<PathBuf, AcquireError> {
        let scratch = self.work_dir.join(&image.filename);
        self.reporter.progress(DOWNLOAD_START, "Downloading system image...");
        self.reporter.status(format!("Downloading from: {}", image.url));
        debug!("Output path: {}", scratch.display());

        let body = self.http.get(&image.url)?;
        let total = body.content_length.filter(|&len| len > 0);
        // While caching, the archive exists twice on disk until commit
        // deletes the scratch copy.
        let caching = self.cache.is_enabled()
            && self.cache.begin_write(&image.filename, total);

        artifacts.set_archive(scratch.clone());
        let result = self.stream_body(body, &scratch, total, image);
        let downloaded = match result {
            Ok(downloaded) => downloaded,
            Err(e) => {
                self.cache.abort();
                return Err(e);
            }
        };
        info!("Download completed: {downloaded} bytes");

        if caching && self.cache.is_enabled() {
            match self.cache.commit(&image.filename) {
                Ok(true) => {
                    // the cache slot now holds the same bytes
                    artifacts.discard_archive();
                    return Ok(self.cache.payload_path().to_path_buf());
                }
                Ok(false) => {}
                Err(e) => warn!("Cannot record DFU cache entry: {e}"),
            }
        }
        Ok(scratch)
    }

    fn stream_body(
        &mut self,
        mut body: HttpBody,
        scratch: &Path,
        total: Option<u64>,
        image: &ResolvedImage,
    ) -> Result<u64, AcquireError> {
        let file = File::create(scratch)
            .map_err(AcquireError::io("Failed to create", scratch))?;
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; decompress::BLOCK_SIZE];
        let mut downloaded: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("Download cancelled");
                return Err(AcquireError::Cancelled);
            }
            let n = match body.reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(AcquireError::Http {
                        url: image.url.clone(),
                        reason: e.to_string(),
                    });
                }
            };
            let chunk = &buffer[..n];
            writer
                .write_all(chunk)
                .map_err(AcquireError::io("Failed to write", scratch))?;
            if self.cache.is_enabled() {
                self.cache.append(chunk);
            }

            downloaded += n as u64;
            if let Some(total) = total {
                self.reporter.advance(
                    scale(DOWNLOAD_START, DOWNLOAD_END, downloaded, total),
                    || {
                        format!(
                            "Downloading: {} MB / {} MB",
                            downloaded / MB,
                            total / MB
                        )
                    },
                );
            }
        }
        writer
            .flush()
            .map_err(AcquireError::io("Failed to write", scratch))?;

        if let Some(total) = total.filter(|&total| downloaded < total) {
            return Err(AcquireError::Http {
                url: image.url.clone(),
                reason: format!(
                    "connection closed after {downloaded} of {total} bytes"
                ),
            });
        }
        Ok(downloaded)
    }
}
