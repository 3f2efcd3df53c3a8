//! Image selection and URL/filename resolution

/// Release tag baked into every image filename
pub const RELEASE: &str = "v2025.12";
/// Variant used when none is given
pub const DEFAULT_VARIANT: &str = "minimal";
/// Where the image tree is served from
pub const DEFAULT_BASE_URL: &str = "https://packages.t3gemstone.org/images";

/// Which OS image to put on the device, if any.
///
/// All of `board`, `image_type` and `distro` must be set for an image to be
/// acquired; otherwise only the bootloader stages are flashed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageRequest {
    pub board: Option<String>,
    /// `minimal`, `kiosk`, `desktop`, optionally as `type/variant`
    pub image_type: Option<String>,
    /// `debian`, `ubuntu`, `pardus`
    pub distro: Option<String>,
    pub variant: Option<String>,
}

/// Filename and download location derived from an [ImageRequest]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImage {
    pub filename: String,
    pub url: String,
}

impl ImageRequest {
    pub fn new(
        board: impl Into<String>,
        image_type: impl Into<String>,
        distro: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            board: Some(board.into()),
            image_type: Some(image_type.into()),
            distro: Some(distro.into()),
            variant: Some(variant.into()),
        }
    }

    /// True when an image should be acquired and flashed
    pub fn is_complete(&self) -> bool {
        [&self.board, &self.image_type, &self.distro]
            .iter()
            .all(|field| non_empty(field).is_some())
    }

    /// Resolve filename and URL against `base_url`, `None` when incomplete
    pub fn resolve(&self, base_url: &str) -> Option<ResolvedImage> {
        let board = non_empty(&self.board)?;
        let distro = non_empty(&self.distro)?;
        let (image_type, variant) = self.split_type()?;

        let filename = format!(
            "gemstone-{variant}-{RELEASE}-{distro}-{image_type}-{board}.img.xz"
        );
        let url = format!(
            "{}/{distro}/{image_type}/{board}/{filename}",
            base_url.trim_end_matches('/')
        );
        Some(ResolvedImage { filename, url })
    }

    /// `kiosk/full` carries its own variant, which wins over `variant`
    fn split_type(&self) -> Option<(&str, &str)> {
        let image_type = non_empty(&self.image_type)?;
        let (image_type, variant) = match image_type.split_once('/') {
            Some((image_type, variant)) => (image_type, variant),
            None => (image_type, non_empty(&self.variant).unwrap_or("")),
        };
        let variant = if variant.is_empty() {
            DEFAULT_VARIANT
        } else {
            variant
        };
        Some((image_type, variant))
    }
}

impl ResolvedImage {
    /// Name of the decompressed image
    pub fn extracted_filename(&self) -> &str {
        self.filename
            .strip_suffix(".xz")
            .unwrap_or(&self.filename)
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_with_default_variant() {
        let request = ImageRequest::new("j7", "minimal", "debian", "");
        let image = request.resolve(DEFAULT_BASE_URL).unwrap();
        assert_eq!(
            image.filename,
            "gemstone-minimal-v2025.12-debian-minimal-j7.img.xz"
        );
        assert_eq!(
            image.url,
            "https://packages.t3gemstone.org/images/debian/minimal/j7/\
             gemstone-minimal-v2025.12-debian-minimal-j7.img.xz"
        );
        assert_eq!(
            image.extracted_filename(),
            "gemstone-minimal-v2025.12-debian-minimal-j7.img"
        );
    }

    #[test]
    fn test_type_slash_variant_overrides_variant() {
        let request = ImageRequest::new("j7", "kiosk/full", "ubuntu", "");
        let image = request.resolve(DEFAULT_BASE_URL).unwrap();
        assert_eq!(
            image.filename,
            "gemstone-full-v2025.12-ubuntu-kiosk-j7.img.xz"
        );
        assert!(image.url.contains("/ubuntu/kiosk/j7/"));

        let request = ImageRequest::new("j7", "kiosk/full", "ubuntu", "lite");
        let image = request.resolve(DEFAULT_BASE_URL).unwrap();
        assert!(image.filename.starts_with("gemstone-full-"));

        let request = ImageRequest::new("j7", "kiosk/", "ubuntu", "lite");
        let image = request.resolve(DEFAULT_BASE_URL).unwrap();
        assert!(image.filename.starts_with("gemstone-minimal-"));
    }

    #[test]
    fn test_explicit_variant() {
        let request = ImageRequest::new("j7", "desktop", "pardus", "xfce");
        let image = request.resolve("http://mirror.local/images/").unwrap();
        assert_eq!(
            image.url,
            "http://mirror.local/images/pardus/desktop/j7/\
             gemstone-xfce-v2025.12-pardus-desktop-j7.img.xz"
        );
    }

    #[test]
    fn test_incomplete_requests() {
        let full = ImageRequest::new("j7", "minimal", "debian", "");
        assert!(full.is_complete());

        let incomplete = [
            ImageRequest {
                board: None,
                ..full.clone()
            },
            ImageRequest {
                image_type: Some(String::new()),
                ..full.clone()
            },
            ImageRequest {
                distro: Some("  ".into()),
                ..full.clone()
            },
            ImageRequest::default(),
        ];
        for request in incomplete {
            assert!(!request.is_complete());
            assert_eq!(request.resolve(DEFAULT_BASE_URL), None);
        }
    }
}
