//! # pdfium-auto
//!
//! Finds the [PDFium](https://pdfium.googlesource.com/pdfium/) shared library
//! that `pdfium-render` binds to, and fetches it when it is missing.
//!
//! Resolution order:
//!
//! 1. `PDFIUM_LIB_PATH`, when it names an existing file.
//! 2. The per-version cache directory (see [`pdfium_cache_dir`]).
//! 3. With the `bundled` feature, the library embedded at compile time
//!    ([`ensure_pdfium_bundled`]).
//! 4. A download of the platform archive from
//!    [bblanchon/pdfium-binaries](https://github.com/bblanchon/pdfium-binaries)
//!    ([`ensure_pdfium_library`]).
//!
//! Rendering code calls [`bind_pdfium_available`], which never touches the
//! network: it binds whatever step 1 or 2 (or an earlier `ensure_*` call)
//! resolved, else the system library.
//!
//! ```rust,no_run
//! use pdfium_auto::{bind_pdfium_available, ensure_pdfium_library};
//!
//! // Once at startup, off the async executor.
//! ensure_pdfium_library(Some(&|done, total| {
//!     if let Some(t) = total {
//!         eprint!("\rPDF engine: {done}/{t} bytes");
//!     }
//! }))
//! .expect("download failed");
//!
//! // Wherever a page is rendered.
//! let pdfium = bind_pdfium_available().expect("PDFium unavailable");
//! ```
//!
//! ## Environment variables
//!
//! - `PDFIUM_LIB_PATH`: existing pdfium library; skips the cache and download.
//! - `PDFIUM_AUTO_CACHE_DIR`: base directory for the cache.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use pdfium_render::prelude::Pdfium;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

const BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

/// Directory under the user cache dir that holds the library.
const CACHE_APP_DIR: &str = "edgequake-invoice";

#[cfg(feature = "bundled")]
mod bundled {
    include!(concat!(env!("OUT_DIR"), "/bundled.rs"));
}

#[derive(Error, Debug)]
pub enum PdfiumAutoError {
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Archive extraction failed: {0}")]
    Extract(String),

    #[error("Failed to bind PDFium from '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },
}

struct PlatformInfo {
    /// Asset name in the release, e.g. `pdfium-linux-x64.tgz`.
    archive_name: &'static str,
    lib_path_in_archive: &'static str,
    lib_name: &'static str,
}

fn detect_platform() -> Result<PlatformInfo, PdfiumAutoError> {
    platform_for(std::env::consts::OS, std::env::consts::ARCH)
}

fn platform_for(os: &str, arch: &str) -> Result<PlatformInfo, PdfiumAutoError> {
    let (archive_name, lib_path_in_archive, lib_name) = match (os, arch) {
        ("macos", "aarch64") => ("pdfium-mac-arm64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
        ("macos", "x86_64") => ("pdfium-mac-x64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
        ("linux", "x86_64") => ("pdfium-linux-x64.tgz", "lib/libpdfium.so", "libpdfium.so"),
        ("linux", "aarch64") => ("pdfium-linux-arm64.tgz", "lib/libpdfium.so", "libpdfium.so"),
        ("windows", "x86_64") => ("pdfium-win-x64.tgz", "bin/pdfium.dll", "pdfium.dll"),
        ("windows", "aarch64") => ("pdfium-win-arm64.tgz", "bin/pdfium.dll", "pdfium.dll"),
        ("windows", "x86") => ("pdfium-win-x86.tgz", "bin/pdfium.dll", "pdfium.dll"),
        (os, arch) => {
            return Err(PdfiumAutoError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };
    Ok(PlatformInfo {
        archive_name,
        lib_path_in_archive,
        lib_name,
    })
}

/// Per-version cache directory for the library.
///
/// `{cache}/edgequake-invoice/pdfium-{VERSION}/`, where `{cache}` is the
/// platform cache dir (`~/.cache` on Linux) or `PDFIUM_AUTO_CACHE_DIR`.
pub fn pdfium_cache_dir() -> PathBuf {
    if let Ok(base) = std::env::var("PDFIUM_AUTO_CACHE_DIR") {
        return PathBuf::from(base).join(format!("pdfium-{PDFIUM_VERSION}"));
    }
    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_APP_DIR)
        .join(format!("pdfium-{PDFIUM_VERSION}"))
}

static RESOLVED_PATH: OnceLock<PathBuf> = OnceLock::new();

fn env_library() -> Option<PathBuf> {
    std::env::var_os("PDFIUM_LIB_PATH")
        .map(PathBuf::from)
        .filter(|p| p.exists())
}

/// `true` when no download is needed: `PDFIUM_LIB_PATH` exists or the
/// library is already in the cache.
pub fn is_pdfium_cached() -> bool {
    cached_pdfium_path().is_some()
}

/// On-disk path of the library, if `PDFIUM_LIB_PATH` or the cache has one.
pub fn cached_pdfium_path() -> Option<PathBuf> {
    env_library().or_else(|| {
        let info = detect_platform().ok()?;
        Some(pdfium_cache_dir().join(info.lib_name)).filter(|p| p.exists())
    })
}

/// Make sure the library is on disk, downloading it on first use.
///
/// `on_progress` receives `(bytes_downloaded, total_bytes)`. Blocking; run it
/// via `spawn_blocking` or `block_in_place` from async code. The download
/// happens at most once per process.
pub fn ensure_pdfium_library(
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, PdfiumAutoError> {
    if let Some(path) = RESOLVED_PATH.get() {
        return Ok(path.clone());
    }
    let path = resolve_or_download(on_progress)?;
    let _ = RESOLVED_PATH.set(path.clone());
    Ok(path)
}

/// Write the library embedded at compile time into the cache directory
/// (once) and return its path. `PDFIUM_LIB_PATH` still takes precedence.
#[cfg(feature = "bundled")]
pub fn ensure_pdfium_bundled() -> Result<PathBuf, PdfiumAutoError> {
    if let Some(path) = RESOLVED_PATH.get() {
        return Ok(path.clone());
    }
    let path = match env_library() {
        Some(path) => path,
        None => {
            let info = detect_platform()?;
            let dir = pdfium_cache_dir();
            let path = dir.join(info.lib_name);
            if !path.exists() {
                std::fs::create_dir_all(&dir).map_err(PdfiumAutoError::CacheDir)?;
                write_atomically(&path, bundled::PDFIUM_BYTES)?;
                info!("Unpacked bundled PDFium to {}", path.display());
            }
            path
        }
    };
    let _ = RESOLVED_PATH.set(path.clone());
    Ok(path)
}

/// Bind to a library that is already present: the path resolved by an
/// earlier `ensure_*` call, `PDFIUM_LIB_PATH`, the cache, or finally the
/// system library. Never downloads.
pub fn bind_pdfium_available() -> Result<Pdfium, PdfiumAutoError> {
    if let Some(path) = RESOLVED_PATH.get().cloned().or_else(cached_pdfium_path) {
        return bind_pdfium_from_path(&path);
    }
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| PdfiumAutoError::Bind {
            path: PathBuf::from("<system library>"),
            reason: format!("{e:?}"),
        })
}

/// Bind to the library at `path`. Does not consult the cache.
pub fn bind_pdfium_from_path(path: &Path) -> Result<Pdfium, PdfiumAutoError> {
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| PdfiumAutoError::Bind {
            path: path.to_path_buf(),
            reason: format!("{e:?}"),
        })
}

fn resolve_or_download(
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, PdfiumAutoError> {
    if let Some(path) = env_library() {
        return Ok(path);
    }
    if let Some(p) = std::env::var_os("PDFIUM_LIB_PATH") {
        warn!(
            "PDFIUM_LIB_PATH '{}' does not exist; falling back to the cache",
            PathBuf::from(p).display()
        );
    }

    let info = detect_platform()?;
    let cache_dir = pdfium_cache_dir();
    let lib_path = cache_dir.join(info.lib_name);
    if lib_path.exists() {
        return Ok(lib_path);
    }

    let url = format!("{BASE_URL}/chromium%2F{PDFIUM_VERSION}/{}", info.archive_name);
    info!("Downloading PDFium {} from {}", PDFIUM_VERSION, url);
    std::fs::create_dir_all(&cache_dir).map_err(PdfiumAutoError::CacheDir)?;

    let archive = download_bytes(&url, on_progress)?;
    let library = extract_library(&archive, info.lib_path_in_archive)?;
    write_atomically(&lib_path, &library)?;
    debug!("PDFium cached at {}", lib_path.display());
    Ok(lib_path)
}

/// Write via a temporary sibling and rename, so a concurrent reader never
/// sees a half-written library.
fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), PdfiumAutoError> {
    let tmp = dest.with_extension(format!("partial-{}", std::process::id()));
    std::fs::write(&tmp, bytes).map_err(PdfiumAutoError::CacheDir)?;
    std::fs::rename(&tmp, dest).map_err(PdfiumAutoError::CacheDir)
}

/// Stream `url` into memory, reporting progress every 64 KiB chunk.
fn download_bytes(
    url: &str,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<Vec<u8>, PdfiumAutoError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("pdfium-auto/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| PdfiumAutoError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| PdfiumAutoError::Download(format!("GET {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(PdfiumAutoError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut buf = Vec::with_capacity(total.unwrap_or(35 * 1024 * 1024) as usize);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut downloaded = 0u64;
    loop {
        match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                downloaded += n as u64;
                if let Some(cb) = on_progress {
                    cb(downloaded, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PdfiumAutoError::Download(format!("Read error: {e}"))),
        }
    }
    Ok(buf)
}

/// Pull one file out of a gzipped tar archive.
fn extract_library(archive_bytes: &[u8], wanted: &str) -> Result<Vec<u8>, PdfiumAutoError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let extract = |e: std::io::Error| PdfiumAutoError::Extract(e.to_string());
    let mut archive = Archive::new(GzDecoder::new(archive_bytes));
    for entry in archive.entries().map_err(extract)? {
        let mut entry = entry.map_err(extract)?;
        if entry.path().map_err(extract)?.to_string_lossy() != wanted {
            continue;
        }
        let mut out = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut out).map_err(extract)?;
        return Ok(out);
    }
    Err(PdfiumAutoError::Extract(format!(
        "Library '{wanted}' not found in archive"
    )))
}
