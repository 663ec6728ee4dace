// Embeds the pdfium shared library when the `bundled` feature is on.
//
// The file named by PDFIUM_BUNDLE_LIB is copied into OUT_DIR under a fixed
// name, and a generated `bundled.rs` exposes its bytes via `include_bytes!`.
// `include_bytes!` needs a literal path at the expansion site, hence the
// generated file pulled in with `include!`.

use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=PDFIUM_BUNDLE_LIB");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_BUNDLED");

    if std::env::var("CARGO_FEATURE_BUNDLED").is_err() {
        return;
    }

    let lib_src = match std::env::var("PDFIUM_BUNDLE_LIB") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => panic!(
            "pdfium-auto: the `bundled` feature needs PDFIUM_BUNDLE_LIB set to the \
             platform library (libpdfium.so, libpdfium.dylib or pdfium.dll). \
             Pre-built libraries: https://github.com/bblanchon/pdfium-binaries/releases"
        ),
    };
    if !lib_src.exists() {
        panic!(
            "pdfium-auto: PDFIUM_BUNDLE_LIB points to a missing file: {}",
            lib_src.display()
        );
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));
    let lib_dest = out_dir.join("bundled_pdfium_lib");
    std::fs::copy(&lib_src, &lib_dest).unwrap_or_else(|e| {
        panic!(
            "pdfium-auto: failed to copy {} to {}: {}",
            lib_src.display(),
            lib_dest.display(),
            e
        )
    });

    let bundled_rs = out_dir.join("bundled.rs");
    let code = "/// The pdfium shared library embedded at compile time.\n\
                pub static PDFIUM_BYTES: &[u8] = include_bytes!(\"bundled_pdfium_lib\");\n";
    std::fs::write(&bundled_rs, code).unwrap_or_else(|e| {
        panic!("pdfium-auto: failed to write {}: {}", bundled_rs.display(), e)
    });

    println!("cargo:rerun-if-changed={}", lib_src.display());
}
