fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let version_script = format!("{manifest_dir}/version_scripts/qalloc.map");
    if std::path::Path::new(&version_script).exists() {
        println!("cargo:rustc-cdylib-link-arg=-Wl,--version-script={version_script}");
        // Exports are only `no_mangle` in release; debug builds leave the
        // listed names undefined, which lld rejects by default.
        println!("cargo:rustc-cdylib-link-arg=-Wl,--undefined-version");
    }
    println!("cargo:rerun-if-changed=version_scripts/qalloc.map");
}
