fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" and scans return nothing unless
    // the running binary carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription. A plain CLI binary has no bundle, so
    // the plist goes into the `__TEXT,__info_plist` Mach-O section via the
    // linker's `-sectcreate` flag.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host, so cross-compiling
    // for macOS picks this up too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    // ld … -sectcreate __TEXT __info_plist /path/to/Info.plist …
    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bin=ledsense={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
