fn main() {
    // CoreBluetooth refuses to scan from a binary without an embedded
    // Info.plist carrying NSBluetoothAlwaysUsageDescription.  A CLI has no
    // app bundle, so the plist goes into the __TEXT,__info_plist section.
    //
    // CARGO_CFG_TARGET_OS is the target, so this also covers cross builds.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };

    for arg in [
        "-sectcreate".to_string(),
        "__TEXT".to_string(),
        "__info_plist".to_string(),
        format!("{dir}/Info.plist"),
    ] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
