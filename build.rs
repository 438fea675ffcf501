// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for the RF-A PSCI library.

use std::env;

/// Platforms which can be selected with `--cfg platform="..."`.
const PLATFORMS: [&str; 1] = ["qemu"];

/// Platform used when none is selected explicitly.
const DEFAULT_PLATFORM: &str = "qemu";

fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );
    println!("cargo::rerun-if-env-changed=LOG_LEVEL");

    match env::var("CARGO_CFG_PLATFORM") {
        Ok(platform) => {
            if !PLATFORMS.contains(&platform.as_str()) {
                panic!("Unexpected platform name {platform:?}. Supported platforms: {PLATFORMS:?}");
            }
        }
        Err(_) => println!("cargo::rustc-cfg=platform=\"{DEFAULT_PLATFORM}\""),
    }
}
