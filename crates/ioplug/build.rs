// SPDX-License-Identifier: Apache-2.0
//! Build script: compile the mock provider shared library for integration tests.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    let mock_src = "mock_provider/mock_provider.c";
    println!("cargo:rerun-if-changed={mock_src}");

    // Only build the mock provider if the source exists (it's part of this crate).
    if !Path::new(mock_src).exists() {
        return;
    }

    let Some(out_dir) = env::var_os("OUT_DIR").map(PathBuf::from) else {
        return;
    };
    let lib_name = if cfg!(target_os = "macos") {
        "libmock_ioplug_provider.dylib"
    } else {
        "libmock_ioplug_provider.so"
    };
    let so_path = out_dir.join(lib_name);

    let status = Command::new(env::var("CC").unwrap_or_else(|_| "cc".into()))
        .args(["-shared", "-fPIC", "-Wall", "-Wextra", "-O2", "-o"])
        .arg(&so_path)
        .arg(mock_src)
        .status();

    match status {
        Ok(status) if status.success() => {
            // Tell the tests where to find the compiled mock provider.
            println!("cargo:rustc-env=MOCK_PROVIDER_PATH={}", so_path.display());
        }
        Ok(status) => println!("cargo:warning=mock provider not built ({status}); native loader tests will be skipped"),
        Err(e) => println!("cargo:warning=no C compiler for the mock provider ({e}); native loader tests will be skipped"),
    }
}
