// Deimos build script
// Stamps the target triple into the binary's version banner

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=DEIMOS_TARGET={}", target);
}
