//! Hand-rolled build-info capture (no `built` crate): forwards a handful
//! of cargo/rustc environment variables that aren't otherwise visible to
//! `env!()` inside the crate itself.

fn main() {
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown-target".to_string());
    println!("cargo:rustc-env=TARGET={target}");
    println!("cargo:rerun-if-changed=build.rs");
}
