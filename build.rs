fn main() {
    // Stamped into `printlink --version` output via BUILD_DATE
    let stamp = chrono::Utc::now().format("%Y-%m-%d").to_string();
    println!("cargo:rustc-env=BUILD_DATE={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
}
