fn main() {
    println!(
        "cargo:rustc-env=BUILD_TIME={}",
        std::env::var("BUILD_TIME").unwrap_or_else(|_| "unknown".to_string())
    );
}
