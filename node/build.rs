fn main() {
    // ESP-IDF link/cfg propagation is only meaningful when cross-compiling
    // the firmware; the host simulation build has nothing to propagate.
    if std::env::var("CARGO_FEATURE_ESP32").is_ok() {
        embuild::espidf::sysenv::output();
        println!("cargo:rerun-if-changed=sdkconfig.defaults");
    }
}
