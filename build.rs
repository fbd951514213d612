fn main() {
    // Emits the ESP-IDF link/cfg environment for device builds.
    // Host builds (tests) have no ESP-IDF environment; the call is a no-op
    // there, but skipping it avoids spurious warnings.
    if std::env::var("CARGO_FEATURE_ESPIDF").is_ok() {
        embuild::espidf::sysenv::output();
    }
}
