fn main() {
    // Build scripts run on the host; only ESP-IDF targets need the IDF environment.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
