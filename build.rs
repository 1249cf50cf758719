fn main() {
    // The release tag printed by `version` is baked in at compile time.
    println!("cargo:rerun-if-env-changed=TAGUP_BUILD_TAG");
    println!("cargo:rerun-if-env-changed=TAGUP_BUILD_VERSION");
}
