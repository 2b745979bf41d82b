//! Build script for xtcompat
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for the CLI's `--version` output.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
