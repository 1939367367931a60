use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rustc-env=DISPATCH_VERSION={}", version());
}

/// `git describe` output without the tag's leading `v`. Dirty or untagged
/// builds get a build time suffix.
fn version() -> String {
    let described = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string());

    match described.as_deref().map(|s| s.trim_start_matches('v')) {
        Some(tag) if !tag.is_empty() && !tag.ends_with("-dirty") => tag.to_string(),
        Some(tag) if !tag.is_empty() => format!("{}-{}", tag, build_time()),
        _ => format!("0.0.0-unknown-{}", build_time()),
    }
}

fn build_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
