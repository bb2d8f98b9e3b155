//! Build script for tagrank-api
//!
//! Exports `TAGRANK_GIT_HASH`, `TAGRANK_BUILT_AT` and `TAGRANK_PROFILE` to
//! the crate. The startup log and `GET /health` report them. Source tarballs
//! without a git checkout can set `TAGRANK_GIT_HASH` in the environment.

use std::process::Command;

fn git_hash() -> Option<String> {
    if let Ok(hash) = std::env::var("TAGRANK_GIT_HASH") {
        return Some(hash);
    }
    let output = Command::new("git").args(["rev-parse", "--short=8", "HEAD"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}

fn main() {
    let hash = git_hash().unwrap_or_else(|| "unknown".to_string());
    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=TAGRANK_GIT_HASH={}", hash);
    println!("cargo:rustc-env=TAGRANK_BUILT_AT={}", built_at);
    println!("cargo:rustc-env=TAGRANK_PROFILE={}", profile);
}
