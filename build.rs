// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=FIELDCAM_VERSION");

    // Packagers building from a tarball set the version explicitly
    let version = std::env::var("FIELDCAM_VERSION").unwrap_or_else(|_| git_version());

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// `git describe` output reshaped to `<tag>-<hash>` or `<tag>-dirty-<hash>`
fn git_version() -> String {
    let Some(described) = git(&["describe", "--tags", "--always", "--match", "v*"]) else {
        return git(&["rev-parse", "--short", "HEAD"])
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    };
    let described = described.strip_prefix('v').unwrap_or(&described);

    // "0.1.0-5-gabcdef1": five commits past the tag
    let parts: Vec<&str> = described.rsplitn(3, '-').collect();
    if let [hash, _commits, tag] = parts.as_slice() {
        let hash = hash.strip_prefix('g').unwrap_or(hash);
        return format!("{}-dirty-{}", tag, hash);
    }

    match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) if hash != described => format!("{}-{}", described, hash),
        _ => described.to_string(),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
