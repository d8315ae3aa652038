// Copyright 2022-Present Spyderbat, Inc. https://www.spyderbat.com/
// SPDX-License-Identifier: Apache-2.0

//! Embeds the short git commit hash (plus a `+dirty` marker for modified
//! trees) as `SEF_GIT_COMMIT`. The forwarder reports it at startup and in
//! its `User-Agent`, so support can map any deployment back to a build.
//! Builds from a source archive without git metadata fall back to
//! `unknown`.

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    let commit = git(&["rev-parse", "--short=7", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let dirty = git(&["status", "--porcelain"]).is_some_and(|s| !s.is_empty());

    let suffix = if dirty { "+dirty" } else { "" };
    println!("cargo:rustc-env=SEF_GIT_COMMIT={commit}{suffix}");

    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
