use std::env;
use std::process::Command;

/// Short commit id from `GIT_SHA` or, failing that, from git itself
fn commit_id() -> Option<String> {
    let from_env = env::var("GIT_SHA").ok().filter(|s| !s.is_empty());
    from_env.or_else(|| {
        let output = Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
            .ok()?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !sha.is_empty()).then_some(sha)
    })
}

fn main() {
    let nightly = matches!(
        env::var("HELIOS_NIGHTLY").as_deref().map(str::to_ascii_lowercase).as_deref(),
        Ok("1" | "true")
    );

    // Release builds report the plain package version; nightlies carry the commit
    let mut version = env!("CARGO_PKG_VERSION").to_string();
    if nightly {
        version.push_str("-nightly");
        if let Some(sha) = commit_id() {
            version = format!("{}+{}", version, sha);
        }
    }
    println!("cargo:rustc-env=APP_VERSION={}", version);

    for var in ["HELIOS_NIGHTLY", "GIT_SHA"] {
        println!("cargo:rerun-if-env-changed={}", var);
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
}
