use std::process::Command;

/// Run a command and return its trimmed stdout, or `None` when it fails.
fn capture(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    // Release pipelines building from a tarball pass the commit explicitly.
    let commit = std::env::var("AKUP_BUILD_COMMIT")
        .ok()
        .or_else(|| capture("git", &["rev-parse", "--short", "HEAD"]))
        .unwrap_or_else(|| "unknown".to_string());

    let date = capture("date", &["-u", "+%Y-%m-%d"]).unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=BUILD_COMMIT={}", commit);
    println!("cargo:rustc-env=BUILD_DATE={}", date);

    println!("cargo:rerun-if-env-changed=AKUP_BUILD_COMMIT");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
