use std::path::{Path, PathBuf};
use std::process::Command;

/// Output of a git command run at the workspace root, or "unknown" outside a checkout.
fn git(args: &[&str], root: &Path) -> String {
    Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string()));
    let root = manifest_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| manifest_dir.clone());

    let build_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_else(|_| "unknown".to_string());

    let vars = [
        ("GIT_HASH", git(&["rev-parse", "--short", "HEAD"], &root)),
        ("GIT_BRANCH", git(&["rev-parse", "--abbrev-ref", "HEAD"], &root)),
        ("GIT_TAG", git(&["describe", "--tags", "--abbrev=0"], &root)),
        ("BUILD_TIME", build_time),
        ("CARGO_CFG_TARGET_OS", target_os),
    ];
    for (name, value) in vars {
        println!("cargo:rustc-env={}={}", name, value);
    }

    // askama templates are compiled in
    println!("cargo:rerun-if-changed={}", manifest_dir.join("templates").display());
    println!("cargo:rerun-if-changed={}", root.join(".git/HEAD").display());
}
