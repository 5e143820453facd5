use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "examples"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock"];

/// Constructs that start a runtime inside the daemon's runtime.
const NESTED_RUNTIME_PATTERNS: &[&str] = &["Runtime::new(", ".block_on(", "block_in_place("];

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=.git/packed-refs");

    let sha = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=CONDUCTOR_GIT_SHA={}", sha);

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set");
    let root = PathBuf::from(&manifest_dir);
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    let mut violations = Vec::new();
    for file in &files {
        let Ok(content) = std::fs::read_to_string(file) else {
            println!("cargo:warning=Could not read file {}", file.display());
            continue;
        };
        let rel_path = file.strip_prefix(&root).unwrap_or(file).display().to_string();

        let line_count = content.lines().filter(|l| !l.trim().is_empty()).count();
        if line_count > MAX_LINES {
            violations.push(format!(
                "{} - {} lines (max {}), split it into smaller modules",
                rel_path, line_count, MAX_LINES
            ));
        }

        let is_rust = file.extension().and_then(|e| e.to_str()) == Some("rs")
            && file.file_name().and_then(|n| n.to_str()) != Some("build.rs");
        if is_rust {
            check_dead_code_allows(&rel_path, &content, &mut violations);
            check_nested_runtimes(&rel_path, &content, &mut violations);
            check_serial_env_tests(&rel_path, &content, &mut violations);
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("PROJECT CONVENTIONS VIOLATED");
        eprintln!("========================================");
        for violation in &violations {
            eprintln!("  {}", violation);
        }
        eprintln!("========================================\n");
        panic!("Build failed: {} convention violation(s)", violations.len());
    }
}

/// Unused code is deleted, not silenced.
fn check_dead_code_allows(rel_path: &str, content: &str, violations: &mut Vec<String>) {
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow(")) && trimmed.contains("dead_code") {
            violations.push(format!("{}:{} - #[allow(dead_code)] is not allowed", rel_path, i + 1));
        }
    }
}

/// The daemon runs on one tokio runtime; nothing may start or block on another.
fn check_nested_runtimes(rel_path: &str, content: &str, violations: &mut Vec<String>) {
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") {
            continue;
        }
        if NESTED_RUNTIME_PATTERNS.iter().any(|p| trimmed.contains(p)) {
            violations.push(format!("{}:{} - nested runtime: {}", rel_path, i + 1, trimmed));
        }
    }
}

/// Tests that call `set_var`/`remove_var` must carry `#[serial]`.
fn check_serial_env_tests(rel_path: &str, content: &str, violations: &mut Vec<String>) {
    let lines: Vec<&str> = content.lines().collect();
    let mut has_serial = false;
    let mut current_test: Option<(usize, String)> = None;
    let mut brace_depth: i32 = 0;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == "#[serial]" || trimmed == "#[serial_test::serial]" {
            has_serial = true;
        }
        if current_test.is_none() && (trimmed == "#[test]" || trimmed.starts_with("#[tokio::test")) {
            let name = lines
                .iter()
                .skip(i + 1)
                .take(4)
                .find_map(|l| l.split("fn ").nth(1))
                .and_then(|rest| rest.split('(').next())
                .map(|n| n.trim().to_string());
            if let Some(name) = name {
                current_test = Some((i + 1, name));
                brace_depth = 0;
            }
            continue;
        }

        let Some((start, name)) = &current_test else {
            continue;
        };
        let mutates = !trimmed.starts_with("//") && (trimmed.contains("env::set_var") || trimmed.contains("env::remove_var"));
        if mutates && !has_serial {
            violations.push(format!("{}:{} - test `{}` mutates env without #[serial]", rel_path, start, name));
            current_test = None;
            has_serial = false;
            continue;
        }
        for c in line.chars() {
            match c {
                '{' => brace_depth += 1,
                '}' => brace_depth -= 1,
                _ => {}
            }
        }
        if brace_depth == 0 && line.contains('}') {
            current_test = None;
            has_serial = false;
        }
    }
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let listed = Command::new("git")
        .args(["ls-files"])
        .current_dir(root)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok());
    if let Some(listed) = listed {
        return listed
            .lines()
            .map(|line| root.join(line))
            .filter(|path| should_check_file(path, root))
            .collect();
    }

    let mut files = Vec::new();
    walk_directory(root, root, &mut files);
    files
}

fn walk_directory(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let excluded = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| EXCLUDED_DIRS.contains(&name));
            if !excluded {
                walk_directory(&path, root, files);
            }
        } else if should_check_file(&path, root) {
            files.push(path);
        }
    }
}

fn should_check_file(path: &Path, root: &Path) -> bool {
    let checked_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CHECKED_EXTENSIONS.contains(&ext));
    if !checked_ext {
        return false;
    }
    let Ok(rel_path) = path.strip_prefix(root) else {
        return true;
    };
    if EXCLUDED_FILES.iter().any(|f| rel_path.to_string_lossy() == *f) {
        return false;
    }
    !rel_path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .any(|name| EXCLUDED_DIRS.contains(&name))
}
