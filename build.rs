use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "examples"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock"];

/// One offending line: file, 1-based line number, description.
type Violation = (PathBuf, usize, String);

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=.git/packed-refs");

    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=LRPM_GIT_SHA={}", sha);

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set");
    let root = PathBuf::from(&manifest_dir);
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    enforce_line_limits(&root, &files);

    let rust_files: Vec<PathBuf> = files
        .into_iter()
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("rs")
                && p.file_name().and_then(|n| n.to_str()) != Some("build.rs")
        })
        .collect();
    enforce_no_dead_code_allows(&root, &rust_files);
    enforce_test_rules(&root, &rust_files);
}

fn enforce_line_limits(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                let count = content.lines().filter(|l| !l.trim().is_empty()).count();
                if count > MAX_LINES {
                    violations.push((relative(root, file), count, format!("{} lines", count)));
                }
            }
            Err(e) => println!(
                "cargo:warning=Could not read file {}: {}",
                relative(root, file).display(),
                e
            ),
        }
    }

    fail_on(
        &violations,
        &format!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES),
        "Split these files into smaller modules.",
    );
}

fn enforce_no_dead_code_allows(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                && trimmed.contains("dead_code")
            {
                violations.push((relative(root, file), i + 1, trimmed.to_string()));
            }
        }
    }

    fail_on(
        &violations,
        "#[allow(dead_code)] IS NOT ALLOWED",
        "Delete unused code, or gate test-only helpers behind #[cfg(test)].",
    );
}

/// Tests must not skip silently, and tests that touch process-global state
/// (environment variables, signal flags) must run under `#[serial]`.
fn enforce_test_rules(root: &Path, files: &[PathBuf]) {
    const SKIP_PATTERNS: &[&str] = &["Skipping test", "skipping test", "test skipped"];
    const GLOBAL_STATE: &[&str] = &[
        "env::set_var",
        "env::remove_var",
        "notify_child_exited",
        "notify_shutdown",
    ];

    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };

        let mut in_test = false;
        let mut has_serial = false;
        let mut reported = false;
        let mut start = 0;
        let mut depth = 0i32;

        for (i, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed == "#[test]" {
                in_test = true;
                reported = false;
                start = i + 1;
                depth = 0;
            }
            if trimmed == "#[serial]" || trimmed == "#[serial_test::serial]" {
                has_serial = true;
            }
            if !in_test || trimmed.starts_with("//") {
                continue;
            }

            let problem = if SKIP_PATTERNS.iter().any(|p| line.contains(p)) {
                Some("test skips silently")
            } else if trimmed == "return;" && depth > 1 {
                Some("test has a conditional early return")
            } else if !has_serial && GLOBAL_STATE.iter().any(|p| line.contains(p)) {
                Some("test touches global state without #[serial]")
            } else {
                None
            };
            if let (Some(problem), false) = (problem, reported) {
                violations.push((relative(root, file), start, problem.to_string()));
                reported = true;
            }

            for c in line.chars() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            in_test = false;
                            has_serial = false;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fail_on(
        &violations,
        "TEST RULES VIOLATED",
        "Make tests fail instead of skipping, and add #[serial] from serial_test\n\
         to tests that mutate environment variables or signal flags.",
    );
}

fn fail_on(violations: &[Violation], title: &str, advice: &str) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n========================================");
    eprintln!("{}", title);
    eprintln!("========================================");
    for (path, line, message) in violations {
        eprintln!("  {}:{}", path.display(), line);
        eprintln!("    {}", message);
    }
    eprintln!("========================================");
    eprintln!("{}\n", advice);
    panic!("Build failed: {} violation(s): {}", violations.len(), title);
}

fn relative(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    if let Ok(output) = Command::new("git").args(["ls-files"]).current_dir(root).output() {
        if output.status.success() {
            if let Ok(stdout) = String::from_utf8(output.stdout) {
                return stdout
                    .lines()
                    .map(|line| root.join(line))
                    .filter(|path| should_check_file(path, root))
                    .collect();
            }
        }
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
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !CHECKED_EXTENSIONS.contains(&ext) {
        return false;
    }
    let Ok(rel_path) = path.strip_prefix(root) else {
        return true;
    };
    if EXCLUDED_FILES.iter().any(|f| rel_path.to_string_lossy() == *f) {
        return false;
    }
    !rel_path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
    })
}
