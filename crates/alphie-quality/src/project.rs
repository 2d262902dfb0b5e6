//! Project-type detection and the filesystem probes gates depend on.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectType {
    Go,
    Node,
    Python,
    Unknown,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Node => "node",
            Self::Python => "python",
            Self::Unknown => "unknown",
        }
    }
}

/// First marker file found wins.
pub fn detect_project(dir: &Path) -> ProjectType {
    if dir.join("go.mod").is_file() {
        ProjectType::Go
    } else if dir.join("package.json").is_file() {
        ProjectType::Node
    } else if ["setup.py", "pyproject.toml", "requirements.txt"]
        .iter()
        .any(|f| dir.join(f).is_file())
    {
        ProjectType::Python
    } else {
        ProjectType::Unknown
    }
}

const SKIP_DIRS: &[&str] = &[".git", "vendor", "node_modules", ".alphie"];

pub fn has_go_tests(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref())
        })
        .filter_map(Result::ok)
        .any(|e| e.file_type().is_file() && e.file_name().to_string_lossy().ends_with("_test.go"))
}

/// Script names declared in `package.json`.
pub fn package_scripts(dir: &Path) -> HashSet<String> {
    let Ok(content) = std::fs::read_to_string(dir.join("package.json")) else {
        return HashSet::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&content) else {
        return HashSet::new();
    };
    value
        .get("scripts")
        .and_then(Value::as_object)
        .map(|s| s.keys().cloned().collect())
        .unwrap_or_default()
}

pub fn has_python_tests(dir: &Path) -> bool {
    if dir.join("tests").is_dir() {
        return true;
    }
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(Result::ok).any(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("test_") && name.ends_with(".py")
            })
        })
        .unwrap_or(false)
}

/// Whether `tool` resolves to a file on `PATH`.
pub fn tool_available(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(tool).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_order() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_project(dir.path()), ProjectType::Unknown);
        std::fs::write(dir.path().join("requirements.txt"), "").unwrap();
        assert_eq!(detect_project(dir.path()), ProjectType::Python);
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_project(dir.path()), ProjectType::Node);
        std::fs::write(dir.path().join("go.mod"), "module x").unwrap();
        assert_eq!(detect_project(dir.path()), ProjectType::Go);
    }

    #[test]
    fn go_tests_ignore_vendor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vendor/dep")).unwrap();
        std::fs::write(dir.path().join("vendor/dep/x_test.go"), "").unwrap();
        assert!(!has_go_tests(dir.path()));
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/y_test.go"), "").unwrap();
        assert!(has_go_tests(dir.path()));
    }

    #[test]
    fn scripts_from_package_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"test": "jest", "build": "tsc"}}"#,
        )
        .unwrap();
        let scripts = package_scripts(dir.path());
        assert!(scripts.contains("test"));
        assert!(scripts.contains("build"));
        assert!(!scripts.contains("lint"));
    }

    #[test]
    fn python_test_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_python_tests(dir.path()));
        std::fs::write(dir.path().join("test_app.py"), "").unwrap();
        assert!(has_python_tests(dir.path()));
    }

    #[test]
    fn unknown_tool_is_unavailable() {
        assert!(!tool_available("alphie-definitely-not-a-tool"));
    }
}
