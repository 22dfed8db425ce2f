//! `noxy.mod` manifest handling.
//!
//! Whitespace-separated records, one per line:
//!
//! ```text
//! module myapp
//! require github.com/user/lib v1.2.0
//! ```
//!
//! Comments start with `#` or `//`; blank lines are ignored.

use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub module: Option<String>,
    pub requires: Vec<(String, String)>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Manifest, String> {
        let mut manifest = Manifest::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["module", name] => manifest.module = Some((*name).to_string()),
                ["require", path, version] => manifest
                    .requires
                    .push(((*path).to_string(), (*version).to_string())),
                _ => {
                    return Err(format!(
                        "noxy.mod line {}: unrecognized record '{}'",
                        number + 1,
                        line
                    ))
                }
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Manifest, String> {
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        Manifest::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        std::fs::write(path, self.to_string())
            .map_err(|e| format!("{}: {}", path.display(), e))
    }

    /// Add or update a dependency record.
    pub fn record(&mut self, dep: &str, version: &str) {
        for (path, existing) in &mut self.requires {
            if path == dep {
                *existing = version.to_string();
                return;
            }
        }
        self.requires.push((dep.to_string(), version.to_string()));
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(module) = &self.module {
            writeln!(f, "module {}", module)?;
        }
        for (path, version) in &self.requires {
            writeln!(f, "require {} {}", path, version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records_and_comments() {
        let manifest = Manifest::parse(
            "# a comment\nmodule myapp\n\n// another comment\nrequire github.com/u/lib v1.0.0\n",
        )
        .unwrap();
        assert_eq!(manifest.module.as_deref(), Some("myapp"));
        assert_eq!(
            manifest.requires,
            vec![("github.com/u/lib".to_string(), "v1.0.0".to_string())]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = Manifest::parse("requires what\n").unwrap_err();
        assert!(err.contains("line 1"));
    }

    #[test]
    fn test_record_updates_existing() {
        let mut manifest = Manifest::default();
        manifest.record("github.com/u/lib", "v1");
        manifest.record("github.com/u/lib", "v2");
        assert_eq!(manifest.requires.len(), 1);
        assert_eq!(manifest.requires[0].1, "v2");
    }

    #[test]
    fn test_round_trip() {
        let mut manifest = Manifest::default();
        manifest.module = Some("app".to_string());
        manifest.record("github.com/u/lib", "v1.0.0");
        let text = manifest.to_string();
        assert_eq!(Manifest::parse(&text).unwrap(), manifest);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(&dir.path().join("noxy.mod")).unwrap();
        assert_eq!(manifest, Manifest::default());
    }
}
