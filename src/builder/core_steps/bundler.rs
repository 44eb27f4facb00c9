//! Function bundling collaborator.
//!
//! Packaging functions is not done here. A [`Bundler`] receives the
//! directories and generated entry points to bundle and reports what it
//! bundled; [`DefaultBundler`] only records a manifest of discovered functions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::error::{ErrorKind, RawError};
use crate::core::report::GeneratedFunction;
use crate::util::fs;
use crate::util::shell::Progress;

/// File written into the dist directory by [`DefaultBundler`].
pub const MANIFEST_NAME: &str = "manifest.json";

/// Which kind of functions are being bundled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Serverless,
    Edge,
}

/// Input to a bundler.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub kind: FunctionKind,
    /// Existing source directories, in priority order.
    pub sources: Vec<PathBuf>,
    /// Functions registered by plugins, paths relative to `build_dir`.
    pub generated: Vec<GeneratedFunction>,
    pub build_dir: PathBuf,
    pub dist: PathBuf,
    pub build_version: String,
}

/// One bundled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundledFunction {
    pub name: String,
    /// Entry point, relative to the build directory.
    pub source: String,
    /// Plugin that generated the function.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

/// Packages functions for deployment.
pub trait Bundler: Send + Sync {
    fn bundle(&self, request: &BundleRequest, progress: &mut Progress) -> Result<Vec<BundledFunction>, RawError>;
}

#[derive(Serialize)]
struct Manifest<'a> {
    kind: FunctionKind,
    version: &'a str,
    functions: &'a [BundledFunction],
}

/// Bundler that lists functions and writes a manifest.
///
/// Every entry of a source directory is one function, named after its file
/// stem. Two functions with the same name are a configuration error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBundler;

impl DefaultBundler {
    fn discover(request: &BundleRequest) -> Result<Vec<BundledFunction>, RawError> {
        let mut functions: BTreeMap<String, BundledFunction> = BTreeMap::new();
        let mut add = |function: BundledFunction| -> Result<(), RawError> {
            if let Some(existing) = functions.get(&function.name) {
                return Err(RawError::new(format!(
                    "Function \"{}\" is defined more than once: {} and {}",
                    function.name, existing.source, function.source
                ))
                .tagged(ErrorKind::ResolveConfig, None));
            }
            functions.insert(function.name.clone(), function);
            Ok(())
        };

        for dir in &request.sources {
            for entry in fs::list_entries(dir).map_err(RawError::from)? {
                add(BundledFunction {
                    name: function_name(&entry),
                    source: relative(&request.build_dir, &entry),
                    generator: None,
                })?;
            }
        }
        for generated in &request.generated {
            add(BundledFunction {
                name: generated.name.clone(),
                source: generated.path.clone(),
                generator: Some(generated.generator.clone()),
            })?;
        }

        Ok(functions.into_values().collect())
    }
}

impl Bundler for DefaultBundler {
    fn bundle(&self, request: &BundleRequest, progress: &mut Progress) -> Result<Vec<BundledFunction>, RawError> {
        let functions = Self::discover(request)?;
        progress.set_length(functions.len() as u64);
        for function in &functions {
            tracing::debug!(kind = ?request.kind, "bundling {}", function.name);
            progress.inc(1);
        }
        progress.finish();

        let manifest = Manifest {
            kind: request.kind,
            version: &request.build_version,
            functions: &functions,
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| RawError::new(format!("failed to serialize function manifest: {}", e)))?;
        fs::write_string(&request.dist.join(MANIFEST_NAME), &json).map_err(RawError::from)?;

        Ok(functions)
    }
}

fn function_name(path: &Path) -> String {
    let name = if path.is_dir() {
        path.file_name()
    } else {
        path.file_stem()
    };
    name.map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn relative(build_dir: &Path, path: &Path) -> String {
    fs::relative_path(build_dir, path).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::shell::{ColorChoice, Shell, ShellMode, Verbosity};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn progress() -> Progress {
        let shell = Arc::new(Shell::new(ShellMode::Human {
            verbosity: Verbosity::Quiet,
            color: ColorChoice::Never,
        }));
        shell.progress(0, "test")
    }

    fn request(tmp: &Path, generated: Vec<GeneratedFunction>) -> BundleRequest {
        BundleRequest {
            kind: FunctionKind::Serverless,
            sources: vec![tmp.join("functions")],
            generated,
            build_dir: tmp.to_path_buf(),
            dist: tmp.join(".quay/functions"),
            build_version: "1.0.0".to_string(),
        }
    }

    #[test]
    fn test_default_bundler_writes_manifest() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("functions/api")).unwrap();
        std::fs::write(tmp.path().join("functions/hello.js"), "").unwrap();
        let generated = vec![GeneratedFunction {
            name: "gen".to_string(),
            path: "plugin/gen.js".to_string(),
            generator: "./plugins/gen".to_string(),
        }];

        let functions = DefaultBundler
            .bundle(&request(tmp.path(), generated), &mut progress())
            .unwrap();
        let names: Vec<&str> = functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["api", "gen", "hello"]);

        let manifest = std::fs::read_to_string(tmp.path().join(".quay/functions/manifest.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(json["kind"], "serverless");
        assert_eq!(json["functions"][2]["source"], "functions/hello.js");
        assert_eq!(json["functions"][1]["generator"], "./plugins/gen");
    }

    #[test]
    fn test_duplicate_function_names() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("functions")).unwrap();
        std::fs::write(tmp.path().join("functions/hello.js"), "").unwrap();
        let generated = vec![GeneratedFunction {
            name: "hello".to_string(),
            path: "gen/hello.js".to_string(),
            generator: "p".to_string(),
        }];

        let err = DefaultBundler
            .bundle(&request(tmp.path(), generated), &mut progress())
            .unwrap_err();
        assert_eq!(err.tag.unwrap().kind, ErrorKind::ResolveConfig);
        assert!(err.message.contains("defined more than once"));
    }
}
