//! Compiler recognition and the toolchain manifest shipped to remote workers.

use crate::core::errors::{BuildError, Result};
use crate::graph::action::{path_text, Action};
use crate::graph::graph::ActionGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Compiler families the accelerator knows how to run remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerFamily {
    Msvc,
    Clang,
    ProsperoClang,
    ClangCl,
}

impl CompilerFamily {
    /// Recognize the compiler an action runs, returning the real compiler path.
    pub fn detect(action: &Action) -> Option<(CompilerFamily, PathBuf)> {
        let name = action.program_name().to_ascii_lowercase();
        match name.as_str() {
            "cl.exe" => Some((CompilerFamily::Msvc, action.executable.clone())),
            "cl-filter.exe" => filtered_compiler(&action.arguments).map(|cl| (CompilerFamily::Msvc, cl)),
            "clang" | "clang++" | "clang.exe" | "clang++.exe" => {
                Some((CompilerFamily::Clang, action.executable.clone()))
            }
            "prospero-clang.exe" => Some((CompilerFamily::ProsperoClang, action.executable.clone())),
            "clang-cl.exe" => Some((CompilerFamily::ClangCl, action.executable.clone())),
            "env" | "arch" => wrapped_clang(&action.arguments)
                .map(|(index, _)| (CompilerFamily::Clang, PathBuf::from(&action.arguments[index]))),
            _ => None,
        }
    }

    /// Manifest entries needed to run `compiler` remotely.
    pub fn describe(self, compiler: &Path) -> Result<Vec<ToolchainEntry>> {
        if !compiler.is_file() {
            return Err(BuildError::offload_setup(
                "toolchain",
                format!("compiler {} does not exist", compiler.display()),
            ));
        }
        let root = compiler.parent().unwrap_or_else(|| Path::new(""));
        let extension = match self {
            CompilerFamily::Clang => host_library_extension(),
            _ => "dll",
        };
        let libraries = files_with_extension(root, extension);

        match self {
            CompilerFamily::Msvc => Ok(describe_msvc(compiler, root, &libraries)),
            _ => Ok(vec![ToolchainEntry::new(compiler, companion_files(&libraries))]),
        }
    }
}

impl std::fmt::Display for CompilerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompilerFamily::Msvc => "msvc",
            CompilerFamily::Clang => "clang",
            CompilerFamily::ProsperoClang => "prospero-clang",
            CompilerFamily::ClangCl => "clang-cl",
        };
        f.write_str(name)
    }
}

/// cl-filter.exe forwards to the first argument naming cl.exe.
fn filtered_compiler(arguments: &[String]) -> Option<PathBuf> {
    arguments
        .iter()
        .map(|arg| arg.trim_matches('"'))
        .find(|arg| arg.to_ascii_lowercase().ends_with("cl.exe") && !arg.starts_with("-compiler"))
        .map(PathBuf::from)
}

/// Index of the clang binary behind an `env`/`arch` wrapper.
pub(crate) fn wrapped_clang(arguments: &[String]) -> Option<(usize, &str)> {
    if arguments.len() < 2 {
        return None;
    }
    let is_clang = |arg: &str| arg.ends_with("clang") || arg.ends_with("clang++");
    (0..2)
        .find(|&index| is_clang(&arguments[index]))
        .map(|index| (index, arguments[index].as_str()))
}

fn host_library_extension() -> &'static str {
    if cfg!(windows) {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// Top-level files in `dir` with the given extension, sorted.
fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case(extension))
                        .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Prefer the English UI resources, otherwise the first copy found below `root`.
fn find_clui(root: &Path) -> Option<PathBuf> {
    let english = root.join("1033").join("clui.dll");
    if english.is_file() {
        return Some(english);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        children.sort();
        for child in children {
            if child.is_dir() {
                pending.push(child);
            } else if child
                .file_name()
                .map(|n| n.eq_ignore_ascii_case("clui.dll"))
                .unwrap_or(false)
            {
                return Some(child);
            }
        }
    }
    None
}

fn describe_msvc(compiler: &Path, root: &Path, libraries: &[PathBuf]) -> Vec<ToolchainEntry> {
    let existing = |name: &str| Some(root.join(name)).filter(|p| p.is_file());
    let clui = find_clui(root);
    let mspdbsrv = existing("mspdbsrv.exe");
    let cvtres = existing("cvtres.exe");
    let link = existing("link.exe");
    let lib = existing("lib.exe");

    let mut entries = vec![ToolchainEntry::new(
        compiler,
        with_libraries(&[&clui, &mspdbsrv], libraries),
    )];
    if let Some(link_exe) = &link {
        entries.push(ToolchainEntry::new(
            link_exe,
            with_libraries(&[&clui, &mspdbsrv, &cvtres], libraries),
        ));
    }
    if let Some(lib_exe) = &lib {
        entries.push(ToolchainEntry::new(
            lib_exe,
            with_libraries(&[&clui, &mspdbsrv, &cvtres, &link], libraries),
        ));
    }
    entries
}

fn with_libraries(extra: &[&Option<PathBuf>], libraries: &[PathBuf]) -> Vec<ToolchainFile> {
    let mut files: Vec<PathBuf> = extra.iter().filter_map(|p| (*p).clone()).collect();
    files.extend(libraries.iter().cloned());
    companion_files(&files)
}

fn companion_files(paths: &[PathBuf]) -> Vec<ToolchainFile> {
    paths
        .iter()
        .map(|path| ToolchainFile {
            local_full_path: json_path(path),
            remote_relative_path: parent_text(path),
        })
        .collect()
}

/// Paths in the manifest always use forward slashes.
fn json_path(path: &Path) -> String {
    path_text(path).replace('\\', "/")
}

fn parent_text(path: &Path) -> String {
    path.parent().map(json_path).unwrap_or_default()
}

/// A file the remote side needs next to a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainFile {
    pub local_full_path: String,
    pub remote_relative_path: String,
}

/// One tool plus its companion files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainEntry {
    pub tool_key: String,
    pub tool_name: String,
    pub tool_local_full_path: String,
    pub tool_remote_relative_path: String,
    pub files: Vec<ToolchainFile>,
}

impl ToolchainEntry {
    fn new(tool: &Path, files: Vec<ToolchainFile>) -> Self {
        let full = json_path(tool);
        Self {
            tool_key: full.clone(),
            tool_name: tool
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tool_local_full_path: full,
            tool_remote_relative_path: parent_text(tool),
            files,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainManifest {
    pub toolchains: Vec<ToolchainEntry>,
}

impl ToolchainManifest {
    /// Compilers found in `graph`, the first sighting of each family wins.
    pub fn compilers(graph: &ActionGraph) -> BTreeMap<CompilerFamily, PathBuf> {
        let mut found = BTreeMap::new();
        for (_, action) in graph.iter() {
            if let Some((family, compiler)) = CompilerFamily::detect(action) {
                found.entry(family).or_insert(compiler);
            }
        }
        found
    }

    /// Number of actions the accelerator could run remotely.
    pub fn accelerable_actions(graph: &ActionGraph) -> usize {
        graph
            .iter()
            .filter(|(_, action)| CompilerFamily::detect(action).is_some())
            .count()
    }

    pub fn from_graph(graph: &ActionGraph) -> Result<Self> {
        let mut toolchains = Vec::new();
        for (family, compiler) in Self::compilers(graph) {
            debug!(%family, compiler = %compiler.display(), "Describing toolchain");
            toolchains.extend(family.describe(&compiler)?);
        }
        Ok(Self { toolchains })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_detect_families() {
        let cases = [
            (Action::new("a", "/bin/clang++"), Some(CompilerFamily::Clang)),
            (Action::new("b", "C:/VC/bin/CL.EXE"), Some(CompilerFamily::Msvc)),
            (Action::new("c", "clang-cl.exe"), Some(CompilerFamily::ClangCl)),
            (Action::new("d", "prospero-clang.exe"), Some(CompilerFamily::ProsperoClang)),
            (Action::new("e", "/bin/cp"), None),
        ];
        for (action, expected) in cases {
            assert_eq!(CompilerFamily::detect(&action).map(|(f, _)| f), expected, "{}", action.name);
        }
    }

    #[test]
    fn test_detect_filter_and_wrappers() {
        let filter = Action::new("f", "cl-filter.exe").args([
            "-dependencies=a.d",
            "-compiler=cl.exe",
            "--",
            "\"C:/VC/bin/cl.exe\"",
            "/c",
        ]);
        assert_eq!(
            CompilerFamily::detect(&filter),
            Some((CompilerFamily::Msvc, PathBuf::from("C:/VC/bin/cl.exe")))
        );

        let env = Action::new("g", "/usr/bin/env").args(["LANG=C", "/opt/llvm/bin/clang++", "-c"]);
        assert_eq!(
            CompilerFamily::detect(&env),
            Some((CompilerFamily::Clang, PathBuf::from("/opt/llvm/bin/clang++")))
        );

        let arch = Action::new("h", "/usr/bin/arch").args(["-arm64"]);
        assert_eq!(CompilerFamily::detect(&arch), None);
    }

    #[test]
    fn test_describe_msvc_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for name in ["cl.exe", "link.exe", "cvtres.exe", "mspdbsrv.exe", "c1.dll", "c2.dll"] {
            std::fs::write(root.join(name), b"").unwrap();
        }
        std::fs::create_dir(root.join("1033")).unwrap();
        std::fs::write(root.join("1033").join("clui.dll"), b"").unwrap();

        let entries = CompilerFamily::Msvc.describe(&root.join("cl.exe")).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.tool_name.as_str()).collect();
        assert_eq!(names, vec!["cl.exe", "link.exe"]);

        let files = |entry: &ToolchainEntry| -> Vec<String> {
            entry
                .files
                .iter()
                .map(|f| f.local_full_path.rsplit('/').next().unwrap_or_default().to_string())
                .collect()
        };
        assert_eq!(files(&entries[0]), vec!["clui.dll", "mspdbsrv.exe", "c1.dll", "c2.dll"]);
        assert_eq!(
            files(&entries[1]),
            vec!["clui.dll", "mspdbsrv.exe", "cvtres.exe", "c1.dll", "c2.dll"]
        );
        assert!(!entries[0].tool_local_full_path.contains('\\'));
    }

    #[test]
    fn test_missing_compiler_fails_setup() {
        let err = CompilerFamily::Clang
            .describe(Path::new("/nonexistent/clang"))
            .unwrap_err();
        assert!(matches!(err, BuildError::OffloadSetupFailed { .. }));
    }

    #[test]
    fn test_manifest_counts_accelerable_actions() {
        let mut builder = ActionGraph::builder();
        builder.add(Action::new("a", "clang").arg("-c"));
        builder.add(Action::new("b", "clang").arg("-c"));
        builder.add(Action::new("c", "ld"));
        let graph = builder.build();
        assert_eq!(ToolchainManifest::accelerable_actions(&graph), 2);
        assert_eq!(ToolchainManifest::compilers(&graph).len(), 1);
    }
}
