//! Compiler module - source compilation
//!
//! Compilation itself is delegated to the system toolchain. The engine only
//! needs an executable per source and a log when that fails, and reuses
//! executables whose source hash it has already seen.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::core::utils::sha256_file;

/// Time allowed for one compilation
const COMPILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a compilation attempt
#[derive(Debug)]
pub struct CompileResult {
    pub success: bool,
    pub log: String,
}

/// Turns a source file into an executable
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, source: &Path, output: &Path) -> Result<CompileResult>;
}

/// Compiler backed by gcc, g++ and python3
#[derive(Debug, Clone)]
pub struct ToolchainCompiler {
    pub c_compiler: String,
    pub cpp_compiler: String,
    pub python_interpreter: String,
    /// Directories searched for headers, usually the package `prog/`
    pub include_dirs: Vec<PathBuf>,
}

impl Default for ToolchainCompiler {
    fn default() -> Self {
        Self {
            c_compiler: "gcc".to_string(),
            cpp_compiler: "g++".to_string(),
            python_interpreter: "/usr/bin/python3".to_string(),
            include_dirs: Vec::new(),
        }
    }
}

impl ToolchainCompiler {
    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    fn command_for(&self, source: &Path, output: &Path) -> Result<Option<Vec<String>>> {
        let source_str = source.to_string_lossy().to_string();
        let output_str = output.to_string_lossy().to_string();
        let includes = self
            .include_dirs
            .iter()
            .map(|dir| format!("-I{}", dir.to_string_lossy()));

        let extension = source.extension().and_then(|e| e.to_str()).unwrap_or("");
        let mut command = match extension {
            "c" => vec![
                self.c_compiler.clone(),
                source_str,
                "-o".to_string(),
                output_str,
                "-std=gnu11".to_string(),
                "-O3".to_string(),
                "-lm".to_string(),
            ],
            "cpp" | "cc" => vec![
                self.cpp_compiler.clone(),
                source_str,
                "-o".to_string(),
                output_str,
                "-std=c++20".to_string(),
                "-O3".to_string(),
                "-lm".to_string(),
            ],
            // Python is only syntax-checked; the launcher is written separately
            "py" => return Ok(None),
            other => anyhow::bail!("Unsupported source extension: {:?}", other),
        };
        command.extend(includes);
        Ok(Some(command))
    }

    /// Write an executable copy of a Python source with a direct interpreter shebang.
    /// The process keeps the script's name, so memory polling can find it.
    async fn write_python_launcher(&self, source: &Path, output: &Path) -> Result<()> {
        let code = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to read {:?}", source))?;
        tokio::fs::write(output, format!("#!{}\n{}", self.python_interpreter, code)).await?;
        tokio::fs::set_permissions(output, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(())
    }
}

#[async_trait]
impl Compiler for ToolchainCompiler {
    async fn compile(&self, source: &Path, output: &Path) -> Result<CompileResult> {
        let command = match self.command_for(source, output)? {
            Some(command) => command,
            None => {
                let check = vec![
                    self.python_interpreter.clone(),
                    "-m".to_string(),
                    "py_compile".to_string(),
                    source.to_string_lossy().to_string(),
                ];
                let result = run_tool(&check).await?;
                if result.success {
                    self.write_python_launcher(source, output).await?;
                }
                return Ok(result);
            }
        };

        debug!("Compiling with command: {:?}", command);
        run_tool(&command).await
    }
}

async fn run_tool(command: &[String]) -> Result<CompileResult> {
    let (program, args) = command
        .split_first()
        .context("No command specified for compilation")?;

    let output = tokio::time::timeout(
        COMPILE_TIMEOUT,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Compilation timed out after {:?}", COMPILE_TIMEOUT))?
    .with_context(|| format!("Failed to run {}", program))?;

    let mut log = String::from_utf8_lossy(&output.stdout).to_string();
    log.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(CompileResult {
        success: output.status.success(),
        log,
    })
}

/// A solution after compilation
#[derive(Debug, Clone)]
pub struct CompiledSolution {
    /// Source file name, e.g. `abc.cpp`
    pub name: String,
    pub source: PathBuf,
    pub source_hash: String,
    /// `None` when compilation failed
    pub executable: Option<PathBuf>,
}

impl CompiledSolution {
    pub fn compiled(&self) -> bool {
        self.executable.is_some()
    }
}

/// Where the compiler output of `name` (a full source file name) is kept
pub fn compile_log_path(cache: &CacheStore, name: &str) -> PathBuf {
    cache.compilation_dir().join(format!("{}.compile_log", name))
}

/// Compile a solution, reusing the executable recorded for an identical source.
/// Artifacts are named after the full file name, so `abc.c` and `abc.cpp` never share one.
/// Failures are logged to `<cache>/compilation/<name>.compile_log` and yield `executable: None`.
pub async fn compile_solution(
    compiler: &dyn Compiler,
    cache: &CacheStore,
    source: &Path,
) -> Result<CompiledSolution> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("Solution path has no file name")?;
    let source_hash = sha256_file(source)?;

    if let Some(executable) = cache.compiled_executable(&source_hash)? {
        debug!("Reusing compiled {} from {:?}", name, executable);
        return Ok(CompiledSolution {
            name,
            source: source.to_path_buf(),
            source_hash,
            executable: Some(executable),
        });
    }

    let executable = cache.executables_dir().join(format!("{}.e", name));
    let log_path = compile_log_path(cache, &name);

    info!("Compiling {}", name);
    let result = compiler.compile(source, &executable).await?;
    tokio::fs::write(&log_path, &result.log)
        .await
        .with_context(|| format!("Failed to write {:?}", log_path))?;

    if !result.success {
        warn!("Compilation of {} failed, see {:?}", name, log_path);
        return Ok(CompiledSolution {
            name,
            source: source.to_path_buf(),
            source_hash,
            executable: None,
        });
    }

    cache.record_executable(&name, &source_hash, &executable)?;
    Ok(CompiledSolution {
        name,
        source: source.to_path_buf(),
        source_hash,
        executable: Some(executable),
    })
}

/// Compile a source after dropping what the cache holds for it if the
/// headers it may include changed since the last build.
pub async fn compile_with_dependencies(
    compiler: &dyn Compiler,
    cache: &CacheStore,
    source: &Path,
    dependency_hash: &str,
) -> Result<CompiledSolution> {
    cache.check_dependencies(&sha256_file(source)?, dependency_hash)?;
    compile_solution(compiler, cache, source).await
}
