//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经校验必须在 root 下（禁止 ../ 逃逸，含符号链接）；
//! FileReadTool（read / list）与 FileWriteTool（write / edit）基于 SafeFs。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::input_schema;
use crate::tools::{Tool, ToolOutput};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Path escapes workspace: {0}")]
    PathEscape(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("{0} is not a file")]
    NotAFile(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("Invalid pattern: {0}")]
    Pattern(String),

    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法检查：拒绝 .. 与根外的绝对路径，返回根下的完整路径（可能尚不存在）
    fn join(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = Path::new(path.trim_start_matches("./"));
        let rel = if rel.is_absolute() {
            rel.strip_prefix(&self.root_dir)
                .map_err(|_| FsError::PathEscape(path.to_string()))?
        } else {
            rel
        };
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(FsError::PathEscape(path.to_string())); // 如 ../../etc/passwd
        }
        Ok(self.root_dir.join(rel))
    }

    /// 已存在的路径：canonicalize 后必须仍在根下（防符号链接逃逸）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let full = self.join(path)?;
        let canonical = full
            .canonicalize()
            .map_err(|_| FsError::NotFound(path.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(FsError::PathEscape(path.to_string()))
        }
    }

    /// 待创建的路径：最近的已存在祖先必须在根下
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, FsError> {
        let full = self.join(path)?;
        let mut ancestor = full.as_path();
        while !ancestor.exists() {
            match ancestor.parent() {
                Some(p) => ancestor = p,
                None => break,
            }
        }
        let canonical = ancestor
            .canonicalize()
            .map_err(|_| FsError::NotFound(path.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(full)
        } else {
            Err(FsError::PathEscape(path.to_string()))
        }
    }

    pub async fn read_file(&self, path: &str, max_lines: usize) -> Result<String, FsError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        let bytes = tokio::fs::read(&resolved).await.map_err(|source| FsError::Io {
            op: "Read",
            path: path.to_string(),
            source,
        })?;
        let content = String::from_utf8_lossy(&bytes);
        if max_lines == 0 {
            return Ok(content.into_owned());
        }
        Ok(content
            .split_inclusive('\n')
            .take(max_lines)
            .collect::<String>())
    }

    /// 按 glob 模式列出目录内容，目录以 / 结尾
    pub fn list_dir(&self, path: &str, pattern: &str) -> Result<Vec<String>, FsError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        if !base.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        if Path::new(pattern)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(FsError::Pattern(pattern.to_string()));
        }
        let full_pattern = format!("{}/{}", glob::Pattern::escape(&base.to_string_lossy()), pattern);
        let paths = glob::glob(&full_pattern).map_err(|e| FsError::Pattern(e.to_string()))?;

        let mut entries = Vec::new();
        for entry in paths.flatten() {
            let Ok(rel) = entry.strip_prefix(&base) else {
                continue;
            };
            let suffix = if entry.is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", rel.display(), suffix));
        }
        entries.sort();
        Ok(entries)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), FsError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FsError::Io {
                    op: "Create directory",
                    path: path.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|source| FsError::Io {
                op: "Write",
                path: path.to_string(),
                source,
            })
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum ReadOperation {
    Read,
    List,
}

#[derive(Deserialize, JsonSchema)]
struct FileReadArgs {
    /// File operation to perform: read a file or list a directory
    operation: ReadOperation,
    /// File path for read, or directory path for list
    path: String,
    /// Maximum lines to read (0 means no limit)
    #[serde(default)]
    max_lines: usize,
    /// Glob pattern to match when listing (default "*")
    #[serde(default)]
    pattern: Option<String>,
}

/// file_read：读取文件或列出目录
pub struct FileReadTool {
    fs: SafeFs,
}

impl FileReadTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read files or list directory contents. Operations: read (contents of a file, \
         optionally limited to max_lines), list (entries in a directory matching pattern)."
    }

    fn input_schema(&self) -> Value {
        input_schema::<FileReadArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: FileReadArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        match args.operation {
            ReadOperation::Read => {
                tracing::info!(path = %args.path, max_lines = args.max_lines, "file_read read");
                self.fs
                    .read_file(&args.path, args.max_lines)
                    .await
                    .map(ToolOutput::text)
                    .map_err(|e| e.to_string())
            }
            ReadOperation::List => {
                let pattern = args.pattern.as_deref().unwrap_or("*");
                tracing::info!(path = %args.path, pattern, "file_read list");
                let entries = self
                    .fs
                    .list_dir(&args.path, pattern)
                    .map_err(|e| e.to_string())?;
                if entries.is_empty() {
                    return Ok(ToolOutput::text(format!(
                        "No files found matching {}/{}",
                        args.path, pattern
                    )));
                }
                Ok(ToolOutput::text(entries.join("\n")))
            }
        }
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum WriteOperation {
    Write,
    Edit,
}

#[derive(Deserialize, JsonSchema)]
struct FileWriteArgs {
    /// File operation to perform: write (create or replace) or edit (targeted replacement)
    operation: WriteOperation,
    /// File path to write to or edit
    path: String,
    /// Content to write (write operation)
    content: Option<String>,
    /// Text to replace (edit operation)
    old_text: Option<String>,
    /// Replacement text (edit operation)
    new_text: Option<String>,
}

/// file_write：整文件写入或按原文精确替换
pub struct FileWriteTool {
    fs: SafeFs,
}

impl FileWriteTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    async fn edit(&self, path: &str, old_text: &str, new_text: &str) -> Result<String, String> {
        let resolved = self.fs.resolve(path).map_err(|e| e.to_string())?;
        if !resolved.is_file() {
            return Err(FsError::NotAFile(path.to_string()).to_string());
        }
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("{} appears to be unreadable or binary: {}", path, e))?;
        let count = content.matches(old_text).count();
        if count == 0 {
            return Err(format!("The specified text was not found in {}", path));
        }
        self.fs
            .write_file(path, &content.replace(old_text, new_text))
            .await
            .map_err(|e| e.to_string())?;
        if count > 1 {
            Ok(format!(
                "Warning: Found {} occurrences. All were replaced in {}",
                count, path
            ))
        } else {
            Ok(format!("Successfully edited {}", path))
        }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write or edit files. Operations: write (create or completely replace a file with \
         content), edit (replace old_text with new_text in an existing file)."
    }

    fn input_schema(&self) -> Value {
        input_schema::<FileWriteArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: FileWriteArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        match args.operation {
            WriteOperation::Write => {
                let content = args
                    .content
                    .ok_or_else(|| "content parameter is required".to_string())?;
                tracing::info!(path = %args.path, chars = content.chars().count(), "file_write write");
                self.fs
                    .write_file(&args.path, &content)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolOutput::text(format!(
                    "Successfully wrote {} characters to {}",
                    content.chars().count(),
                    args.path
                )))
            }
            WriteOperation::Edit => {
                let (Some(old_text), Some(new_text)) = (args.old_text, args.new_text) else {
                    return Err(
                        "both old_text and new_text parameters are required for edit operation"
                            .to_string(),
                    );
                };
                if old_text.is_empty() {
                    return Err("old_text must not be empty".to_string());
                }
                tracing::info!(path = %args.path, "file_write edit");
                self.edit(&args.path, &old_text, &new_text)
                    .await
                    .map(ToolOutput::text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_with_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let tool = FileReadTool::new(dir.path());
        let out = tool
            .execute(json!({"operation": "read", "path": "a.txt", "max_lines": 2}))
            .await
            .unwrap();
        assert_eq!(out.text, "one\ntwo\n");
        let out = tool
            .execute(json!({"operation": "read", "path": "a.txt"}))
            .await
            .unwrap();
        assert_eq!(out.text, "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_list_with_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "").unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let tool = FileReadTool::new(dir.path());
        let out = tool
            .execute(json!({"operation": "list", "path": "."}))
            .await
            .unwrap();
        assert_eq!(out.text, "a.rs\nb.txt\nsub/");
        let out = tool
            .execute(json!({"operation": "list", "path": ".", "pattern": "*.rs"}))
            .await
            .unwrap();
        assert_eq!(out.text, "a.rs");
        let out = tool
            .execute(json!({"operation": "list", "path": ".", "pattern": "*.md"}))
            .await
            .unwrap();
        assert!(out.text.starts_with("No files found"));
    }

    #[tokio::test]
    async fn test_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = FileReadTool::new(dir.path());
        let err = read
            .execute(json!({"operation": "read", "path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.contains("escapes"));
        let write = FileWriteTool::new(dir.path());
        let err = write
            .execute(json!({"operation": "write", "path": "../x.txt", "content": "x"}))
            .await
            .unwrap_err();
        assert!(err.contains("escapes"));
    }

    #[tokio::test]
    async fn test_write_then_edit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileWriteTool::new(dir.path());
        let out = tool
            .execute(json!({"operation": "write", "path": "n/notes.txt", "content": "a b a"}))
            .await
            .unwrap();
        assert_eq!(out.text, "Successfully wrote 5 characters to n/notes.txt");

        let out = tool
            .execute(json!({"operation": "edit", "path": "n/notes.txt", "old_text": "b", "new_text": "c"}))
            .await
            .unwrap();
        assert_eq!(out.text, "Successfully edited n/notes.txt");

        let out = tool
            .execute(json!({"operation": "edit", "path": "n/notes.txt", "old_text": "a", "new_text": "z"}))
            .await
            .unwrap();
        assert!(out.text.starts_with("Warning: Found 2 occurrences"));
        let content = std::fs::read_to_string(dir.path().join("n/notes.txt")).unwrap();
        assert_eq!(content, "z c z");

        let err = tool
            .execute(json!({"operation": "edit", "path": "n/notes.txt", "old_text": "q", "new_text": "r"}))
            .await
            .unwrap_err();
        assert!(err.contains("not found"));
    }
}
