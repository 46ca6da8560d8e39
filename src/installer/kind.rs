//! The `detect(path) -> Kind` oracle: low-level file-type sniffing and
//! archive decoding. The default implementation here is intentionally
//! simple — magic bytes and a handful of extensions/shebangs — since the
//! real sniffing logic is treated as an external collaborator.

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::errors::Result;

/// Payload kinds the File Installer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A compiled ELF (or other native) binary.
    Binary,
    /// A shell/interpreted script (shebang line).
    Script,
    /// A docker-compose (or compatible) YAML project file.
    ComposeFile,
    /// A TypeScript source file.
    TypeScript,
    /// A Python source file.
    Python,
    /// A zstd-compressed frame wrapping one of the other kinds.
    Zstd,
}

impl Kind {
    /// True if `pull` is permitted for this kind.
    pub fn permits_pull(self) -> bool {
        matches!(self, Kind::ComposeFile | Kind::TypeScript | Kind::Python)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Binary => "binary",
            Kind::Script => "script",
            Kind::ComposeFile => "compose-file",
            Kind::TypeScript => "typescript",
            Kind::Python => "python",
            Kind::Zstd => "zstd",
        };
        f.write_str(s)
    }
}

/// The external sniffing oracle. Implementors may delegate to a real
/// archive/file-type detection library; the core depends only on this
/// trait.
#[async_trait]
pub trait KindDetector: Send + Sync {
    /// Inspect the file at `path` and classify it.
    async fn detect(&self, path: &std::path::Path) -> Result<Kind>;
}

/// Zstd magic number, RFC 8878 §3.1.1.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Magic-bytes/extension/shebang-based default detector.
pub struct DefaultKindDetector;

#[async_trait]
impl KindDetector for DefaultKindDetector {
    async fn detect(&self, path: &std::path::Path) -> Result<Kind> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut header = [0u8; 512];
        let n = file.read(&mut header).await?;
        let header = &header[..n];

        if header.len() >= 4 && header[..4] == ZSTD_MAGIC {
            return Ok(Kind::Zstd);
        }
        if header.starts_with(b"\x7fELF") {
            return Ok(Kind::Binary);
        }
        if header.starts_with(b"#!") {
            return Ok(Kind::Script);
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yml" | "yaml" => Ok(Kind::ComposeFile),
            "ts" | "tsx" | "mts" => Ok(Kind::TypeScript),
            "py" => Ok(Kind::Python),
            "sh" | "bash" => Ok(Kind::Script),
            _ => {
                // Fall back to sniffing the content for YAML-looking top
                // level keys commonly seen in compose files.
                let text = String::from_utf8_lossy(header);
                if text.contains("services:") {
                    Ok(Kind::ComposeFile)
                } else {
                    Ok(Kind::Binary)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_shebang_as_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        tokio::fs::write(&path, b"#!/bin/sh\necho hi\n").await.unwrap();
        let kind = DefaultKindDetector.detect(&path).await.unwrap();
        assert_eq!(kind, Kind::Script);
    }

    #[tokio::test]
    async fn detects_zstd_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.zst");
        let mut bytes = ZSTD_MAGIC.to_vec();
        bytes.extend_from_slice(b"junk");
        tokio::fs::write(&path, &bytes).await.unwrap();
        let kind = DefaultKindDetector.detect(&path).await.unwrap();
        assert_eq!(kind, Kind::Zstd);
    }

    #[tokio::test]
    async fn detects_compose_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker-compose.yml");
        tokio::fs::write(&path, b"services:\n  app:\n    image: nginx\n")
            .await
            .unwrap();
        let kind = DefaultKindDetector.detect(&path).await.unwrap();
        assert_eq!(kind, Kind::ComposeFile);
    }

    #[test]
    fn only_install_carrying_kinds_permit_pull() {
        assert!(Kind::ComposeFile.permits_pull());
        assert!(Kind::TypeScript.permits_pull());
        assert!(Kind::Python.permits_pull());
        assert!(!Kind::Binary.permits_pull());
        assert!(!Kind::Script.permits_pull());
    }
}
