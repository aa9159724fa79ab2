// Asset loading - compiled shaders and raw blobs from disk

use anyhow::{Context, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::backend::ShaderLoader;

/// Resolves logical asset names against a root directory.
#[derive(Debug, Clone)]
pub struct AssetManager {
    shader_dir: PathBuf,
}

impl AssetManager {
    pub fn new(shader_dir: impl Into<PathBuf>) -> Self {
        Self {
            shader_dir: shader_dir.into(),
        }
    }

    pub fn shader_path(&self, name: &str) -> PathBuf {
        self.shader_dir.join(format!("{name}.spv"))
    }

    /// Read a whole file as opaque bytes.
    pub fn load_bytes(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        std::fs::read(path).with_context(|| format!("Failed to read asset {:?}", path))
    }
}

impl ShaderLoader for AssetManager {
    fn load_shader(&self, name: &str) -> io::Result<Vec<u32>> {
        let path = self.shader_path(name);
        let mut file = File::open(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
        // Checks the magic number and fixes up endianness
        ash::util::read_spv(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("endura-assets-{}-{test}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn shader_names_map_to_spv_files() {
        let assets = AssetManager::new("shaders");
        assert_eq!(assets.shader_path("triangle"), Path::new("shaders").join("triangle.spv"));
    }

    #[test]
    fn loads_spirv_words() {
        let dir = scratch_dir("words");
        let words = [SPIRV_MAGIC, 0x0001_0300, 0, 8, 0];
        let mut file = File::create(dir.join("tiny.spv")).unwrap();
        for word in words {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        drop(file);

        let loaded = AssetManager::new(&dir).load_shader("tiny").unwrap();
        assert_eq!(loaded, words);
    }

    #[test]
    fn missing_shader_names_the_path() {
        let dir = scratch_dir("missing");
        let err = AssetManager::new(&dir).load_shader("nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("nope.spv"));
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let dir = scratch_dir("truncated");
        std::fs::write(dir.join("odd.spv"), [0x03, 0x02, 0x23]).unwrap();
        assert!(AssetManager::new(&dir).load_shader("odd").is_err());
    }

    #[test]
    fn load_bytes_reads_whole_file() {
        let dir = scratch_dir("bytes");
        std::fs::write(dir.join("blob.bin"), b"endura").unwrap();
        let assets = AssetManager::new(&dir);
        assert_eq!(assets.load_bytes(dir.join("blob.bin")).unwrap(), b"endura");
        assert!(assets.load_bytes(dir.join("absent.bin")).is_err());
    }
}
