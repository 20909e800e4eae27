// Shader module loading
//
// Shaders are precompiled SPIR-V read from disk when the pipeline is built.

use anyhow::Result;
use ash::vk;
use std::fs::File;
use std::path::Path;

use crate::error::EngineError;

/// Read SPIR-V words from `path`
///
/// `read_spv` rejects lengths that aren't a multiple of four and fixes up
/// alignment and endianness; nothing else is checked here.
pub fn read_spirv(path: &Path) -> Result<Vec<u32>, EngineError> {
    let shader_error = |source| EngineError::Shader {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(shader_error)?;
    ash::util::read_spv(&mut file).map_err(shader_error)
}

/// Load a SPIR-V file and create a shader module from it
pub fn load_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded shader {:?} ({} words)", path, code.len());

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    let module = unsafe { device.create_shader_module(&create_info, None) }
        .map_err(EngineError::creation("shader module"))?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn temp_file(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn reads_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let path = temp_file("triangle-present-valid.spv", &bytes);

        let words = read_spirv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_bytecode() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        let path = temp_file("triangle-present-truncated.spv", &bytes);

        let err = read_spirv(&path).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, EngineError::Shader { .. }));
    }

    #[test]
    fn missing_file_names_the_path() {
        let path = std::env::temp_dir().join("triangle-present-missing.spv");
        let err = read_spirv(&path).unwrap_err();
        assert!(err.to_string().contains("triangle-present-missing.spv"));
    }
}
