// Shader module loading
//
// Shaders are compiled ahead of time by glslc (see build.rs) and read
// from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use super::VulkanDevice;

/// Read a SPIR-V file from disk as aligned 32-bit words
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).with_context(|| {
        format!(
            "Failed to open shader {:?}. Compile it with: glslc <source> -o {:?}",
            path, path
        )
    })?;

    read_spirv(&mut file).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Decode SPIR-V bytecode, checking size and magic number
pub fn read_spirv<R: Read + Seek>(reader: &mut R) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(reader)?;
    Ok(words)
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Load a SPIR-V file and wrap it in a shader module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = load_spirv(path)?;
    log::debug!("Loaded shader {:?} ({} words)", path, code.len());
    create_shader_module(device, &code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn reads_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = read_spirv(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = vec![0x03, 0x02, 0x23, 0x07, 0x00];
        assert!(read_spirv(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn missing_file_mentions_glslc() {
        let err = load_spirv(Path::new("shaders/does-not-exist.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("glslc"));
    }
}
