use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Vertex and fragment modules of one pipeline kind
pub struct GraphicsShader {
    pub vert_mod: vk::ShaderModule,
    pub frag_mod: vk::ShaderModule,
    device: Arc<ash::Device>,
}

impl GraphicsShader {
    /// Loads `{dir}/{name}.vert.spv` and `{dir}/{name}.frag.spv`
    pub fn new(shader_dir: &Path, shader_name: &str, device: Arc<ash::Device>) -> Result<Self> {
        let (vert_path, frag_path) = stage_paths(shader_dir, shader_name);

        let vert_mod = create_shader_module(&vert_path, &device)?;
        let frag_mod = match create_shader_module(&frag_path, &device) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_mod, None) };
                return Err(e);
            }
        };

        Ok(Self { vert_mod, frag_mod, device })
    }
}

impl Drop for GraphicsShader {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.vert_mod, None);
            self.device.destroy_shader_module(self.frag_mod, None);
        }
    }
}

pub fn stage_paths(shader_dir: &Path, shader_name: &str) -> (PathBuf, PathBuf) {
    (
        shader_dir.join(format!("{}.vert.spv", shader_name)),
        shader_dir.join(format!("{}.frag.spv", shader_name)),
    )
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Reinterprets a SPIR-V file as words, rejecting anything that is not SPIR-V
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(eyre!("SPIR-V size {} is not a non-zero multiple of 4", bytes.len()));
    }
    // Copy into words so the result is aligned regardless of the file buffer
    let words = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<_>>();
    if words[0] != SPIRV_MAGIC {
        return Err(eyre!("Bad SPIR-V magic number {:#010x}", words[0]));
    }
    Ok(words)
}

fn create_shader_module(filepath: &Path, device: &ash::Device) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(filepath)
        .wrap_err_with(|| format!("Failed to read shader {}", filepath.display()))?;
    let code = parse_spirv(&bytes)
        .wrap_err_with(|| format!("Malformed shader {}", filepath.display()))?;

    let shader_module_info = vk::ShaderModuleCreateInfo::default().code(&code);

    let shader_module = unsafe { device.create_shader_module(&shader_module_info, None)? };
    log::debug!("Loaded shader module {}", filepath.display());
    Ok(shader_module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_build_output_naming() {
        let (vert, frag) = stage_paths(Path::new("shaders-built"), "pbr3d");
        assert_eq!(vert, Path::new("shaders-built/pbr3d.vert.spv"));
        assert_eq!(frag, Path::new("shaders-built/pbr3d.frag.spv"));
    }

    #[test]
    fn accepts_spirv_header() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0500u32.to_le_bytes());
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0500]);
    }

    #[test]
    fn rejects_malformed_bytecode() {
        assert!(parse_spirv(&[]).is_err());
        assert!(parse_spirv(&[0x03, 0x02, 0x23]).is_err());
        assert!(parse_spirv(&[0, 0, 0, 0, 1, 2, 3, 4]).is_err());
    }
}
