use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use shaderc::{CompileOptions, Compiler, EnvVersion, ShaderKind, TargetEnv};
use std::{env, fs, path::Path};

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=shaders");

    compile_shaders()?;

    Ok(())
}

fn compile_shaders() -> Result<()> {
    let cargo_manifest_dir = env::var("CARGO_MANIFEST_DIR")?;
    let shaders_in_dir = Path::new(&cargo_manifest_dir).join("shaders");
    let shaders_out_dir = Path::new(&cargo_manifest_dir).join("shaders-built");
    fs::create_dir_all(&shaders_out_dir)?;

    let compiler = Compiler::new().ok_or_eyre("Failed to create shader compiler")?;
    let mut options = CompileOptions::new().ok_or_eyre("Failed to create shader compile options")?;
    options.set_target_env(TargetEnv::Vulkan, EnvVersion::Vulkan1_2 as u32);

    for entry in fs::read_dir(shaders_in_dir)? {
        let entry = entry?;
        let path = entry.path();

        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_eyre(format!("Shader file has no extension: {:?}", path))?;
        let shader_kind = match ext {
            "vert" => ShaderKind::Vertex,
            "frag" => ShaderKind::Fragment,
            _ => {
                log::warn!("Skipping non-GLSL file: {:?}", path);
                continue;
            }
        };

        let file_name = path
            .file_name()
            .ok_or_eyre("Shader file has no name")?
            .to_str()
            .ok_or_eyre("Shader file name is not valid UTF-8")?;

        // Compiling with combined image samplers intact, the material layout depends on them
        let source = fs::read_to_string(&path)?;
        let artifact = compiler.compile_into_spirv(
            &source,
            shader_kind,
            file_name,
            "main",
            Some(&options),
        )?;
        if artifact.get_num_warnings() > 0 {
            println!("cargo:warning={}: {}", file_name, artifact.get_warning_messages());
        }

        // `triangle.vert` lands as `triangle.vert.spv`
        let output_filepath = shaders_out_dir.join(format!("{}.spv", file_name));
        fs::write(output_filepath, bytemuck::cast_slice::<u32, u8>(artifact.as_binary()))?;
    }

    Ok(())
}
