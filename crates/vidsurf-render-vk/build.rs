use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Full-screen quad as a 4-vertex triangle strip; no vertex buffer.
    let vs_src = r#"
#version 450
layout(location = 0) out vec2 vUv;

void main() {
    vec2 uv = vec2(gl_VertexIndex & 1, gl_VertexIndex >> 1);
    vUv = uv;
    gl_Position = vec4(uv * 2.0 - 1.0, 0.0, 1.0);
}
"#;

    // Y'CbCr to RGB happens in the immutable sampler.
    let fs_src = r#"
#version 450
layout(set = 0, binding = 0) uniform sampler2D uFrame;
layout(location = 0) in vec2 vUv;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = texture(uFrame, vUv);
}
"#;

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let vs_spv = comp
        .compile_into_spirv(
            vs_src,
            shaderc::ShaderKind::Vertex,
            "quad.vert",
            "main",
            Some(&opts),
        )
        .unwrap();

    let fs_spv = comp
        .compile_into_spirv(
            fs_src,
            shaderc::ShaderKind::Fragment,
            "quad.frag",
            "main",
            Some(&opts),
        )
        .unwrap();

    fs::write(out.join("quad.vert.spv"), vs_spv.as_binary_u8()).unwrap();
    fs::write(out.join("quad.frag.spv"), fs_spv.as_binary_u8()).unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}
