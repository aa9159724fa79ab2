// Build script to compile Slang shaders to SPIR-V
//
// One module, two entry points (vertMain / fragMain). The renderer loads
// shaders/<name>.spv at runtime.

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/triangle.slang");

    compile_shader("shaders/triangle.slang", "shaders/triangle.spv");
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // Check if slangc is available
    let result = Command::new("slangc")
        .arg(input_path)
        .args(["-target", "spirv", "-profile", "spirv_1_4", "-emit-spirv-directly"])
        .arg("-fvk-use-entrypoint-name")
        .args(["-entry", "vertMain", "-entry", "fragMain"])
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=slangc not found ({e}); {output} was not rebuilt");
            eprintln!("Install the Slang compiler or compile manually:");
            eprintln!(
                "  slangc {input} -target spirv -profile spirv_1_4 -emit-spirv-directly \
                 -fvk-use-entrypoint-name -entry vertMain -entry fragMain -o {output}"
            );
        }
    }
}
