use std::env;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_PATH");

    // The scripted engine needs nothing native
    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    let llama_cpp_path = match env::var_os("LLAMA_CPP_PATH") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap()).join("llama.cpp"),
    };

    if !llama_cpp_path.exists() {
        println!("cargo:warning=llama.cpp not found at {}", llama_cpp_path.display());
        println!("cargo:warning=Clone it next to Cargo.toml or set LLAMA_CPP_PATH to a checkout");
        return;
    }

    if !llama_cpp_path.join("include").join("llama.h").exists() {
        println!("cargo:warning=llama.h not found in llama.cpp include directory");
        return;
    }

    build_llama_cpp(&llama_cpp_path);
}

fn build_llama_cpp(llama_cpp_path: &Path) {
    let dst = cmake::Config::new(llama_cpp_path)
        .define("GGML_NATIVE", "OFF") // broader compatibility
        .define("GGML_CUDA", "OFF")
        .define("GGML_METAL", "OFF")
        .define("GGML_OPENMP", "ON")
        .define("BUILD_SHARED_LIBS", "ON")
        .define("LLAMA_BUILD_TESTS", "OFF")
        .define("LLAMA_BUILD_EXAMPLES", "ON") // the llava helper library lives there
        .define("LLAMA_BUILD_SERVER", "OFF")
        .define("LLAMA_CURL", "OFF")
        .profile("Release")
        .build();

    println!("cargo:rustc-link-search=native={}/lib", dst.display());
    println!("cargo:rustc-link-search=native={}/lib64", dst.display());
    println!("cargo:rustc-link-search=native={}/build/bin", dst.display());
    println!("cargo:rustc-link-lib=dylib=llama");
    println!("cargo:rustc-link-lib=dylib=ggml");
    println!("cargo:rustc-link-lib=dylib=llava_shared");

    #[cfg(target_os = "macos")]
    {
        println!("cargo:rustc-link-lib=framework=Accelerate");
    }

    #[cfg(target_family = "unix")]
    {
        println!("cargo:rustc-link-lib=dylib=stdc++");
    }
}
