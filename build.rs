use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    built::write_built_file()?;

    println!("cargo:rerun-if-changed=proto/auth/v1/auth.proto");

    // Compile the protobuf contract in-process so builds do not depend on a system `protoc`.
    let descriptors = protox::compile(["auth/v1/auth.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(descriptors)?;

    Ok(())
}
