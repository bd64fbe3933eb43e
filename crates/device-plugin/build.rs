fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");
    tonic_build::configure().compile_protos(
        &[
            "proto/deviceplugin_v1beta1.proto",
            "proto/podresources_v1.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
