fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored protoc binary, no system installation required
    let protoc_path = protoc_bin_vendored::protoc_bin_path()
        .expect("protoc-bin-vendored: no binary for this platform");
    std::env::set_var("PROTOC", protoc_path);

    // The inline branch of the oneof is recursive (DirEntry -> SubDirEntry -> DirEntry).
    prost_build::Config::new()
        .boxed(".cairn.backup.SubDirEntry.content.inline")
        .compile_protos(&["src/proto/backup.proto"], &["src/proto"])?;

    println!("cargo:rerun-if-changed=src/proto/backup.proto");
    Ok(())
}
