fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("protoc not found");
    // SAFETY: build scripts run single-threaded before any codegen work starts.
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }
    let includes = &["proto"];

    // The daemon only needs the client; the server half is used by the
    // in-process registry in the gRPC integration tests.
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/registry.proto"], includes)
        .expect("failed to compile registry.proto");

    println!("cargo:rerun-if-changed=proto/registry.proto");
}
