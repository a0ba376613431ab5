//! Build script.
//!
//! The etcd v3 and peer wire messages are declared with
//! `#[derive(prost::Message)]` in src/adapters/etcd/proto.rs, so there is
//! no protobuf codegen step.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
}
