//! Manifest bundles compiled into the binary from `manifests/`.

include!(concat!(env!("OUT_DIR"), "/embedded_manifests.rs"));
