//! Generated gRPC stubs. See `build.rs` and the `proto/` directory.

pub mod faas {
    tonic::include_proto!("faas");
}

pub mod sched {
    tonic::include_proto!("sched");
}
