//! Black-box verification of a built image.
//!
//! Layout:
//! - `container.rs`: launching containers and talking to them via `docker`
//! - `checks.rs`: the assertions run against a reachable container
//!
//! Nothing here runs inside the image; the end-to-end suite in
//! `tests/image_contract.rs` drives it when `IMAGE_NAME` is set.

pub mod checks;
pub mod container;

pub use container::{Container, ContainerSpec};
