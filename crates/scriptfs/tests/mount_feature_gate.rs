//! Emit a warning when FUSE-dependent tests are skipped.
//!
//! The real mount tests live in `mount_integration.rs` and are gated behind
//! `#[cfg(feature = "fuse")]`. Without the feature this prints a visible
//! notice instead, so the missing coverage is not silently hidden.

#[cfg(not(feature = "fuse"))]
#[test]
fn fuse_tests_skipped_warning() {
    eprintln!(
        "\n\x1b[33mwarning\x1b[0m: Skipping scriptfs mount tests: built without `fuse` feature.\n\
         To run them, build with: cargo test --features fuse -- --ignored\n"
    );
}
