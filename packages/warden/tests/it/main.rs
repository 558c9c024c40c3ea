//! Integration tests for the warden control plane.

mod helpers;

mod api {
    mod lifecycle;
    mod lsp;
    mod network;
    mod process;
    mod terminal;
}
