//! Integration tests for kiln-lib.

mod common;
mod deferred_tests;
mod dynamic_tests;
mod engine_tests;
