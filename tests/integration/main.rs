//! End-to-end tests against real git repositories in temp dirs.

mod cli;
mod coordinator;
mod support;
